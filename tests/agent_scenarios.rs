//! End-to-end agent loop scenarios against a scripted provider and a stub
//! executor (no network, no container runtime).

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use toolforge::agent::{AgentLoop, QueryOptions};
use toolforge::config::Config;
use toolforge::errors::{ToolforgeError, ToolforgeResult};
use toolforge::keys::KeyPool;
use toolforge::providers::{LlmClient, LlmProvider};
use toolforge::registry::ToolRegistry;
use toolforge::sandbox::{ExecutionRecord, ExecutionRequest, ToolExecutor};
use toolforge::store::ToolStore;

/// Provider that pops one scripted response per call and records the
/// credentials it was handed.
struct ScriptedProvider {
    responses: Mutex<VecDeque<ToolforgeResult<String>>>,
    credentials_seen: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    fn new(responses: Vec<ToolforgeResult<String>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            credentials_seen: Mutex::new(Vec::new()),
        })
    }

    fn ok(responses: Vec<Value>) -> Arc<Self> {
        Self::new(responses.into_iter().map(|v| Ok(v.to_string())).collect())
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, credential: &str, _prompt: &str) -> ToolforgeResult<String> {
        self.credentials_seen
            .lock()
            .unwrap()
            .push(credential.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ToolforgeError::LlmFatal("script exhausted".to_string())))
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

#[derive(Clone)]
enum StubOutcome {
    Success(Value),
    ToolError(String),
}

/// Executor with per-tool scripted outcomes. When `sandbox_ok` is false the
/// sandboxed path reports a substrate failure, which exercises the direct
/// fallback in the trait's `execute`.
struct StubExecutor {
    sandbox_ok: bool,
    outcomes: Mutex<HashMap<String, VecDeque<StubOutcome>>>,
}

impl StubExecutor {
    fn new(sandbox_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            sandbox_ok,
            outcomes: Mutex::new(HashMap::new()),
        })
    }

    fn script(&self, tool: &str, outcomes: Vec<StubOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(tool.to_string(), outcomes.into());
    }

    fn run(&self, req: &ExecutionRequest, in_sandbox: bool) -> ExecutionRecord {
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&req.tool_name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(StubOutcome::ToolError("unscripted tool".to_string()));
        match outcome {
            StubOutcome::Success(result) => ExecutionRecord {
                success: true,
                result,
                error: None,
                traceback: None,
                executed_in_sandbox: in_sandbox,
                docker_fallback: false,
                exit_code: Some(0),
                stdout: None,
                timestamp: chrono::Utc::now(),
            },
            StubOutcome::ToolError(error) => ExecutionRecord {
                success: false,
                result: Value::Null,
                error: Some(error),
                traceback: Some("Traceback (most recent call last): ...".to_string()),
                executed_in_sandbox: in_sandbox,
                docker_fallback: false,
                exit_code: Some(1),
                stdout: None,
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

#[async_trait]
impl ToolExecutor for StubExecutor {
    fn sandbox_available(&self) -> bool {
        true
    }

    async fn execute_sandboxed(
        &self,
        req: &ExecutionRequest,
    ) -> ToolforgeResult<ExecutionRecord> {
        if !self.sandbox_ok {
            return Err(ToolforgeError::SandboxSubstrate(
                "Cannot connect to the Docker daemon".to_string(),
            ));
        }
        Ok(self.run(req, true))
    }

    async fn execute_direct(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord> {
        Ok(self.run(req, false))
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    agent: AgentLoop,
    registry: Arc<ToolRegistry>,
    store: Arc<ToolStore>,
    provider: Arc<ScriptedProvider>,
    opts: QueryOptions,
}

fn harness_with_keys(
    provider: Arc<ScriptedProvider>,
    executor: Arc<dyn ToolExecutor>,
    keys: usize,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::test_defaults(dir.path());

    let creds = (1..=keys).map(|i| format!("key-{i}")).collect();
    let pool = Arc::new(KeyPool::new(creds, Duration::ZERO, Duration::from_secs(60)).unwrap());
    let llm = Arc::new(LlmClient::new(pool, provider.clone(), Duration::ZERO));
    let registry = Arc::new(ToolRegistry::open(config.storage.tools_dir.clone()).unwrap());
    let store = Arc::new(ToolStore::open(&config.storage.db_path).unwrap());

    let opts = QueryOptions::from_config(&config.agent);
    let agent = AgentLoop::new(
        llm,
        registry.clone(),
        store.clone(),
        executor,
        config.agent.clone(),
        Duration::from_secs(30),
    );

    Harness {
        _dir: dir,
        agent,
        registry,
        store,
        provider,
        opts,
    }
}

fn harness(provider: Arc<ScriptedProvider>, executor: Arc<dyn ToolExecutor>) -> Harness {
    harness_with_keys(provider, executor, 1)
}

async fn register_tool(h: &Harness, name: &str, required: &[&str]) {
    let manifest = json!({
        "name": name,
        "entrypoint": name,
        "description": format!("{name} test tool"),
        "category": "computation",
        "tags": ["math"],
        "required_params": required,
    });
    let dir = h._dir.path().join("tools");
    std::fs::write(
        dir.join(format!("{name}.json")),
        serde_json::to_string(&manifest).unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join(format!("{name}.py")),
        format!("def {name}(**kwargs):\n    return kwargs\n"),
    )
    .unwrap();
    h.registry.reload().await.unwrap();
}

fn history_text(outcome: &toolforge::agent::QueryOutcome) -> String {
    outcome
        .conversation_history
        .iter()
        .map(|h| h.content.clone())
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn direct_answer_without_tools() {
    let provider = ScriptedProvider::ok(vec![json!({
        "state": "respond",
        "reasoning": "general knowledge",
        "action": {"final_answer": "The capital of France is Paris.", "confidence": "high"}
    })]);
    let h = harness(provider, StubExecutor::new(true));

    let outcome = h
        .agent
        .process("What is the capital of France?", &h.opts, None)
        .await;

    assert!(outcome.success);
    assert!(outcome.iterations <= 2);
    assert!(outcome.response.unwrap().contains("Paris"));
}

#[tokio::test]
async fn existing_tool_answers_in_two_iterations() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "use_tool",
            "reasoning": "multiply solves this",
            "action": {"tool_name": "multiply", "params": {"a": 23, "b": 19}}
        }),
        json!({
            "state": "respond",
            "reasoning": "tool returned the product",
            "action": {"final_answer": "23 times 19 is 437."}
        }),
    ]);
    let executor = StubExecutor::new(true);
    executor.script("multiply", vec![StubOutcome::Success(json!({"result": 437}))]);
    let h = harness(provider, executor);
    register_tool(&h, "multiply", &["a", "b"]).await;

    let outcome = h.agent.process("What is 23 times 19?", &h.opts, None).await;

    assert!(outcome.success);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.actions_taken[0].action, "use_tool");
    assert!(outcome.response.as_deref().unwrap().contains("437"));
    assert!(history_text(&outcome).contains("executed successfully"));
}

#[tokio::test]
async fn authoring_path_creates_persists_and_uses_tool() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "search_tools",
            "reasoning": "check for an existing reverser",
            "action": {"query": "reverse a string"}
        }),
        json!({
            "state": "create_tool",
            "reasoning": "no tool exists",
            "action": {
                "name": "reverse_text",
                "description": "Reverse a string of text",
                "category": "text",
                "required_params": ["text"],
                "optional_params": {},
                "tags": ["string", "reverse"],
                "code": "result = params['text'][::-1]"
            }
        }),
        json!({
            "state": "use_tool",
            "reasoning": "use the new tool",
            "action": {"tool_name": "reverse_text", "params": {"text": "hello"}}
        }),
        json!({
            "state": "exit_response",
            "reasoning": "done",
            "action": {"final_answer": "Reversed: olleh", "confidence": "high"}
        }),
    ]);
    let executor = StubExecutor::new(true);
    executor.script(
        "reverse_text",
        vec![StubOutcome::Success(json!({"result": "olleh"}))],
    );
    let h = harness(provider, executor);

    let outcome = h
        .agent
        .process("Reverse the string 'hello'", &h.opts, None)
        .await;

    assert!(outcome.success, "outcome: {outcome:?}");
    assert_eq!(outcome.iterations, 4);
    assert!(outcome.response.unwrap().contains("olleh"));

    // Persisted in the store and mirrored into the registry.
    let stored = h.store.get_by_name("reverse_text").unwrap().unwrap();
    assert!(stored.code.contains("[::-1]"));
    assert!(h.registry.get("reverse_text").await.is_some());
}

#[tokio::test]
async fn failing_tool_is_quarantined_after_two_attempts() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "use_tool",
            "reasoning": "try the flaky tool",
            "action": {"tool_name": "flaky", "params": {"x": 1}}
        }),
        json!({
            "state": "respond",
            "reasoning": "give up on the tool",
            "action": {"final_answer": "The tool is broken; I could not compute this."}
        }),
    ]);
    let executor = StubExecutor::new(true);
    executor.script(
        "flaky",
        vec![
            StubOutcome::ToolError("boom 1".to_string()),
            StubOutcome::ToolError("boom 2".to_string()),
        ],
    );
    let h = harness(provider, executor.clone());
    register_tool(&h, "flaky", &["x"]).await;

    let outcome = h.agent.process("Use flaky for me", &h.opts, None).await;
    assert!(outcome.success);

    assert!(h.registry.is_bugged("flaky").await);
    let record = h.registry.bug_record("flaky").await.unwrap();
    assert_eq!(record.failures.len(), 2);

    let text = history_text(&outcome);
    assert!(text.contains("marked as BUGGED"));
    assert!(text.contains("DIFFERENT name"));

    // Further executions fail fast with the bugged error kind.
    let err = h
        .registry
        .execute(
            "flaky",
            json!({"x": 1}),
            executor.as_ref() as &dyn ToolExecutor,
            false,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ToolforgeError::Bugged { .. }));
}

#[tokio::test]
async fn sandbox_substrate_failure_falls_back_to_direct() {
    let executor = StubExecutor::new(false);
    executor.script("multiply", vec![StubOutcome::Success(json!({"result": 6}))]);
    let provider = ScriptedProvider::ok(vec![]);
    let h = harness(provider, executor.clone());
    register_tool(&h, "multiply", &["a", "b"]).await;

    let record = h
        .registry
        .execute(
            "multiply",
            json!({"a": 2, "b": 3}),
            executor.as_ref() as &dyn ToolExecutor,
            true,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert!(record.success);
    assert!(!record.executed_in_sandbox);
    assert!(record.docker_fallback);
    assert_eq!(record.result["result"], 6);
}

#[tokio::test(start_paused = true)]
async fn key_rotation_recovers_from_overload() {
    let provider = ScriptedProvider::new(vec![
        Err(ToolforgeError::LlmTransient("429 rate limit".to_string())),
        Err(ToolforgeError::LlmTransient("503 overloaded".to_string())),
        Ok(json!({
            "state": "respond",
            "reasoning": "recovered",
            "action": {"final_answer": "All good now."}
        })
        .to_string()),
    ]);
    let h = harness_with_keys(provider.clone(), StubExecutor::new(true), 3);

    let outcome = h.agent.process("Are you there?", &h.opts, None).await;

    assert!(outcome.success);
    assert_eq!(
        provider.credentials_seen.lock().unwrap().as_slice(),
        ["key-1", "key-2", "key-3"]
    );
}

#[tokio::test(start_paused = true)]
async fn all_keys_overloaded_surfaces_error_type() {
    let provider = ScriptedProvider::new(
        (0..4)
            .map(|_| Err(ToolforgeError::LlmTransient("quota".to_string())))
            .collect(),
    );
    let h = harness_with_keys(provider, StubExecutor::new(true), 2);

    let outcome = h.agent.process("hello", &h.opts, None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_type.as_deref(), Some("all_keys_overloaded"));
}

#[tokio::test]
async fn single_iteration_budget_is_bounded_failure() {
    let provider = ScriptedProvider::ok(vec![json!({
        "state": "search_tools",
        "reasoning": "need a tool",
        "action": {"query": "anything"}
    })]);
    let h = harness(provider, StubExecutor::new(true));
    let mut opts = h.opts.clone();
    opts.max_iterations = 1;

    let outcome = h.agent.process("Reverse 'abc'", &opts, None).await;

    assert!(!outcome.success);
    assert_eq!(outcome.error_type.as_deref(), Some("bounded_iterations"));
    assert_eq!(outcome.iterations, 1);
}

#[tokio::test]
async fn placeholder_code_is_rejected_without_persistence() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "search_tools",
            "reasoning": "look first",
            "action": {"query": "frobnicate"}
        }),
        json!({
            "state": "create_tool",
            "reasoning": "make one",
            "action": {
                "name": "frobnicate",
                "description": "does things",
                "code": "# TODO implement this later\nresult = None"
            }
        }),
        json!({
            "state": "respond",
            "reasoning": "cannot do it",
            "action": {"final_answer": "Unable to build a working tool."}
        }),
    ]);
    let h = harness(provider, StubExecutor::new(true));

    let outcome = h.agent.process("Frobnicate the widget", &h.opts, None).await;

    assert!(outcome.success);
    assert!(h.store.get_by_name("frobnicate").unwrap().is_none());
    assert!(history_text(&outcome).contains("forbidden pattern"));
}

#[tokio::test]
async fn create_without_prior_search_is_rejected() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "create_tool",
            "reasoning": "jump straight to creation",
            "action": {
                "name": "hasty_tool",
                "description": "too eager",
                "code": "result = 42"
            }
        }),
        json!({
            "state": "respond",
            "reasoning": "ok",
            "action": {"final_answer": "Understood."}
        }),
    ]);
    let h = harness(provider, StubExecutor::new(true));

    let outcome = h.agent.process("Make me a tool", &h.opts, None).await;

    assert!(h.store.get_by_name("hasty_tool").unwrap().is_none());
    assert!(history_text(&outcome).contains("search for existing tools first"));
}

#[tokio::test]
async fn composite_signal_requires_execute_tool_call() {
    let provider = ScriptedProvider::ok(vec![
        json!({
            "state": "search_tools",
            "reasoning": "see what exists",
            "action": {"query": "double a number"}
        }),
        json!({
            "state": "analyze_tools_for_composite",
            "reasoning": "inspect candidates",
            "action": {"tool_names": ["double"]}
        }),
        json!({
            "state": "create_tool",
            "reasoning": "combine them",
            "action": {
                "name": "quadruple",
                "description": "doubles twice",
                "code": "result = params['n'] * 4"
            }
        }),
        json!({
            "state": "respond",
            "reasoning": "done",
            "action": {"final_answer": "Finished."}
        }),
    ]);
    let h = harness(provider, StubExecutor::new(true));
    h.store
        .create(toolforge::store::NewTool {
            name: "double".to_string(),
            description: "Double a number".to_string(),
            code: "result = params['n'] * 2".to_string(),
            category: Some("computation".to_string()),
            required_params: vec!["n".to_string()],
            optional_params: json!({}),
            return_schema: None,
            examples: None,
            tags: vec![],
            requirements: vec![],
        })
        .unwrap();

    let outcome = h.agent.process("Quadruple 5", &h.opts, None).await;

    // The create was rejected because the code never calls execute_tool.
    assert!(h.store.get_by_name("quadruple").unwrap().is_none());
    let text = history_text(&outcome);
    assert!(text.contains("Full source of tool 'double'"));
    assert!(text.contains("execute_tool"));
}

#[tokio::test]
async fn parse_failure_consumes_iteration_and_continues() {
    let provider = ScriptedProvider::new(vec![
        Ok("I think the answer might be 42, but let me see.".to_string()),
        Ok(json!({
            "state": "respond",
            "reasoning": "second try is valid",
            "action": {"final_answer": "42"}
        })
        .to_string()),
    ]);
    let h = harness(provider, StubExecutor::new(true));

    let outcome = h.agent.process("What is 6 times 7?", &h.opts, None).await;

    assert!(outcome.success);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.actions_taken[0].action, "parse_failure");
}

#[tokio::test]
async fn streaming_events_arrive_in_order() {
    let provider = ScriptedProvider::ok(vec![json!({
        "state": "respond",
        "reasoning": "direct",
        "action": {"final_answer": "Paris"}
    })]);
    let h = harness(provider, StubExecutor::new(true));

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let outcome = h
        .agent
        .process("capital of France?", &h.opts, Some(tx))
        .await;
    assert!(outcome.success);

    let mut tags = Vec::new();
    while let Ok(event) = rx.try_recv() {
        tags.push(
            serde_json::to_value(&event).unwrap()["type"]
                .as_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(tags.first().map(String::as_str), Some("start"));
    assert!(tags.contains(&"iteration".to_string()));
    assert!(tags.contains(&"stream".to_string()));
    assert!(tags.contains(&"response_complete".to_string()));
    assert_eq!(tags.last().map(String::as_str), Some("final"));
}
