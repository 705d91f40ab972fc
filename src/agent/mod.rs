//! The bounded reason/act loop.
//!
//! One `process()` call drives the LLM through at most `max_iterations`
//! decisions over {respond, search_tools, use_tool, create_tool,
//! analyze_tools_for_composite, exit_response}. Tool failures feed the bug
//! quarantine and come back to the model as system observations; only the
//! terminal answer (or a structured failure) reaches the caller.

mod events;
mod prompt;
mod state;

pub use events::AgentEvent;
pub use prompt::{build_continuation_prompt, build_initial_prompt, SYSTEM_PROMPT};
pub use state::{find_forbidden_pattern, parse_decision, AgentAction, AgentDecision, ToolSpec};

use crate::config::AgentConfig;
use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::providers::LlmClient;
use crate::registry::{ToolManifest, ToolRegistry};
use crate::sandbox::ToolExecutor;
use crate::store::{NewTool, ToolStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

/// Attempts per tool invocation before quarantine.
const TOOL_ATTEMPTS: usize = 2;

/// One prompt-visible line of the internal conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl HistoryEntry {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// Per-query knobs, defaulted from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub max_iterations: usize,
    pub max_tools: usize,
    pub use_sandbox: bool,
    pub history: Vec<HistoryEntry>,
}

impl QueryOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            max_tools: config.max_tools,
            use_sandbox: true,
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub iteration: usize,
    pub action: String,
    pub detail: Value,
}

/// Terminal result of one query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    pub iterations: usize,
    pub actions_taken: Vec<ActionRecord>,
    pub conversation_history: Vec<HistoryEntry>,
}

pub struct AgentLoop {
    llm: Arc<LlmClient>,
    registry: Arc<ToolRegistry>,
    store: Arc<ToolStore>,
    executor: Arc<dyn ToolExecutor>,
    config: AgentConfig,
    tool_timeout: Duration,
}

async fn emit(events: &Option<Sender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event).await;
    }
}

fn first_function_name(code: &str) -> Option<String> {
    let re = Regex::new(r"(?m)^def\s+(\w+)\s*\(").expect("static regex is valid");
    re.captures(code).map(|c| c[1].to_string())
}

impl AgentLoop {
    pub fn new(
        llm: Arc<LlmClient>,
        registry: Arc<ToolRegistry>,
        store: Arc<ToolStore>,
        executor: Arc<dyn ToolExecutor>,
        config: AgentConfig,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            llm,
            registry,
            store,
            executor,
            config,
            tool_timeout,
        }
    }

    /// Process one query to completion (terminal answer, structured
    /// failure, or iteration exhaustion).
    pub async fn process(
        &self,
        question: &str,
        opts: &QueryOptions,
        events: Option<Sender<AgentEvent>>,
    ) -> QueryOutcome {
        let mut history = opts.history.clone();
        let mut actions: Vec<ActionRecord> = Vec::new();
        let mut searched = false;
        let mut composite_signaled = false;

        emit(
            &events,
            AgentEvent::Start {
                question: question.to_string(),
            },
        )
        .await;

        let mut iteration = 0;
        while iteration < opts.max_iterations {
            iteration += 1;
            info!("agent iteration {iteration}/{}", opts.max_iterations);
            emit(
                &events,
                AgentEvent::Iteration {
                    iteration,
                    max_iterations: opts.max_iterations,
                },
            )
            .await;

            let prompt = if iteration == 1 {
                let tool_context = self
                    .registry
                    .tools_context(question, opts.max_tools)
                    .await;
                build_initial_prompt(question, &tool_context, &history)
            } else {
                build_continuation_prompt(question, &history)
            };

            let response_text = match self.call_llm(&prompt, &events).await {
                Ok(text) => text,
                Err(err) => {
                    let error_type = match &err {
                        ToolforgeError::LlmTransient(_) => "all_keys_overloaded",
                        ToolforgeError::LlmFatal(_) => "api_error",
                        _ => "no_response",
                    };
                    emit(
                        &events,
                        AgentEvent::Error {
                            error: err.to_string(),
                            error_type: error_type.to_string(),
                        },
                    )
                    .await;
                    return QueryOutcome {
                        success: false,
                        response: None,
                        reasoning: None,
                        error: Some(err.to_string()),
                        error_type: Some(error_type.to_string()),
                        iterations: iteration,
                        actions_taken: actions,
                        conversation_history: history,
                    };
                }
            };

            let decision = match parse_decision(&response_text) {
                Ok(decision) => decision,
                Err(err) => {
                    warn!("unparseable model response: {err}");
                    actions.push(ActionRecord {
                        iteration,
                        action: "parse_failure".to_string(),
                        detail: json!({ "error": err.to_string() }),
                    });
                    history.push(HistoryEntry::system(format!(
                        "Your previous response was not valid JSON ({err}). Respond with ONLY \
                         valid JSON following the required schema."
                    )));
                    continue;
                }
            };

            emit(
                &events,
                AgentEvent::State {
                    state: decision.state.clone(),
                },
            )
            .await;
            if !decision.reasoning.is_empty() {
                emit(
                    &events,
                    AgentEvent::Thinking {
                        reasoning: decision.reasoning.clone(),
                    },
                )
                .await;
            }

            match decision.action {
                AgentAction::Respond { answer, confidence } => {
                    let response = answer.unwrap_or_else(|| {
                        "I was unable to generate a proper response. Please try rephrasing \
                         your question."
                            .to_string()
                    });
                    actions.push(ActionRecord {
                        iteration,
                        action: decision.state.clone(),
                        detail: json!({ "confidence": confidence }),
                    });
                    emit(
                        &events,
                        AgentEvent::Final {
                            response: response.clone(),
                            iterations: iteration,
                        },
                    )
                    .await;
                    return QueryOutcome {
                        success: true,
                        response: Some(response),
                        reasoning: Some(decision.reasoning),
                        error: None,
                        error_type: None,
                        iterations: iteration,
                        actions_taken: actions,
                        conversation_history: history,
                    };
                }
                AgentAction::SearchTools { query } => {
                    actions.push(ActionRecord {
                        iteration,
                        action: decision.state.clone(),
                        detail: json!({ "query": query }),
                    });
                    emit(
                        &events,
                        AgentEvent::Action {
                            action: "search_tools".to_string(),
                            detail: json!({ "query": query }),
                        },
                    )
                    .await;
                    self.handle_search(question, &query, &decision.reasoning, opts, &mut history)
                        .await;
                    searched = true;
                }
                AgentAction::UseTool { tool_name, params } => {
                    actions.push(ActionRecord {
                        iteration,
                        action: decision.state.clone(),
                        detail: json!({ "tool_name": tool_name, "params": params }),
                    });
                    emit(
                        &events,
                        AgentEvent::Action {
                            action: "use_tool".to_string(),
                            detail: json!({ "tool_name": tool_name, "params": params }),
                        },
                    )
                    .await;
                    self.handle_use_tool(
                        &tool_name,
                        params,
                        &decision.reasoning,
                        opts,
                        &mut history,
                        &events,
                    )
                    .await;
                }
                AgentAction::CreateTool { spec } => {
                    actions.push(ActionRecord {
                        iteration,
                        action: decision.state.clone(),
                        detail: json!({ "name": spec.name }),
                    });
                    emit(
                        &events,
                        AgentEvent::Action {
                            action: "create_tool".to_string(),
                            detail: json!({ "name": spec.name }),
                        },
                    )
                    .await;
                    self.handle_create_tool(
                        *spec,
                        &decision.reasoning,
                        searched,
                        composite_signaled,
                        &mut history,
                    )
                    .await;
                }
                AgentAction::AnalyzeForComposite { tool_names } => {
                    actions.push(ActionRecord {
                        iteration,
                        action: decision.state.clone(),
                        detail: json!({ "tool_names": tool_names }),
                    });
                    composite_signaled |= self
                        .handle_analyze(&tool_names, &decision.reasoning, &mut history)
                        .await;
                }
                AgentAction::Unknown { state } => {
                    warn!("unknown agent state '{state}'");
                    actions.push(ActionRecord {
                        iteration,
                        action: state.clone(),
                        detail: json!({}),
                    });
                    history.push(HistoryEntry::system(format!(
                        "Unknown action '{state}' received. Please choose from: use_tool, \
                         search_tools, create_tool, analyze_tools_for_composite, or respond."
                    )));
                }
            }
        }

        warn!("max iterations ({}) reached", opts.max_iterations);
        emit(&events, AgentEvent::Timeout { iterations: iteration }).await;
        QueryOutcome {
            success: false,
            response: None,
            reasoning: None,
            error: Some("Max iterations reached without final response".to_string()),
            error_type: Some("bounded_iterations".to_string()),
            iterations: iteration,
            actions_taken: actions,
            conversation_history: history,
        }
    }

    async fn call_llm(
        &self,
        prompt: &str,
        events: &Option<Sender<AgentEvent>>,
    ) -> ToolforgeResult<String> {
        if events.is_none() {
            return self.llm.generate(prompt).await;
        }

        let mut rx = self.llm.generate_stream(prompt).await?;
        let mut full = String::new();
        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            emit(events, AgentEvent::Stream { chunk: chunk.clone() }).await;
            full.push_str(&chunk);
        }
        emit(events, AgentEvent::ResponseComplete).await;
        if full.is_empty() {
            return Err(ToolforgeError::LlmFatal(
                "model produced an empty response".to_string(),
            ));
        }
        Ok(full)
    }

    async fn handle_search(
        &self,
        question: &str,
        query: &str,
        reasoning: &str,
        opts: &QueryOptions,
        history: &mut Vec<HistoryEntry>,
    ) {
        let effective = if query.is_empty() { question } else { query };
        history.push(HistoryEntry::assistant(format!(
            "I will search for tools with query '{effective}'. Reasoning: {reasoning}"
        )));

        let hits = self
            .registry
            .search(effective, opts.max_tools, None, true)
            .await;

        let mut listed: Vec<String> = Vec::new();
        let mut content = String::new();
        for hit in &hits {
            listed.push(hit.name.clone());
            content.push_str(&format!(
                "{}. Tool: {}\n   - Category: {}\n   - Description: {}\n   - Required Parameters: {}\n   - Optional Parameters: {}\n   - Tags: {}\n   - Relevance Score: {:.2}\n\n",
                listed.len(),
                hit.name,
                hit.doc.category,
                hit.doc.description,
                hit.doc.required_params.join(", "),
                hit.doc.optional_params.join(", "),
                hit.doc.tags.join(", "),
                hit.score,
            ));
        }

        // Stored tools created through the API may not be mirrored into the
        // registry; surface them too.
        if listed.len() < opts.max_tools {
            if let Ok(store_hits) = self.store.search(effective, opts.max_tools, None, true) {
                for (tool, score) in store_hits {
                    if listed.contains(&tool.name) || listed.len() >= opts.max_tools {
                        continue;
                    }
                    listed.push(tool.name.clone());
                    content.push_str(&format!(
                        "{}. Tool: {}\n   - Category: {}\n   - Description: {}\n   - Required Parameters: {}\n   - Relevance Score: {:.2}\n\n",
                        listed.len(),
                        tool.name,
                        tool.category.as_deref().unwrap_or("general"),
                        tool.description,
                        tool.required_params.join(", "),
                        score,
                    ));
                }
            }
        }

        let observation = if listed.is_empty() {
            format!("No tools found matching query '{effective}'")
        } else {
            format!("Found {} tools:\n\n{content}", listed.len())
        };
        history.push(HistoryEntry::system(observation));
    }

    async fn handle_use_tool(
        &self,
        tool_name: &str,
        params: Value,
        reasoning: &str,
        opts: &QueryOptions,
        history: &mut Vec<HistoryEntry>,
        events: &Option<Sender<AgentEvent>>,
    ) {
        history.push(HistoryEntry::assistant(format!(
            "I will use the tool '{tool_name}' with parameters {params}. Reasoning: {reasoning}"
        )));

        let in_registry = self.registry.get(tool_name).await.is_some()
            || self.registry.unavailable_reason(tool_name).await.is_some();
        let in_store = !in_registry
            && matches!(self.store.get_by_name(tool_name), Ok(Some(_)));

        if !in_registry && !in_store {
            history.push(HistoryEntry::system(format!(
                "Tool '{tool_name}' was not found. Search for existing tools or create a new \
                 one with a different approach."
            )));
            return;
        }

        for attempt in 1..=TOOL_ATTEMPTS {
            let result = if in_registry {
                self.registry
                    .execute(
                        tool_name,
                        params.clone(),
                        self.executor.as_ref(),
                        opts.use_sandbox,
                        self.tool_timeout,
                    )
                    .await
            } else {
                match self.store.get_by_name(tool_name) {
                    Ok(Some(tool)) => {
                        self.store
                            .execute(
                                &tool,
                                params.clone(),
                                self.executor.as_ref(),
                                opts.use_sandbox,
                                self.tool_timeout,
                            )
                            .await
                    }
                    Ok(None) => Err(ToolforgeError::NotFound(tool_name.to_string())),
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(record) if record.success => {
                    emit(
                        events,
                        AgentEvent::Result {
                            success: true,
                            detail: record.result.clone(),
                        },
                    )
                    .await;
                    let method = if record.executed_in_sandbox {
                        "Sandbox Container"
                    } else {
                        "Direct"
                    };
                    let rendered = serde_json::to_string_pretty(&record.result)
                        .unwrap_or_else(|_| record.result.to_string());
                    history.push(HistoryEntry::system(format!(
                        "Tool '{tool_name}' executed successfully (attempt {attempt}/{TOOL_ATTEMPTS}).\n\
                         Execution Method: {method}\nResult: {rendered}\n\n\
                         Now use this result to answer the user's query. Do NOT create the tool again."
                    )));
                    return;
                }
                Ok(record) => {
                    let error = record
                        .error
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string());
                    emit(
                        events,
                        AgentEvent::Result {
                            success: false,
                            detail: json!({ "error": error }),
                        },
                    )
                    .await;
                    if attempt < TOOL_ATTEMPTS {
                        history.push(HistoryEntry::system(format!(
                            "Tool '{tool_name}' execution failed (attempt {attempt}/{TOOL_ATTEMPTS}).\n\
                             Error: {error}\n\nRetrying..."
                        )));
                        if self.config.tool_retry_backoff_secs > 0 {
                            tokio::time::sleep(Duration::from_secs(
                                self.config.tool_retry_backoff_secs,
                            ))
                            .await;
                        }
                    } else {
                        history.push(HistoryEntry::system(format!(
                            "Tool '{tool_name}' execution FAILED after {TOOL_ATTEMPTS} attempts.\n\
                             Last Error: {error}\n\n\
                             The tool has been automatically marked as BUGGED due to repeated failures.\n\n\
                             DO NOT:\n- Try to use this tool again\n- Create the tool again with the same name\n\n\
                             INSTEAD:\n- Create a CORRECTED tool with a DIFFERENT name\n\
                             - Use a completely different approach\n\
                             - Explain the issue to the user if no workaround exists"
                        )));
                    }
                }
                Err(ToolforgeError::Bugged { name, last_error }) => {
                    history.push(HistoryEntry::system(format!(
                        "Tool '{name}' is marked as BUGGED and cannot be used.\nError: {last_error}\n\n\
                         This tool has failed multiple times and has been flagged as problematic.\n\n\
                         DO NOT:\n- Try to use this tool again\n- Create a new version of this tool with the same name\n\n\
                         INSTEAD:\n- Create a NEW tool with a DIFFERENT name that solves the same problem\n\
                         - Use a different approach or different tool\n\
                         - If no alternative exists, explain to the user that this functionality is currently unavailable"
                    )));
                    return;
                }
                Err(err) => {
                    history.push(HistoryEntry::system(format!(
                        "Tool '{tool_name}' could not be executed: {err}"
                    )));
                    return;
                }
            }
        }
    }

    async fn handle_create_tool(
        &self,
        spec: ToolSpec,
        reasoning: &str,
        searched: bool,
        composite_signaled: bool,
        history: &mut Vec<HistoryEntry>,
    ) {
        history.push(HistoryEntry::assistant(format!(
            "I will create a new tool '{}'. Reasoning: {reasoning}",
            spec.name
        )));

        if !searched {
            history.push(HistoryEntry::system(
                "Tool creation rejected: search for existing tools first (use the \
                 search_tools action) so existing functionality is reused instead of \
                 reimplemented."
                    .to_string(),
            ));
            return;
        }

        if spec.code.trim().is_empty() {
            history.push(HistoryEntry::system(format!(
                "Tool creation rejected: no code was provided for '{}'.",
                spec.name
            )));
            return;
        }

        if let Some(pattern) = find_forbidden_pattern(&spec.code) {
            history.push(HistoryEntry::system(format!(
                "REJECTED: tool code contains the forbidden pattern '{pattern}'. Tools must \
                 have a real implementation, not placeholders or simulations."
            )));
            return;
        }

        if composite_signaled && !spec.code.contains("execute_tool(") {
            history.push(HistoryEntry::system(
                "You fetched tool sources for composition, but the submitted code never calls \
                 execute_tool(...). Compose the existing tools with execute_tool, or answer \
                 without the analyze step."
                    .to_string(),
            ));
            return;
        }

        // The driver reads a `result` variable; wrap a lone function
        // definition automatically.
        let mut code = spec.code.clone();
        if !code.contains("result =") && !code.contains("result=") {
            match first_function_name(&code) {
                Some(func) => {
                    code.push_str(&format!("\nresult = {func}(params)"));
                }
                None => {
                    history.push(HistoryEntry::system(
                        "Tool creation rejected: the code must assign its output to a \
                         'result' variable."
                            .to_string(),
                    ));
                    return;
                }
            }
        }

        let new_tool = NewTool {
            name: spec.name.clone(),
            description: spec.description.clone(),
            code: code.clone(),
            category: Some(spec.category.clone()),
            required_params: spec.required_params.clone(),
            optional_params: spec.optional_params.clone(),
            return_schema: spec.return_schema.clone(),
            examples: spec.examples.clone(),
            tags: spec.tags.clone(),
            requirements: spec.requirements.clone(),
        };

        if let Err(err) = self.store.create(new_tool) {
            history.push(HistoryEntry::system(format!(
                "Failed to create tool '{}': {err}",
                spec.name
            )));
            return;
        }

        let manifest = ToolManifest {
            name: spec.name.clone(),
            entrypoint: String::new(),
            description: spec.description.clone(),
            category: spec.category.clone(),
            tags: spec.tags.clone(),
            required_params: spec.required_params.clone(),
            optional_params: spec
                .optional_params
                .as_object()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default(),
            param_types: BTreeMap::new(),
            return_schema: spec.return_schema.clone(),
            requirements: spec.requirements.clone(),
        };

        let persisted = match self.registry.write_tool(&manifest, &code).await {
            Ok(()) => match self.registry.reload().await {
                Ok(_) => true,
                Err(err) => {
                    warn!("registry reload after create failed: {err}");
                    false
                }
            },
            Err(err) => {
                warn!("mirroring tool '{}' to registry failed: {err}", spec.name);
                false
            }
        };

        if persisted && self.config.reload_grace_secs > 0 {
            // Settling time before the next LLM call sees the new tool.
            tokio::time::sleep(Duration::from_secs(self.config.reload_grace_secs)).await;
        }

        let reload_note = if persisted {
            "Tool registry reloaded successfully."
        } else {
            "Tool stored, but the registry reload failed; the tool is still callable by name."
        };
        history.push(HistoryEntry::system(format!(
            "Tool '{}' created successfully.\n{reload_note}\n\n\
             IMPORTANT: You MUST use this tool in the next action. Do NOT create it again.\n\
             Use the 'use_tool' action with the tool name '{}'.",
            spec.name, spec.name
        )));
    }

    /// Fetch full sources of composition candidates into the history.
    /// Returns whether at least one source was found (arming the
    /// composite-preference guard for the next create).
    async fn handle_analyze(
        &self,
        tool_names: &[String],
        reasoning: &str,
        history: &mut Vec<HistoryEntry>,
    ) -> bool {
        history.push(HistoryEntry::assistant(format!(
            "I will analyze tools for composition: {}. Reasoning: {reasoning}",
            tool_names.join(", ")
        )));

        let mut found = false;
        let mut content = String::new();
        for name in tool_names {
            let source = match self.store.get_by_name(name) {
                Ok(Some(tool)) => Some(tool.code),
                _ => self.registry.get(name).await.map(|t| t.code.clone()),
            };
            match source {
                Some(code) => {
                    found = true;
                    content.push_str(&format!("Full source of tool '{name}':\n{code}\n\n"));
                }
                None => {
                    content.push_str(&format!("Tool '{name}' does not exist.\n\n"));
                }
            }
        }

        if found {
            content.push_str(
                "You can now create a composite tool that calls these with \
                 execute_tool(tool_name, params).",
            );
        }
        history.push(HistoryEntry::system(content));
        found
    }
}
