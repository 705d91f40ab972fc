//! HTTP surface round-trips for the authored-tool store and registry
//! administration.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use toolforge::config::Config;
use toolforge::errors::{ToolforgeError, ToolforgeResult};
use toolforge::gateway::{router, AppState};
use toolforge::keys::KeyPool;
use toolforge::providers::LlmProvider;
use toolforge::sandbox::{ExecutionRecord, ExecutionRequest, ToolExecutor};
use tower::util::ServiceExt;

struct NoopProvider;

#[async_trait]
impl LlmProvider for NoopProvider {
    async fn generate(&self, _credential: &str, _prompt: &str) -> ToolforgeResult<String> {
        Err(ToolforgeError::LlmFatal("no provider in this test".to_string()))
    }
    fn model(&self) -> &str {
        "noop"
    }
}

/// Executor that interprets only the `reverse_text` script used below.
struct EchoExecutor;

#[async_trait]
impl ToolExecutor for EchoExecutor {
    fn sandbox_available(&self) -> bool {
        false
    }

    async fn execute_sandboxed(
        &self,
        _req: &ExecutionRequest,
    ) -> ToolforgeResult<ExecutionRecord> {
        Err(ToolforgeError::SandboxSubstrate("disabled".to_string()))
    }

    async fn execute_direct(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord> {
        let text = req.params["text"].as_str().unwrap_or_default();
        Ok(ExecutionRecord {
            success: true,
            result: json!({"result": text.chars().rev().collect::<String>()}),
            error: None,
            traceback: None,
            executed_in_sandbox: false,
            docker_fallback: false,
            exit_code: Some(0),
            stdout: None,
            timestamp: chrono::Utc::now(),
        })
    }
}

fn state(dir: &std::path::Path) -> AppState {
    let config = Config::test_defaults(dir);
    let pool = Arc::new(
        KeyPool::new(
            config.llm.api_keys.clone(),
            Duration::ZERO,
            Duration::from_secs(60),
        )
        .unwrap(),
    );
    AppState::with_parts(config, Arc::new(NoopProvider), pool, Some(Arc::new(EchoExecutor)))
        .unwrap()
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn admin_token(app: &axum::Router) -> String {
    let (status, body) = send(
        app,
        json_request(
            "POST",
            "/auth/login",
            None,
            json!({"username": "admin", "password": "admin123"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

fn reverse_tool_body() -> Value {
    json!({
        "name": "reverse_text",
        "description": "Reverse a string of text",
        "code": "result = params['text'][::-1]",
        "category": "text",
        "required_params": ["text"],
        "tags": ["string"]
    })
}

#[tokio::test]
async fn create_get_delete_lifecycle_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()));
    let token = admin_token(&app).await;

    // Create: 201.
    let (status, created) = send(
        &app,
        json_request("POST", "/tools", Some(&token), reverse_tool_body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    // Get by name: 200.
    let (status, fetched) = send(
        &app,
        Request::get("/tools/reverse_text").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"].as_i64().unwrap(), id);

    // Delete: 200.
    let (status, _) = send(
        &app,
        Request::delete(format!("/tools/{id}"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Get again: 404.
    let (status, _) = send(
        &app,
        Request::get("/tools/reverse_text").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_requires_admin_token() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()));
    let (status, _) = send(
        &app,
        json_request("POST", "/tools", None, reverse_tool_body()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn execute_endpoint_returns_wire_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()));
    let token = admin_token(&app).await;

    let (status, created) = send(
        &app,
        json_request("POST", "/tools", Some(&token), reverse_tool_body()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = created["id"].as_i64().unwrap();

    let (status, envelope) = send(
        &app,
        json_request(
            "POST",
            &format!("/tools/{id}/execute"),
            None,
            json!({"params": {"text": "hello"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["success"], true);
    assert_eq!(envelope["tool"], "reverse_text");
    assert_eq!(envelope["result"]["result"], "olleh");
    assert_eq!(envelope["executed_in_sandbox"], false);
    assert_eq!(envelope["is_bugged"], false);

    // Execution stats were recorded.
    let (_, fetched) = send(
        &app,
        Request::get("/tools/reverse_text").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(fetched["execution_count"].as_i64().unwrap(), 1);
}

#[tokio::test]
async fn missing_required_param_is_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()));
    let token = admin_token(&app).await;

    let (_, created) = send(
        &app,
        json_request("POST", "/tools", Some(&token), reverse_tool_body()),
    )
    .await;
    let id = created["id"].as_i64().unwrap();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/tools/{id}/execute"),
            None,
            json!({"params": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error_type"], "invalid_input");
}

#[tokio::test]
async fn search_endpoint_ranks_exact_name_first() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(state(dir.path()));
    let token = admin_token(&app).await;

    for body in [
        reverse_tool_body(),
        json!({
            "name": "count_words",
            "description": "Count words in a text",
            "code": "result = len(params['text'].split())",
            "required_params": ["text"]
        }),
    ] {
        let (status, _) = send(&app, json_request("POST", "/tools", Some(&token), body)).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = send(
        &app,
        Request::get("/tools/search/reverse_text")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0]["name"], "reverse_text");
}

#[tokio::test]
async fn clear_bugs_restores_executability() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    let app = router(state.clone());
    let token = admin_token(&app).await;

    let (_, created) = send(
        &app,
        json_request("POST", "/tools", Some(&token), reverse_tool_body()),
    )
    .await;
    let id = created["id"].as_i64().unwrap();

    // Two recorded failures flip the tool to bugged.
    state
        .store
        .record_execution_failure(id, "boom", None, &json!({}))
        .unwrap();
    state
        .store
        .record_execution_failure(id, "boom again", None, &json!({}))
        .unwrap();

    let (status, body) = send(
        &app,
        json_request(
            "POST",
            &format!("/tools/{id}/execute"),
            None,
            json!({"params": {"text": "hi"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error_type"], "bugged");

    let (status, _) = send(
        &app,
        Request::post(format!("/tools/{id}/clear-bugs"))
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, envelope) = send(
        &app,
        json_request(
            "POST",
            &format!("/tools/{id}/execute"),
            None,
            json!({"params": {"text": "hi"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(envelope["success"], true);

    // The failure log survives the clear.
    let (_, fetched) = send(
        &app,
        Request::get(format!("/tools/{id}")).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(fetched["bug_details"].as_array().unwrap().len(), 2);
    assert_eq!(fetched["is_bugged"], false);
}

#[tokio::test]
async fn bugged_list_reports_quarantined_tools() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    let app = router(state.clone());
    let token = admin_token(&app).await;

    let (_, created) = send(
        &app,
        json_request("POST", "/tools", Some(&token), reverse_tool_body()),
    )
    .await;
    let id = created["id"].as_i64().unwrap();
    state
        .store
        .record_execution_failure(id, "a", None, &json!({}))
        .unwrap();
    state
        .store
        .record_execution_failure(id, "b", None, &json!({}))
        .unwrap();

    let (status, body) = send(
        &app,
        Request::get("/tools/bugged/list").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stored"].as_array().unwrap().len(), 1);
    assert_eq!(body["stored"][0]["name"], "reverse_text");
}

#[tokio::test]
async fn registry_context_endpoint_renders_block() {
    let dir = tempfile::tempdir().unwrap();
    let state = state(dir.path());
    let app = router(state.clone());

    // Seed one registry tool on disk and reload through the admin endpoint.
    let tools_dir = dir.path().join("tools");
    std::fs::write(
        tools_dir.join("multiply.json"),
        json!({
            "name": "multiply",
            "entrypoint": "multiply",
            "description": "Multiply two numbers",
            "required_params": ["a", "b"]
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(
        tools_dir.join("multiply.py"),
        "def multiply(a, b):\n    return a * b\n",
    )
    .unwrap();

    let token = admin_token(&app).await;
    let (status, _) = send(
        &app,
        Request::post("/registry/reload")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &app,
        Request::get("/registry/context?query=multiply%20numbers&max_tools=3")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["context"].as_str().unwrap().contains("Tool: multiply"));

    let (status, body) = send(
        &app,
        Request::get("/registry/availability").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["available_tools"], 1);
}
