//! HTTP gateway.
//!
//! REST surface for queries, the authored-tool store, and registry
//! administration, plus the WebSocket streaming variant of the query
//! endpoint. Mutating endpoints sit behind the admin bearer token.

mod auth;
mod ws;

pub use auth::{AuthState, Claims};

use crate::agent::{AgentLoop, HistoryEntry, QueryOptions};
use crate::config::{AgentConfig, Config};
use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::keys::KeyPool;
use crate::providers::{GeminiProvider, LlmClient, LlmProvider};
use crate::registry::ToolRegistry;
use crate::sandbox::{SandboxExecutor, ToolExecutor};
use crate::store::{ListFilter, NewTool, ToolStore, ToolUpdate};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Upper bound on tools surfaced per query, mirroring the query endpoint's
/// historical cap.
const MAX_TOOLS_CAP: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ToolRegistry>,
    pub store: Arc<ToolStore>,
    pub executor: Arc<dyn ToolExecutor>,
    pub llm: Arc<LlmClient>,
    pub auth: Arc<AuthState>,
}

impl AppState {
    /// Assemble the full application from configuration.
    pub fn from_config(config: Config) -> ToolforgeResult<Self> {
        let pool = Arc::new(KeyPool::new(
            config.llm.api_keys.clone(),
            Duration::from_secs(config.llm.min_request_interval_secs),
            Duration::from_secs(config.llm.key_cooldown_secs),
        )?);
        let provider: Arc<dyn LlmProvider> =
            Arc::new(GeminiProvider::new(config.llm.model.clone()));
        Self::with_parts(config, provider, pool, None)
    }

    /// Assemble with injected provider/executor, used by tests and by the
    /// CLI's one-shot mode.
    pub fn with_parts(
        config: Config,
        provider: Arc<dyn LlmProvider>,
        pool: Arc<KeyPool>,
        executor: Option<Arc<dyn ToolExecutor>>,
    ) -> ToolforgeResult<Self> {
        let llm = Arc::new(LlmClient::new(
            pool,
            provider,
            Duration::from_secs(config.llm.post_success_cooldown_secs),
        ));
        let registry = Arc::new(ToolRegistry::open(config.storage.tools_dir.clone())?);
        let store = Arc::new(ToolStore::open(&config.storage.db_path)?);
        let executor = executor
            .unwrap_or_else(|| Arc::new(SandboxExecutor::new(config.sandbox.clone())));
        let auth = Arc::new(AuthState::new(&config.server));
        Ok(Self {
            config: Arc::new(config),
            registry,
            store,
            executor,
            llm,
            auth,
        })
    }

    /// Build a per-query agent loop over the shared components.
    pub fn agent_loop(&self) -> AgentLoop {
        AgentLoop::new(
            self.llm.clone(),
            self.registry.clone(),
            self.store.clone(),
            self.executor.clone(),
            self.config.agent.clone(),
            Duration::from_secs(self.config.sandbox.timeout_secs),
        )
    }
}

/// Error wrapper mapping the taxonomy onto HTTP statuses.
pub struct ApiError(pub ToolforgeError);

impl From<ToolforgeError> for ApiError {
    fn from(err: ToolforgeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ToolforgeError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ToolforgeError::NotFound(_) => StatusCode::NOT_FOUND,
            ToolforgeError::Unavailable { .. } | ToolforgeError::Bugged { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ToolforgeError::Auth(_) => StatusCode::UNAUTHORIZED,
            ToolforgeError::LlmTransient(_) | ToolforgeError::SandboxSubstrate(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "success": false,
            "error": self.0.to_string(),
            "error_type": self.0.kind(),
        });
        (status, Json(body)).into_response()
    }
}

/// Body of `POST /query` (and the first WebSocket frame).
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub question: Option<String>,
    /// Accepted alias for `question`.
    pub query: Option<String>,
    pub max_iterations: Option<usize>,
    pub max_tools: Option<usize>,
    pub use_sandbox: Option<bool>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl QueryRequest {
    pub fn question(&self) -> Option<String> {
        self.question
            .clone()
            .or_else(|| self.query.clone())
            .filter(|q| !q.trim().is_empty())
    }

    pub fn options(&self, defaults: &AgentConfig) -> QueryOptions {
        let mut opts = QueryOptions::from_config(defaults);
        if let Some(n) = self.max_iterations {
            opts.max_iterations = n.max(1);
        }
        if let Some(n) = self.max_tools {
            opts.max_tools = n.clamp(1, MAX_TOOLS_CAP);
        }
        if let Some(use_sandbox) = self.use_sandbox {
            opts.use_sandbox = use_sandbox;
        }
        opts.history = self.history.clone();
        opts
    }
}

pub fn router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/tools", post(create_tool))
        .route("/tools/{id}", axum::routing::put(update_tool).delete(delete_tool))
        .route("/tools/{id}/clear-bugs", post(clear_bugs))
        .route("/tools/{id}/deactivate", post(deactivate_tool))
        .route("/registry/reload", post(reload_registry))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_admin,
        ));

    Router::new()
        .route("/query", post(query_handler))
        .route("/ws/query", get(ws::ws_query_handler))
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/auth/login", post(login))
        .route("/auth/verify", get(verify_token))
        .route("/tools", get(list_tools))
        .route("/tools/{id}", get(get_tool))
        .route("/tools/{id}/execute", post(execute_tool))
        .route("/tools/search/{query}", get(search_tools))
        .route("/tools/bugged/list", get(bugged_tools))
        .route("/registry/tools", get(registry_tools))
        .route("/registry/availability", get(registry_availability))
        .route("/registry/context", get(registry_context))
        .merge(admin)
        .with_state(state)
}

/// Run the gateway until shutdown.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState::from_config(config)?;
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn require_admin(
    State(state): State<AppState>,
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    state.auth.verify_header(header)?;
    Ok(next.run(request).await)
}

// --- Query ---

async fn query_handler(
    State(state): State<AppState>,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let question = request
        .question()
        .ok_or_else(|| ToolforgeError::InvalidInput("missing 'question' parameter".to_string()))?;
    let opts = request.options(&state.config.agent);

    info!("processing query: {question}");
    let outcome = state.agent_loop().process(&question, &opts, None).await;

    let status = if outcome.success {
        StatusCode::OK
    } else {
        match outcome.error_type.as_deref() {
            // Exhausting the iteration budget is a well-formed outcome.
            Some("bounded_iterations") => StatusCode::OK,
            Some("all_keys_overloaded") => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    Ok((status, Json(outcome)).into_response())
}

// --- Health, models, auth ---

async fn health(State(state): State<AppState>) -> Json<Value> {
    let tools = state.registry.availability_status().await;
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now(),
        "version": crate::VERSION,
        "model": state.llm.model(),
        "api_keys": state.llm.key_count(),
        "tools": tools,
    }))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let models = state.llm.list_models().await?;
    Ok(Json(json!({ "models": models })))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if !state.auth.verify_password(&request.username, &request.password) {
        return Err(ToolforgeError::Auth("invalid credentials".to_string()).into());
    }
    let (token, expires_in) = state.auth.issue_token()?;
    info!("successful login for user: {}", request.username);
    Ok(Json(json!({
        "success": true,
        "token": token,
        "token_type": "Bearer",
        "expires_in": expires_in,
    })))
}

async fn verify_token(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let claims = state.auth.verify_header(header)?;
    Ok(Json(json!({ "valid": true, "user": claims })))
}

// --- Tool store CRUD ---

async fn create_tool(
    State(state): State<AppState>,
    Json(tool): Json<NewTool>,
) -> Result<Response, ApiError> {
    let created = state.store.create(tool)?;
    Ok((StatusCode::CREATED, Json(created)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    exclude_bugged: bool,
    category: Option<String>,
}

async fn list_tools(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let tools = state.store.list(&ListFilter {
        active_only: query.active_only,
        exclude_bugged: query.exclude_bugged,
        category: query.category,
    })?;
    let count = tools.len();
    Ok(Json(json!({ "tools": tools, "count": count })))
}

async fn get_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    Ok(Json(serde_json::to_value(tool).unwrap_or(Value::Null)))
}

async fn update_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ToolUpdate>,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    let updated = state.store.update(tool.id, update)?;
    Ok(Json(serde_json::to_value(updated).unwrap_or(Value::Null)))
}

async fn delete_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    state.store.delete(tool.id)?;
    Ok(Json(json!({ "success": true, "message": "Tool deleted successfully" })))
}

async fn deactivate_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    state.store.deactivate(tool.id)?;
    Ok(Json(json!({ "success": true, "message": "Tool deactivated successfully" })))
}

async fn clear_bugs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    state.store.clear_bugs(tool.id)?;
    state.registry.clear_bug(&tool.name).await;
    Ok(Json(json!({ "success": true, "message": "Bug status cleared" })))
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteQuery {
    use_sandbox: Option<bool>,
    timeout: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ExecuteBody {
    #[serde(default)]
    params: Option<Value>,
}

async fn execute_tool(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExecuteQuery>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let tool = state
        .store
        .resolve(&id)?
        .ok_or_else(|| ToolforgeError::NotFound(id))?;
    let parsed: ExecuteBody = if body.is_empty() {
        ExecuteBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ToolforgeError::InvalidInput(format!("invalid request body: {e}")))?
    };
    let params = parsed.params.unwrap_or_else(|| json!({}));
    let use_sandbox = query.use_sandbox.unwrap_or(true);
    let timeout =
        Duration::from_secs(query.timeout.unwrap_or(state.config.sandbox.timeout_secs));

    let record = state
        .store
        .execute(&tool, params, state.executor.as_ref(), use_sandbox, timeout)
        .await?;

    let is_bugged = state
        .store
        .get(tool.id)?
        .map(|t| t.is_bugged)
        .unwrap_or(false);
    let status = if record.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = json!({
        "success": record.success,
        "tool": tool.name,
        "result": record.result,
        "error": record.error,
        "traceback": record.traceback,
        "executed_in_sandbox": record.executed_in_sandbox,
        "docker_fallback": record.docker_fallback,
        "exit_code": record.exit_code,
        "is_bugged": is_bugged,
        "timestamp": record.timestamp,
    });
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct SearchQuery {
    limit: Option<usize>,
    threshold: Option<f64>,
    exclude_bugged: Option<bool>,
}

async fn search_tools(
    State(state): State<AppState>,
    Path(query): Path<String>,
    Query(params): Query<SearchQuery>,
) -> Result<Json<Value>, ApiError> {
    let hits = state.store.search(
        &query,
        params.limit.unwrap_or(10),
        params.threshold,
        params.exclude_bugged.unwrap_or(true),
    )?;
    let results: Vec<Value> = hits
        .into_iter()
        .map(|(tool, score)| {
            let mut v = serde_json::to_value(tool).unwrap_or(Value::Null);
            v["score"] = json!((score * 100.0).round() / 100.0);
            v
        })
        .collect();
    Ok(Json(json!({ "query": query, "results": results })))
}

async fn bugged_tools(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let store_bugged = state.store.bugged_list()?;
    let registry_bugged = state.registry.bugged_tools().await;
    let count = store_bugged.len() + registry_bugged.len();
    Ok(Json(json!({
        "stored": store_bugged,
        "registry": registry_bugged,
        "count": count,
    })))
}

// --- Registry endpoints ---

#[derive(Debug, Default, Deserialize)]
struct RegistryListQuery {
    #[serde(default)]
    include_unavailable: bool,
    #[serde(default)]
    exclude_bugged: bool,
}

async fn registry_tools(
    State(state): State<AppState>,
    Query(query): Query<RegistryListQuery>,
) -> Json<Value> {
    let tools = state
        .registry
        .list(query.include_unavailable, query.exclude_bugged)
        .await;
    let availability = state.registry.availability_status().await;
    Json(json!({ "tools": tools, "availability": availability }))
}

async fn registry_availability(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::to_value(state.registry.availability_status().await).unwrap_or(Value::Null))
}

async fn reload_registry(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let status = state.registry.reload().await?;
    Ok(Json(json!({ "success": true, "availability": status })))
}

#[derive(Debug, Deserialize)]
struct ContextQuery {
    query: String,
    max_tools: Option<usize>,
}

async fn registry_context(
    State(state): State<AppState>,
    Query(params): Query<ContextQuery>,
) -> Json<Value> {
    let max_tools = params.max_tools.unwrap_or(3).clamp(1, MAX_TOOLS_CAP);
    let context = state.registry.tools_context(&params.query, max_tools).await;
    Json(json!({ "query": params.query, "context": context }))
}
