use serde::Serialize;
use serde_json::Value;

/// Progress events emitted while a query is processed, forwarded verbatim
/// over the WebSocket surface as tagged JSON messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Start {
        question: String,
    },
    Iteration {
        iteration: usize,
        max_iterations: usize,
    },
    Thinking {
        reasoning: String,
    },
    /// One LLM token chunk.
    Stream {
        chunk: String,
    },
    /// The model's response for this iteration is complete.
    ResponseComplete,
    State {
        state: String,
    },
    Action {
        action: String,
        detail: Value,
    },
    Result {
        success: bool,
        detail: Value,
    },
    Final {
        response: String,
        iterations: usize,
    },
    Timeout {
        iterations: usize,
    },
    Error {
        error: String,
        error_type: String,
    },
}
