use thiserror::Error;

/// Typed error hierarchy for toolforge.
///
/// Use at module boundaries (provider calls, tool execution, registry/store
/// access, auth). Internal/leaf functions can continue using `anyhow::Result`
/// — the `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum ToolforgeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Tool '{0}' not found")]
    NotFound(String),

    #[error("Tool '{name}' is not available: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("Tool '{name}' is marked as bugged: {last_error}")]
    Bugged { name: String, last_error: String },

    #[error("Tool '{tool}' execution failed: {message}")]
    Execution {
        tool: String,
        message: String,
        traceback: Option<String>,
    },

    #[error("Sandbox unavailable: {0}")]
    SandboxSubstrate(String),

    #[error("LLM transient failure: {0}")]
    LlmTransient(String),

    #[error("LLM provider error: {0}")]
    LlmFatal(String),

    #[error("Could not parse model output: {0}")]
    ParseFailure(String),

    #[error("Iteration budget of {max_iterations} exhausted without a final response")]
    BoundedIterations { max_iterations: usize },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ToolforgeError.
pub type ToolforgeResult<T> = std::result::Result<T, ToolforgeError>;

impl ToolforgeError {
    /// Stable machine-readable kind, used in API error bodies and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolforgeError::InvalidInput(_) => "invalid_input",
            ToolforgeError::NotFound(_) => "not_found",
            ToolforgeError::Unavailable { .. } => "unavailable",
            ToolforgeError::Bugged { .. } => "bugged",
            ToolforgeError::Execution { .. } => "execution_failure",
            ToolforgeError::SandboxSubstrate(_) => "sandbox_substrate",
            ToolforgeError::LlmTransient(_) => "llm_transient",
            ToolforgeError::LlmFatal(_) => "llm_fatal",
            ToolforgeError::ParseFailure(_) => "parse_failure",
            ToolforgeError::BoundedIterations { .. } => "bounded_iterations",
            ToolforgeError::Auth(_) => "auth",
            ToolforgeError::Config(_) => "config",
            ToolforgeError::Internal(_) => "internal",
        }
    }

    /// Whether this error is recoverable with bounded retry (key rotation,
    /// sandbox fallback). All other kinds surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolforgeError::LlmTransient(_) | ToolforgeError::SandboxSubstrate(_)
        )
    }
}
