use crate::errors::{ToolforgeError, ToolforgeResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Maximum number of `GEMINI_API_KEY_{n}` slots scanned at startup.
const MAX_KEY_SLOTS: usize = 8;

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Credentials tried in round-robin order.
    pub api_keys: Vec<String>,
    /// Model identifier passed to the provider.
    pub model: String,
    /// Minimum spacing between any two LLM requests, in seconds.
    pub min_request_interval_secs: u64,
    /// Cooldown applied to a credential after an overload-class failure.
    pub key_cooldown_secs: u64,
    /// Pause after a successful request before the next one may start.
    pub post_success_cooldown_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            model: "gemini-2.0-flash".to_string(),
            min_request_interval_secs: 5,
            key_cooldown_secs: 60,
            post_success_cooldown_secs: 3,
        }
    }
}

/// Sandbox execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Whether container isolation is attempted at all.
    pub enabled: bool,
    /// Base image for tool containers.
    pub image: String,
    /// Memory cap passed to the container runtime.
    pub memory_mb: u64,
    /// CPU quota as a percentage of one core.
    pub cpu_percent: u64,
    /// Default wall-clock timeout per execution, in seconds.
    pub timeout_secs: u64,
    /// Interpreter used for the direct (non-container) execution path.
    pub python_bin: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "python:3.11-slim".to_string(),
            memory_mb: 512,
            cpu_percent: 50,
            timeout_secs: 30,
            python_bin: "python3".to_string(),
        }
    }
}

/// Agent loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Hard cap on reason/act iterations per query.
    pub max_iterations: usize,
    /// Number of tools surfaced in the LLM context block.
    pub max_tools: usize,
    /// Pause between the two attempts of a failing tool, in seconds.
    pub tool_retry_backoff_secs: u64,
    /// Settling time after a hot reload before the next LLM call, in seconds.
    pub reload_grace_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_tools: 3,
            tool_retry_backoff_secs: 3,
            reload_grace_secs: 5,
        }
    }
}

/// HTTP gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// HS256 signing key for bearer tokens.
    pub jwt_secret: String,
    /// Admin account name accepted by `/auth/login`.
    pub admin_username: String,
    /// Admin password, hashed once at startup.
    pub admin_password: String,
    /// Issued-token lifetime in hours.
    pub token_ttl_hours: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5001,
            jwt_secret: String::new(),
            admin_username: "admin".to_string(),
            admin_password: "admin123".to_string(),
            token_ttl_hours: 24,
        }
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory scanned for tool manifests; also the mirror target for
    /// authored tools.
    pub tools_dir: PathBuf,
    /// SQLite database holding authored tools.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tools_dir: PathBuf::from("./tools"),
            db_path: PathBuf::from("./code_tools.db"),
        }
    }
}

/// Top-level application configuration.
///
/// Built once from the environment at startup and passed into constructors;
/// nothing here is mutated after load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub llm: LlmConfig,
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub debug: bool,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> ToolforgeResult<T> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ToolforgeError::Config(format!("{name} has an invalid value: {raw}"))),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Credentials come from `GEMINI_API_KEY_1` through `GEMINI_API_KEY_8`;
    /// gaps in the numbering are skipped.
    pub fn from_env() -> ToolforgeResult<Self> {
        let defaults = Config::default();

        let mut api_keys = Vec::new();
        for i in 1..=MAX_KEY_SLOTS {
            if let Some(key) = env_var(&format!("GEMINI_API_KEY_{i}")) {
                api_keys.push(key);
            }
        }

        let jwt_secret = match env_var("TOOLFORGE_JWT_SECRET") {
            Some(secret) => secret,
            None => {
                tracing::warn!(
                    "TOOLFORGE_JWT_SECRET not set; generating an ephemeral secret \
                     (tokens will not survive a restart)"
                );
                uuid::Uuid::new_v4().to_string()
            }
        };

        Ok(Self {
            llm: LlmConfig {
                api_keys,
                model: env_var("GEMINI_MODEL").unwrap_or(defaults.llm.model),
                min_request_interval_secs: env_parse(
                    "TOOLFORGE_MIN_REQUEST_INTERVAL",
                    defaults.llm.min_request_interval_secs,
                )?,
                key_cooldown_secs: defaults.llm.key_cooldown_secs,
                post_success_cooldown_secs: defaults.llm.post_success_cooldown_secs,
            },
            sandbox: SandboxConfig {
                enabled: env_parse("TOOLFORGE_SANDBOX_ENABLED", defaults.sandbox.enabled)?,
                image: env_var("TOOLFORGE_SANDBOX_IMAGE").unwrap_or(defaults.sandbox.image),
                memory_mb: env_parse("TOOLFORGE_SANDBOX_MEMORY_MB", defaults.sandbox.memory_mb)?,
                cpu_percent: defaults.sandbox.cpu_percent,
                timeout_secs: env_parse(
                    "TOOLFORGE_SANDBOX_TIMEOUT",
                    defaults.sandbox.timeout_secs,
                )?,
                python_bin: env_var("TOOLFORGE_PYTHON_BIN").unwrap_or(defaults.sandbox.python_bin),
            },
            agent: AgentConfig {
                max_iterations: env_parse("TOOLFORGE_MAX_ITERATIONS", defaults.agent.max_iterations)?,
                max_tools: env_parse("TOOLFORGE_MAX_TOOLS", defaults.agent.max_tools)?,
                tool_retry_backoff_secs: defaults.agent.tool_retry_backoff_secs,
                reload_grace_secs: defaults.agent.reload_grace_secs,
            },
            server: ServerConfig {
                host: env_var("TOOLFORGE_HOST").unwrap_or(defaults.server.host),
                port: env_parse("TOOLFORGE_PORT", defaults.server.port)?,
                jwt_secret,
                admin_username: env_var("TOOLFORGE_ADMIN_USER")
                    .unwrap_or(defaults.server.admin_username),
                admin_password: env_var("TOOLFORGE_ADMIN_PASSWORD")
                    .unwrap_or(defaults.server.admin_password),
                token_ttl_hours: env_parse(
                    "TOOLFORGE_TOKEN_TTL_HOURS",
                    defaults.server.token_ttl_hours,
                )?,
            },
            storage: StorageConfig {
                tools_dir: env_var("TOOLFORGE_TOOLS_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.tools_dir),
                db_path: env_var("TOOLFORGE_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or(defaults.storage.db_path),
            },
            debug: env_parse("TOOLFORGE_DEBUG", false)?,
        })
    }

    /// Config with fast, isolated defaults for tests: no pacing delays, no
    /// container isolation, paths under the given directory.
    #[doc(hidden)]
    pub fn test_defaults(base_dir: &std::path::Path) -> Self {
        let mut config = Config::default();
        config.llm.api_keys = vec!["test-key-1".to_string()];
        config.llm.min_request_interval_secs = 0;
        config.llm.post_success_cooldown_secs = 0;
        config.sandbox.enabled = false;
        config.agent.tool_retry_backoff_secs = 0;
        config.agent.reload_grace_secs = 0;
        config.server.jwt_secret = "test-secret".to_string();
        config.storage.tools_dir = base_dir.join("tools");
        config.storage.db_path = base_dir.join("code_tools.db");
        config
    }
}
