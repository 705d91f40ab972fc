mod schema;

pub use schema::{
    AgentConfig, Config, LlmConfig, SandboxConfig, ServerConfig, StorageConfig,
};
