//! Isolated execution of tool code.
//!
//! The sandboxed path launches a resource-capped container with the scratch
//! directory mounted read-only and parses the last JSON line of combined
//! output. The direct path runs the same driver under a plain interpreter
//! subprocess; callers fall back to it when the container substrate is
//! unavailable.

mod driver;

pub use driver::render_driver;

use crate::config::SandboxConfig;
use crate::errors::{ToolforgeError, ToolforgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Maximum combined stdout+stderr size retained from a child process.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024; // 1 MB

/// How the driver invokes the tool source.
#[derive(Debug, Clone)]
pub enum DriverMode {
    /// Call `entry(**params)` on a function defined by the source.
    Function { entry: String },
    /// Exec the source with `params` in scope and read its `result` variable.
    Script,
}

/// One execution of one tool.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub tool_name: String,
    pub code: String,
    pub mode: DriverMode,
    pub params: Value,
    pub timeout: Duration,
    pub requirements: Vec<String>,
    /// Callee sources for composite tools, keyed by tool name.
    pub injected_tools: BTreeMap<String, String>,
}

/// Result envelope for one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub success: bool,
    pub result: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
    pub executed_in_sandbox: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub docker_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    fn failure(error: impl Into<String>, in_sandbox: bool, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            result: Value::Null,
            error: Some(error.into()),
            traceback: None,
            executed_in_sandbox: in_sandbox,
            docker_fallback: false,
            exit_code,
            stdout: None,
            timestamp: Utc::now(),
        }
    }
}

/// Executor seam: the agent loop, registry, and store all go through this
/// trait, which lets tests substitute a scripted executor.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Whether the container substrate is configured at all.
    fn sandbox_available(&self) -> bool;

    async fn execute_sandboxed(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord>;

    async fn execute_direct(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord>;

    /// Run a request with the fallback policy applied: sandbox when
    /// requested and available; a substrate failure falls back to direct
    /// execution (flagged in the record); tool failures propagate as-is.
    async fn execute(
        &self,
        req: &ExecutionRequest,
        use_sandbox: bool,
    ) -> ToolforgeResult<ExecutionRecord> {
        if use_sandbox && self.sandbox_available() {
            match self.execute_sandboxed(req).await {
                Ok(record) => return Ok(record),
                Err(ToolforgeError::SandboxSubstrate(reason)) => {
                    warn!(
                        "sandbox unavailable for tool '{}' ({reason}); falling back to direct execution",
                        req.tool_name
                    );
                    let mut record = self.execute_direct(req).await?;
                    record.docker_fallback = true;
                    return Ok(record);
                }
                Err(other) => return Err(other),
            }
        }
        self.execute_direct(req).await
    }
}

pub struct SandboxExecutor {
    config: SandboxConfig,
}

impl SandboxExecutor {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    fn write_driver(req: &ExecutionRequest) -> ToolforgeResult<tempfile::TempDir> {
        let scratch = tempfile::Builder::new()
            .prefix("toolforge-exec-")
            .tempdir()
            .map_err(|e| ToolforgeError::SandboxSubstrate(format!("scratch dir: {e}")))?;
        let script = render_driver(req);
        std::fs::write(scratch.path().join("driver.py"), script)
            .map_err(|e| ToolforgeError::SandboxSubstrate(format!("write driver: {e}")))?;
        Ok(scratch)
    }

    fn truncate_output(stdout: &[u8], stderr: &[u8]) -> String {
        let stdout_bytes = &stdout[..stdout.len().min(MAX_OUTPUT_BYTES)];
        let remaining = MAX_OUTPUT_BYTES.saturating_sub(stdout_bytes.len());
        let stderr_bytes = &stderr[..stderr.len().min(remaining)];

        let mut combined = String::from_utf8_lossy(stdout_bytes).into_owned();
        if !stderr_bytes.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&String::from_utf8_lossy(stderr_bytes));
        }
        combined
    }
}

/// Output fragments indicating the container substrate itself failed before
/// the driver could run.
const SUBSTRATE_MARKERS: &[&str] = &[
    "cannot connect to the docker daemon",
    "permission denied while trying to connect",
    "unable to find image",
    "docker: command not found",
    "docker: not found",
    "error during connect",
];

/// Scan combined output in reverse for the last parseable JSON object and
/// build the result envelope from it.
pub fn parse_envelope(
    combined: &str,
    exit_code: Option<i32>,
    in_sandbox: bool,
) -> ToolforgeResult<ExecutionRecord> {
    for line in combined.lines().rev() {
        let line = line.trim();
        if !line.starts_with('{') {
            continue;
        }
        let Ok(envelope) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let success = envelope["success"].as_bool().unwrap_or(false);
        return Ok(ExecutionRecord {
            success,
            result: envelope.get("result").cloned().unwrap_or(Value::Null),
            error: envelope["error"].as_str().map(|s| s.to_string()),
            traceback: envelope["traceback"].as_str().map(|s| s.to_string()),
            executed_in_sandbox: in_sandbox,
            docker_fallback: false,
            exit_code,
            stdout: None,
            timestamp: Utc::now(),
        });
    }

    // No envelope: the driver never ran, or produced garbage.
    let lower = combined.to_lowercase();
    if in_sandbox && SUBSTRATE_MARKERS.iter().any(|m| lower.contains(m)) {
        return Err(ToolforgeError::SandboxSubstrate(
            combined.trim().chars().take(500).collect(),
        ));
    }

    let mut record = ExecutionRecord::failure("Failed to parse tool output", in_sandbox, exit_code);
    record.stdout = Some(combined.chars().take(4000).collect());
    Ok(record)
}

#[async_trait]
impl ToolExecutor for SandboxExecutor {
    fn sandbox_available(&self) -> bool {
        self.config.enabled
    }

    async fn execute_sandboxed(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord> {
        if !self.config.enabled {
            return Err(ToolforgeError::SandboxSubstrate(
                "sandbox disabled by configuration".to_string(),
            ));
        }

        let scratch = Self::write_driver(req)?;
        let container_name = format!("toolforge-{}", uuid::Uuid::new_v4());

        let run_script = if req.requirements.is_empty() {
            "python /tool/driver.py".to_string()
        } else {
            format!(
                "pip install --no-cache-dir {} && python /tool/driver.py",
                req.requirements.join(" ")
            )
        };

        let cpus = self.config.cpu_percent as f64 / 100.0;
        let mut cmd = Command::new("docker");
        cmd.arg("run")
            .arg("--rm")
            .arg("--name")
            .arg(&container_name)
            .arg("-v")
            .arg(format!("{}:/tool:ro", scratch.path().display()))
            .arg("--network")
            .arg("bridge")
            .arg("--memory")
            .arg(format!("{}m", self.config.memory_mb))
            .arg("--cpus")
            .arg(format!("{cpus:.2}"))
            .arg(&self.config.image)
            .arg("sh")
            .arg("-c")
            .arg(&run_script)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!(
            "executing tool '{}' in sandbox (image {})",
            req.tool_name, self.config.image
        );
        debug!("sandbox params: {}", req.params);

        let output = match tokio::time::timeout(req.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolforgeError::SandboxSubstrate(format!(
                    "failed to launch container runtime: {e}"
                )));
            }
            Err(_) => {
                // The child was killed on drop; make sure the container goes
                // with it.
                let _ = Command::new("docker")
                    .args(["rm", "-f", &container_name])
                    .output()
                    .await;
                return Ok(ExecutionRecord::failure(
                    format!(
                        "Tool '{}' timed out after {}s",
                        req.tool_name,
                        req.timeout.as_secs()
                    ),
                    true,
                    None,
                ));
            }
        };

        let combined = Self::truncate_output(&output.stdout, &output.stderr);
        parse_envelope(&combined, output.status.code(), true)
    }

    async fn execute_direct(&self, req: &ExecutionRequest) -> ToolforgeResult<ExecutionRecord> {
        let scratch = Self::write_driver(req)?;

        let mut cmd = Command::new(&self.config.python_bin);
        cmd.arg("driver.py")
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        info!("executing tool '{}' directly", req.tool_name);

        let output = match tokio::time::timeout(req.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolforgeError::SandboxSubstrate(format!(
                    "failed to launch interpreter '{}': {e}",
                    self.config.python_bin
                )));
            }
            Err(_) => {
                return Ok(ExecutionRecord::failure(
                    format!(
                        "Tool '{}' timed out after {}s",
                        req.tool_name,
                        req.timeout.as_secs()
                    ),
                    false,
                    None,
                ));
            }
        };

        let combined = Self::truncate_output(&output.stdout, &output.stderr);
        parse_envelope(&combined, output.status.code(), false)
    }
}
