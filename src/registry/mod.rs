//! Directory-loaded tool catalog.
//!
//! Tools live in a directory as `<name>.py` source plus `<name>.json`
//! manifest pairs. Loading is tolerant of per-tool failures: a bad manifest
//! records the tool in the `unavailable` map without aborting the scan.
//! `reload()` rebuilds the tables and search index atomically; executions
//! already holding an `Arc<LoadedTool>` complete against their old snapshot.

mod manifest;

pub use manifest::ToolManifest;

use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::sandbox::{DriverMode, ExecutionRecord, ExecutionRequest, ToolExecutor};
use crate::search::{render_context, SearchHit, SearchIndex, ToolDoc};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Consecutive failures within an invocation window before quarantine.
pub const BUG_THRESHOLD: usize = 2;

/// A tool loaded from the tools directory.
#[derive(Debug, Clone)]
pub struct LoadedTool {
    pub manifest: ToolManifest,
    pub code: String,
}

impl LoadedTool {
    pub fn driver_mode(&self) -> DriverMode {
        if self.manifest.entrypoint.is_empty() {
            DriverMode::Script
        } else {
            DriverMode::Function {
                entry: self.manifest.entrypoint.clone(),
            }
        }
    }

    fn doc(&self) -> ToolDoc {
        ToolDoc {
            name: self.manifest.name.clone(),
            description: self.manifest.description.clone(),
            category: self.manifest.category.clone(),
            tags: self.manifest.tags.clone(),
            required_params: self.manifest.required_params.clone(),
            optional_params: self.manifest.optional_params.keys().cloned().collect(),
            param_types: self.manifest.param_types.values().cloned().collect(),
        }
    }
}

/// One recorded execution failure.
#[derive(Debug, Clone, Serialize)]
pub struct FailureEntry {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Failure history of a quarantine candidate. Append-only; cleared as a
/// whole by an explicit admin action.
#[derive(Debug, Clone, Serialize)]
pub struct BugRecord {
    pub first_failure: DateTime<Utc>,
    pub failures: Vec<FailureEntry>,
}

impl BugRecord {
    pub fn is_bugged(&self) -> bool {
        self.failures.len() >= BUG_THRESHOLD
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AvailabilityStatus {
    pub total_tools: usize,
    pub available_tools: usize,
    pub unavailable_tools: usize,
    pub bugged_tools: usize,
    pub available_tool_names: Vec<String>,
    pub unavailable_tool_names: Vec<String>,
    pub bugged_tool_names: Vec<String>,
}

/// Listing row exposed by the registry endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    pub category: String,
    pub tags: Vec<String>,
    pub required_params: Vec<String>,
    pub optional_params: BTreeMap<String, Value>,
    pub available: bool,
    pub is_bugged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bug_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct Tables {
    tools: HashMap<String, Arc<LoadedTool>>,
    unavailable: BTreeMap<String, String>,
}

pub struct ToolRegistry {
    tools_dir: PathBuf,
    tables: RwLock<Tables>,
    index: RwLock<SearchIndex>,
    bugged: Mutex<HashMap<String, BugRecord>>,
}

impl ToolRegistry {
    /// Open a registry over `tools_dir`, creating the directory if needed
    /// and performing the initial scan.
    pub fn open(tools_dir: PathBuf) -> ToolforgeResult<Self> {
        std::fs::create_dir_all(&tools_dir).map_err(|e| {
            ToolforgeError::Config(format!(
                "cannot create tools directory {}: {e}",
                tools_dir.display()
            ))
        })?;

        let tables = Self::scan(&tools_dir);
        let index = Self::build_index(&tables);
        info!(
            "tool registry loaded: {} available, {} unavailable",
            tables.tools.len(),
            tables.unavailable.len()
        );

        Ok(Self {
            tools_dir,
            tables: RwLock::new(tables),
            index: RwLock::new(index),
            bugged: Mutex::new(HashMap::new()),
        })
    }

    fn scan(tools_dir: &PathBuf) -> Tables {
        let mut tools = HashMap::new();
        let mut unavailable = BTreeMap::new();

        let entries = match std::fs::read_dir(tools_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!("cannot read tools directory {}: {e}", tools_dir.display());
                return Tables { tools, unavailable };
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if stem.starts_with('_') {
                continue;
            }

            match Self::load_one(&path) {
                Ok(tool) => {
                    let name = tool.manifest.name.clone();
                    if tools.contains_key(&name) {
                        warn!("duplicate tool '{name}'; keeping the first definition");
                        continue;
                    }
                    info!("loaded tool: {name}");
                    tools.insert(name, Arc::new(tool));
                }
                Err(reason) => {
                    warn!("failed to load tool '{stem}': {reason}");
                    unavailable.insert(stem, reason);
                }
            }
        }

        Tables { tools, unavailable }
    }

    fn load_one(manifest_path: &std::path::Path) -> Result<LoadedTool, String> {
        let raw = std::fs::read_to_string(manifest_path)
            .map_err(|e| format!("cannot read manifest: {e}"))?;
        let manifest: ToolManifest =
            serde_json::from_str(&raw).map_err(|e| format!("invalid manifest: {e}"))?;
        manifest.validate()?;

        let code_path = manifest_path.with_extension("py");
        let code = std::fs::read_to_string(&code_path)
            .map_err(|e| format!("cannot read source {}: {e}", code_path.display()))?;
        if code.trim().is_empty() {
            return Err("source file is empty".to_string());
        }

        Ok(LoadedTool { manifest, code })
    }

    fn build_index(tables: &Tables) -> SearchIndex {
        let mut docs: Vec<ToolDoc> = tables.tools.values().map(|t| t.doc()).collect();
        docs.sort_by(|a, b| a.name.cmp(&b.name));
        SearchIndex::build(docs)
    }

    /// Rescan the tools directory and atomically swap in the new tables.
    pub async fn reload(&self) -> ToolforgeResult<AvailabilityStatus> {
        let new_tables = Self::scan(&self.tools_dir);
        let new_index = Self::build_index(&new_tables);

        {
            let mut tables = self.tables.write().await;
            *tables = new_tables;
        }
        {
            let mut index = self.index.write().await;
            *index = new_index;
        }
        let status = self.availability_status().await;
        info!(
            "registry reloaded: {} available, {} unavailable",
            status.available_tools, status.unavailable_tools
        );
        Ok(status)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<LoadedTool>> {
        self.tables.read().await.tools.get(name).cloned()
    }

    /// Reason a tool failed to load, if it is in the unavailable set.
    pub async fn unavailable_reason(&self, name: &str) -> Option<String> {
        self.tables.read().await.unavailable.get(name).cloned()
    }

    pub async fn is_bugged(&self, name: &str) -> bool {
        self.bugged
            .lock()
            .await
            .get(name)
            .map(|r| r.is_bugged())
            .unwrap_or(false)
    }

    pub async fn bug_record(&self, name: &str) -> Option<BugRecord> {
        self.bugged.lock().await.get(name).cloned()
    }

    /// Record one execution failure. Returns the updated failure count;
    /// reaching [`BUG_THRESHOLD`] flips the tool to bugged.
    pub async fn record_failure(
        &self,
        name: &str,
        error: String,
        params: Value,
        traceback: Option<String>,
    ) -> usize {
        let mut bugged = self.bugged.lock().await;
        let record = bugged.entry(name.to_string()).or_insert_with(|| BugRecord {
            first_failure: Utc::now(),
            failures: Vec::new(),
        });
        record.failures.push(FailureEntry {
            timestamp: Utc::now(),
            error,
            params,
            traceback,
        });
        let count = record.failures.len();
        if count >= BUG_THRESHOLD {
            warn!("tool '{name}' marked as bugged ({count} failures)");
        }
        count
    }

    /// Clear a tool's quarantine. Admin-only at the API surface.
    pub async fn clear_bug(&self, name: &str) {
        if self.bugged.lock().await.remove(name).is_some() {
            info!("bug status cleared for tool '{name}'");
        }
    }

    pub async fn bugged_tools(&self) -> BTreeMap<String, BugRecord> {
        self.bugged
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.is_bugged())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn bugged_names(&self) -> HashSet<String> {
        self.bugged
            .lock()
            .await
            .iter()
            .filter(|(_, r)| r.is_bugged())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub async fn list(&self, include_unavailable: bool, exclude_bugged: bool) -> Vec<ToolSummary> {
        let tables = self.tables.read().await;
        let bugged = self.bugged.lock().await;

        let mut rows: Vec<ToolSummary> = Vec::new();
        for tool in tables.tools.values() {
            let name = &tool.manifest.name;
            let record = bugged.get(name).filter(|r| r.is_bugged());
            if exclude_bugged && record.is_some() {
                continue;
            }
            rows.push(ToolSummary {
                name: name.clone(),
                description: tool.manifest.description.clone(),
                category: tool.manifest.category.clone(),
                tags: tool.manifest.tags.clone(),
                required_params: tool.manifest.required_params.clone(),
                optional_params: tool.manifest.optional_params.clone(),
                available: true,
                is_bugged: record.is_some(),
                bug_count: record.map(|r| r.failures.len()),
                last_failure: record.and_then(|r| r.failures.last().map(|f| f.timestamp)),
                error: None,
            });
        }

        if include_unavailable {
            for (name, reason) in &tables.unavailable {
                rows.push(ToolSummary {
                    name: name.clone(),
                    description: "Tool failed to load".to_string(),
                    category: "unknown".to_string(),
                    tags: Vec::new(),
                    required_params: Vec::new(),
                    optional_params: BTreeMap::new(),
                    available: false,
                    is_bugged: false,
                    bug_count: None,
                    last_failure: None,
                    error: Some(reason.clone()),
                });
            }
        }

        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub async fn availability_status(&self) -> AvailabilityStatus {
        let tables = self.tables.read().await;
        let mut available: Vec<String> = tables.tools.keys().cloned().collect();
        let mut unavailable: Vec<String> = tables.unavailable.keys().cloned().collect();
        let mut bugged: Vec<String> = self.bugged_names().await.into_iter().collect();
        available.sort();
        unavailable.sort();
        bugged.sort();

        AvailabilityStatus {
            total_tools: available.len() + unavailable.len(),
            available_tools: available.len(),
            unavailable_tools: unavailable.len(),
            bugged_tools: bugged.len(),
            available_tool_names: available,
            unavailable_tool_names: unavailable,
            bugged_tool_names: bugged,
        }
    }

    /// Check required parameters against the manifest.
    pub fn validate_params(tool: &LoadedTool, params: &Value) -> ToolforgeResult<()> {
        let missing: Vec<&String> = tool
            .manifest
            .required_params
            .iter()
            .filter(|p| params.get(p.as_str()).is_none())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ToolforgeError::InvalidInput(format!(
                "missing required parameters: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )))
        }
    }

    /// Execute a registry tool. Bugged tools fail fast without touching the
    /// executor; a failed execution is recorded toward quarantine.
    pub async fn execute(
        &self,
        name: &str,
        params: Value,
        executor: &dyn ToolExecutor,
        use_sandbox: bool,
        timeout: Duration,
    ) -> ToolforgeResult<ExecutionRecord> {
        let Some(tool) = self.get(name).await else {
            if let Some(reason) = self.unavailable_reason(name).await {
                return Err(ToolforgeError::Unavailable {
                    name: name.to_string(),
                    reason,
                });
            }
            return Err(ToolforgeError::NotFound(name.to_string()));
        };

        if let Some(record) = self.bug_record(name).await {
            if record.is_bugged() {
                let last_error = record
                    .failures
                    .last()
                    .map(|f| f.error.clone())
                    .unwrap_or_default();
                return Err(ToolforgeError::Bugged {
                    name: name.to_string(),
                    last_error,
                });
            }
        }

        Self::validate_params(&tool, &params)?;

        let request = ExecutionRequest {
            tool_name: name.to_string(),
            code: tool.code.clone(),
            mode: tool.driver_mode(),
            params: params.clone(),
            timeout,
            requirements: tool.manifest.requirements.clone(),
            injected_tools: BTreeMap::new(),
        };

        let record = executor.execute(&request, use_sandbox).await?;
        if !record.success {
            let error = record
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            self.record_failure(name, error, params, record.traceback.clone())
                .await;
        }
        Ok(record)
    }

    /// Rank registry tools against a query.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        category: Option<&str>,
        exclude_bugged: bool,
    ) -> Vec<SearchHit> {
        let excluded = if exclude_bugged {
            self.bugged_names().await
        } else {
            HashSet::new()
        };
        self.index.read().await.search(query, top_k, category, &excluded)
    }

    /// LLM-ready context block for the most relevant tools. Bugged tools
    /// are always excluded here.
    pub async fn tools_context(&self, query: &str, max_tools: usize) -> String {
        let hits = self.search(query, max_tools, None, true).await;
        render_context(query, &hits)
    }

    /// Persist an authored tool into the tools directory. The next
    /// [`reload`](Self::reload) picks it up.
    pub async fn write_tool(&self, manifest: &ToolManifest, code: &str) -> ToolforgeResult<()> {
        manifest
            .validate()
            .map_err(ToolforgeError::InvalidInput)?;
        let base = self.tools_dir.join(&manifest.name);
        let manifest_json = serde_json::to_string_pretty(manifest)
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        tokio::fs::write(base.with_extension("py"), code)
            .await
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        tokio::fs::write(base.with_extension("json"), manifest_json)
            .await
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        info!("persisted tool '{}' to {}", manifest.name, self.tools_dir.display());
        Ok(())
    }
}
