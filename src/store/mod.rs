//! Persistent store of LLM-authored tools.
//!
//! Owns the `code_tools` table exclusively: authoring, mutation, deletion,
//! execution stats, and the bug lifecycle all go through here. Tool code is
//! script-style Python (reads `params`, assigns `result`) and may call other
//! stored tools through `execute_tool(name, params)`; the static call graph
//! is resolved before launch so the sandbox gets a complete dispatch table.

use crate::errors::{ToolforgeError, ToolforgeResult};
use crate::sandbox::{DriverMode, ExecutionRecord, ExecutionRequest, ToolExecutor};
use crate::search::fuzzy::{fuzzy_score, FuzzyFields, DEFAULT_THRESHOLD};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

/// Failures before a stored tool is quarantined.
const BUG_THRESHOLD: i64 = 2;
/// Maximum composite call-graph depth.
const MAX_COMPOSITE_DEPTH: usize = 8;

/// A row of the `code_tools` table.
#[derive(Debug, Clone, Serialize)]
pub struct StoredTool {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub code: String,
    pub category: Option<String>,
    pub required_params: Vec<String>,
    /// Optional parameter name → default value.
    pub optional_params: Value,
    pub return_schema: Option<Value>,
    pub examples: Option<Value>,
    pub is_active: bool,
    pub is_bugged: bool,
    pub bug_count: i64,
    pub last_bug_report: Option<DateTime<Utc>>,
    /// Append-only failure log.
    pub bug_details: Value,
    pub execution_count: i64,
    pub last_executed: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub requirements: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a tool.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTool {
    pub name: String,
    pub description: String,
    pub code: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    #[serde(default)]
    pub optional_params: Value,
    #[serde(default)]
    pub return_schema: Option<Value>,
    #[serde(default)]
    pub examples: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
}

/// Partial update; only present fields change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolUpdate {
    pub description: Option<String>,
    pub code: Option<String>,
    pub category: Option<String>,
    pub required_params: Option<Vec<String>>,
    pub optional_params: Option<Value>,
    pub return_schema: Option<Value>,
    pub examples: Option<Value>,
    pub is_active: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub requirements: Option<Vec<String>>,
}

/// List filters mirroring the HTTP query parameters.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub active_only: bool,
    pub exclude_bugged: bool,
    pub category: Option<String>,
}

pub struct ToolStore {
    conn: Mutex<Connection>,
}

fn json_column<T: serde::de::DeserializeOwned>(raw: Option<String>, fallback: T) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or(fallback)
}

fn datetime_column(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn row_to_tool(row: &Row<'_>) -> rusqlite::Result<StoredTool> {
    Ok(StoredTool {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        code: row.get("code")?,
        category: row.get("category")?,
        required_params: json_column(row.get("required_params")?, Vec::new()),
        optional_params: json_column(row.get("optional_params")?, json!({})),
        return_schema: row
            .get::<_, Option<String>>("return_schema")?
            .and_then(|s| serde_json::from_str(&s).ok()),
        examples: row
            .get::<_, Option<String>>("examples")?
            .and_then(|s| serde_json::from_str(&s).ok()),
        is_active: row.get("is_active")?,
        is_bugged: row.get("is_bugged")?,
        bug_count: row.get("bug_count")?,
        last_bug_report: datetime_column(row.get("last_bug_report")?),
        bug_details: json_column(row.get("bug_details")?, json!([])),
        execution_count: row.get("execution_count")?,
        last_executed: datetime_column(row.get("last_executed")?),
        tags: json_column(row.get("tags")?, Vec::new()),
        requirements: json_column(row.get("requirements")?, Vec::new()),
        created_at: datetime_column(row.get("created_at")?).unwrap_or_else(Utc::now),
        updated_at: datetime_column(row.get("updated_at")?).unwrap_or_else(Utc::now),
    })
}

const ALL_COLUMNS: &str = "id, name, description, code, category, required_params, \
     optional_params, return_schema, examples, is_active, is_bugged, bug_count, \
     last_bug_report, bug_details, execution_count, last_executed, tags, requirements, \
     created_at, updated_at";

impl ToolStore {
    pub fn open(db_path: impl AsRef<Path>) -> ToolforgeResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ToolforgeError::Config(format!(
                    "cannot create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ToolforgeError::Config(format!("cannot open tool store: {e}")))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )
        .map_err(|e| ToolforgeError::Config(format!("cannot set pragmas: {e}")))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS code_tools (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 name TEXT NOT NULL UNIQUE,
                 description TEXT NOT NULL,
                 code TEXT NOT NULL,
                 category TEXT,
                 required_params TEXT NOT NULL DEFAULT '[]',
                 optional_params TEXT NOT NULL DEFAULT '{}',
                 return_schema TEXT,
                 examples TEXT,
                 is_active INTEGER NOT NULL DEFAULT 1,
                 is_bugged INTEGER NOT NULL DEFAULT 0,
                 bug_count INTEGER NOT NULL DEFAULT 0,
                 last_bug_report TEXT,
                 bug_details TEXT NOT NULL DEFAULT '[]',
                 execution_count INTEGER NOT NULL DEFAULT 0,
                 last_executed TEXT,
                 tags TEXT NOT NULL DEFAULT '[]',
                 requirements TEXT NOT NULL DEFAULT '[]',
                 created_at TEXT NOT NULL,
                 updated_at TEXT NOT NULL
             )",
            [],
        )
        .map_err(|e| ToolforgeError::Config(format!("cannot create schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn create(&self, tool: NewTool) -> ToolforgeResult<StoredTool> {
        if tool.name.is_empty() || tool.code.is_empty() {
            return Err(ToolforgeError::InvalidInput(
                "tool name and code are required".to_string(),
            ));
        }
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.lock();
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM code_tools WHERE name = ?1",
                    params![tool.name],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| ToolforgeError::Internal(e.into()))?;
            if exists.is_some() {
                return Err(ToolforgeError::InvalidInput(format!(
                    "tool with name '{}' already exists",
                    tool.name
                )));
            }

            conn.execute(
                "INSERT INTO code_tools (name, description, code, category, required_params,
                     optional_params, return_schema, examples, tags, requirements,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    tool.name,
                    tool.description,
                    tool.code,
                    tool.category,
                    serde_json::to_string(&tool.required_params).unwrap_or_default(),
                    serde_json::to_string(&tool.optional_params).unwrap_or_default(),
                    tool.return_schema.map(|v| v.to_string()),
                    tool.examples.map(|v| v.to_string()),
                    serde_json::to_string(&tool.tags).unwrap_or_default(),
                    serde_json::to_string(&tool.requirements).unwrap_or_default(),
                    now,
                ],
            )
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        }
        info!("stored new tool '{}'", tool.name);
        self.get_by_name(&tool.name)?
            .ok_or_else(|| ToolforgeError::NotFound(tool.name))
    }

    pub fn get(&self, id: i64) -> ToolforgeResult<Option<StoredTool>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ALL_COLUMNS} FROM code_tools WHERE id = ?1"),
            params![id],
            row_to_tool,
        )
        .optional()
        .map_err(|e| ToolforgeError::Internal(e.into()))
    }

    pub fn get_by_name(&self, name: &str) -> ToolforgeResult<Option<StoredTool>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ALL_COLUMNS} FROM code_tools WHERE name = ?1"),
            params![name],
            row_to_tool,
        )
        .optional()
        .map_err(|e| ToolforgeError::Internal(e.into()))
    }

    /// Resolve an id-or-name path segment.
    pub fn resolve(&self, id_or_name: &str) -> ToolforgeResult<Option<StoredTool>> {
        if let Ok(id) = id_or_name.parse::<i64>() {
            self.get(id)
        } else {
            self.get_by_name(id_or_name)
        }
    }

    pub fn update(&self, id: i64, update: ToolUpdate) -> ToolforgeResult<StoredTool> {
        let Some(mut tool) = self.get(id)? else {
            return Err(ToolforgeError::NotFound(id.to_string()));
        };

        if let Some(v) = update.description {
            tool.description = v;
        }
        if let Some(v) = update.code {
            tool.code = v;
        }
        if let Some(v) = update.category {
            tool.category = Some(v);
        }
        if let Some(v) = update.required_params {
            tool.required_params = v;
        }
        if let Some(v) = update.optional_params {
            tool.optional_params = v;
        }
        if let Some(v) = update.return_schema {
            tool.return_schema = Some(v);
        }
        if let Some(v) = update.examples {
            tool.examples = Some(v);
        }
        if let Some(v) = update.is_active {
            tool.is_active = v;
        }
        if let Some(v) = update.tags {
            tool.tags = v;
        }
        if let Some(v) = update.requirements {
            tool.requirements = v;
        }

        let conn = self.lock();
        conn.execute(
            "UPDATE code_tools SET description = ?1, code = ?2, category = ?3,
                 required_params = ?4, optional_params = ?5, return_schema = ?6,
                 examples = ?7, is_active = ?8, tags = ?9, requirements = ?10,
                 updated_at = ?11
             WHERE id = ?12",
            params![
                tool.description,
                tool.code,
                tool.category,
                serde_json::to_string(&tool.required_params).unwrap_or_default(),
                tool.optional_params.to_string(),
                tool.return_schema.as_ref().map(|v| v.to_string()),
                tool.examples.as_ref().map(|v| v.to_string()),
                tool.is_active,
                serde_json::to_string(&tool.tags).unwrap_or_default(),
                serde_json::to_string(&tool.requirements).unwrap_or_default(),
                Utc::now().to_rfc3339(),
                id,
            ],
        )
        .map_err(|e| ToolforgeError::Internal(e.into()))?;
        drop(conn);

        self.get(id)?.ok_or_else(|| ToolforgeError::NotFound(id.to_string()))
    }

    pub fn delete(&self, id: i64) -> ToolforgeResult<()> {
        let conn = self.lock();
        let affected = conn
            .execute("DELETE FROM code_tools WHERE id = ?1", params![id])
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        if affected == 0 {
            return Err(ToolforgeError::NotFound(id.to_string()));
        }
        info!("deleted stored tool id={id}");
        Ok(())
    }

    pub fn deactivate(&self, id: i64) -> ToolforgeResult<()> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "UPDATE code_tools SET is_active = 0, updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        if affected == 0 {
            return Err(ToolforgeError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn list(&self, filter: &ListFilter) -> ToolforgeResult<Vec<StoredTool>> {
        let conn = self.lock();
        let mut sql = format!("SELECT {ALL_COLUMNS} FROM code_tools WHERE 1=1");
        if filter.active_only {
            sql.push_str(" AND is_active = 1");
        }
        if filter.exclude_bugged {
            sql.push_str(" AND is_bugged = 0");
        }
        if filter.category.is_some() {
            sql.push_str(" AND category = ?1");
        }
        sql.push_str(" ORDER BY id");

        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        let rows = if let Some(category) = &filter.category {
            stmt.query_map(params![category], row_to_tool)
        } else {
            stmt.query_map([], row_to_tool)
        }
        .map_err(|e| ToolforgeError::Internal(e.into()))?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| ToolforgeError::Internal(e.into()))
    }

    pub fn bugged_list(&self) -> ToolforgeResult<Vec<StoredTool>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {ALL_COLUMNS} FROM code_tools WHERE is_bugged = 1 ORDER BY id"
            ))
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        let rows = stmt
            .query_map([], row_to_tool)
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| ToolforgeError::Internal(e.into()))
    }

    /// Clear the bugged flag. The failure log is append-only history and is
    /// preserved.
    pub fn clear_bugs(&self, id: i64) -> ToolforgeResult<()> {
        let conn = self.lock();
        let affected = conn
            .execute(
                "UPDATE code_tools SET is_bugged = 0, bug_count = 0, updated_at = ?1
                 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| ToolforgeError::Internal(e.into()))?;
        if affected == 0 {
            return Err(ToolforgeError::NotFound(id.to_string()));
        }
        info!("cleared bug status for stored tool id={id}");
        Ok(())
    }

    pub fn record_execution_success(&self, id: i64) -> ToolforgeResult<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE code_tools SET execution_count = execution_count + 1,
                 last_executed = ?1 WHERE id = ?2",
            params![Utc::now().to_rfc3339(), id],
        )
        .map_err(|e| ToolforgeError::Internal(e.into()))?;
        Ok(())
    }

    pub fn record_execution_failure(
        &self,
        id: i64,
        error: &str,
        traceback: Option<&str>,
        call_params: &Value,
    ) -> ToolforgeResult<()> {
        let Some(tool) = self.get(id)? else {
            return Err(ToolforgeError::NotFound(id.to_string()));
        };

        let mut details = tool.bug_details.as_array().cloned().unwrap_or_default();
        details.push(json!({
            "timestamp": Utc::now().to_rfc3339(),
            "error": error,
            "traceback": traceback,
            "params": call_params,
        }));
        let bug_count = tool.bug_count + 1;
        let is_bugged = bug_count >= BUG_THRESHOLD;
        if is_bugged {
            warn!("stored tool '{}' marked as bugged ({bug_count} failures)", tool.name);
        }

        let conn = self.lock();
        conn.execute(
            "UPDATE code_tools SET execution_count = execution_count + 1,
                 last_executed = ?1, bug_count = ?2, is_bugged = ?3,
                 last_bug_report = ?1, bug_details = ?4, updated_at = ?1
             WHERE id = ?5",
            params![
                Utc::now().to_rfc3339(),
                bug_count,
                is_bugged,
                Value::Array(details).to_string(),
                id,
            ],
        )
        .map_err(|e| ToolforgeError::Internal(e.into()))?;
        Ok(())
    }

    /// Fuzzy search over stored tools. Returns `(tool, score)` pairs in
    /// descending score order.
    pub fn search(
        &self,
        query: &str,
        limit: usize,
        threshold: Option<f64>,
        exclude_bugged: bool,
    ) -> ToolforgeResult<Vec<(StoredTool, f64)>> {
        let threshold = threshold.unwrap_or(DEFAULT_THRESHOLD);
        let tools = self.list(&ListFilter {
            active_only: false,
            exclude_bugged,
            category: None,
        })?;

        let mut scored: Vec<(StoredTool, f64)> = tools
            .into_iter()
            .filter_map(|tool| {
                let score = fuzzy_score(
                    query,
                    &FuzzyFields {
                        name: &tool.name,
                        description: &tool.description,
                        tags: &tool.tags,
                        category: tool.category.as_deref(),
                        is_active: tool.is_active,
                        is_bugged: tool.is_bugged,
                        execution_count: tool.execution_count,
                    },
                );
                (score > threshold).then_some((tool, score))
            })
            .collect();

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Names referenced by `execute_tool(...)` call sites in `code`.
    pub fn callee_names(code: &str) -> Vec<String> {
        // Compiled on each call; tool authoring is not a hot path.
        let re = Regex::new(r#"execute_tool\(\s*['"]([A-Za-z0-9_]+)['"]"#)
            .expect("static regex is valid");
        let mut names: Vec<String> = re
            .captures_iter(code)
            .map(|c| c[1].to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Resolve the full composite dispatch table for a tool's code: every
    /// transitively referenced stored tool, with cycle and depth refusal.
    /// A bugged or inactive callee fails the whole resolution.
    pub fn resolve_composites(
        &self,
        root_name: &str,
        code: &str,
    ) -> ToolforgeResult<BTreeMap<String, String>> {
        let mut resolved = BTreeMap::new();
        let mut path = vec![root_name.to_string()];
        self.walk_callees(code, &mut path, &mut resolved)?;
        Ok(resolved)
    }

    fn walk_callees(
        &self,
        code: &str,
        path: &mut Vec<String>,
        resolved: &mut BTreeMap<String, String>,
    ) -> ToolforgeResult<()> {
        if path.len() > MAX_COMPOSITE_DEPTH {
            return Err(ToolforgeError::InvalidInput(format!(
                "composite tool nesting exceeds depth {MAX_COMPOSITE_DEPTH}: {}",
                path.join(" -> ")
            )));
        }
        for callee in Self::callee_names(code) {
            if path.contains(&callee) {
                return Err(ToolforgeError::InvalidInput(format!(
                    "composite tool cycle detected: {} -> {callee}",
                    path.join(" -> ")
                )));
            }
            let Some(tool) = self.get_by_name(&callee)? else {
                return Err(ToolforgeError::NotFound(callee));
            };
            if tool.is_bugged {
                let last_error = tool.bug_details.as_array()
                    .and_then(|d| d.last())
                    .and_then(|e| e["error"].as_str())
                    .unwrap_or("")
                    .to_string();
                return Err(ToolforgeError::Bugged {
                    name: callee,
                    last_error,
                });
            }
            if !tool.is_active {
                return Err(ToolforgeError::Unavailable {
                    name: callee,
                    reason: "tool is not active".to_string(),
                });
            }
            if resolved.contains_key(&callee) {
                continue;
            }
            resolved.insert(callee.clone(), tool.code.clone());
            path.push(callee);
            self.walk_callees(&tool.code, path, resolved)?;
            path.pop();
        }
        Ok(())
    }

    /// Execute a stored tool, updating stats and the bug lifecycle.
    pub async fn execute(
        &self,
        tool: &StoredTool,
        call_params: Value,
        executor: &dyn ToolExecutor,
        use_sandbox: bool,
        timeout: Duration,
    ) -> ToolforgeResult<ExecutionRecord> {
        if !tool.is_active {
            return Err(ToolforgeError::Unavailable {
                name: tool.name.clone(),
                reason: "tool is not active".to_string(),
            });
        }
        if tool.is_bugged {
            let last_error = tool
                .bug_details
                .as_array()
                .and_then(|d| d.last())
                .and_then(|e| e["error"].as_str())
                .unwrap_or("")
                .to_string();
            return Err(ToolforgeError::Bugged {
                name: tool.name.clone(),
                last_error,
            });
        }

        let missing: Vec<&String> = tool
            .required_params
            .iter()
            .filter(|p| call_params.get(p.as_str()).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ToolforgeError::InvalidInput(format!(
                "missing required parameters: {}",
                missing
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }

        let injected_tools = self.resolve_composites(&tool.name, &tool.code)?;

        let request = ExecutionRequest {
            tool_name: tool.name.clone(),
            code: tool.code.clone(),
            mode: DriverMode::Script,
            params: call_params.clone(),
            timeout,
            requirements: tool.requirements.clone(),
            injected_tools,
        };

        let record = executor.execute(&request, use_sandbox).await?;
        if record.success {
            self.record_execution_success(tool.id)?;
        } else {
            self.record_execution_failure(
                tool.id,
                record.error.as_deref().unwrap_or("unknown error"),
                record.traceback.as_deref(),
                &call_params,
            )?;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ToolStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ToolStore::open(dir.path().join("tools.db")).unwrap();
        (dir, store)
    }

    fn new_tool(name: &str, code: &str) -> NewTool {
        NewTool {
            name: name.to_string(),
            description: format!("{name} description"),
            code: code.to_string(),
            category: Some("computation".to_string()),
            required_params: vec!["n".to_string()],
            optional_params: json!({}),
            return_schema: None,
            examples: None,
            tags: vec!["math".to_string()],
            requirements: vec![],
        }
    }

    #[test]
    fn create_get_delete_roundtrip() {
        let (_dir, store) = store();
        let created = store.create(new_tool("fact", "result = 1")).unwrap();
        assert_eq!(created.name, "fact");
        assert!(created.is_active);
        assert!(!created.is_bugged);

        let fetched = store.get_by_name("fact").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);

        store.delete(created.id).unwrap();
        assert!(store.get_by_name("fact").unwrap().is_none());
        assert!(matches!(
            store.delete(created.id),
            Err(ToolforgeError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_name_rejected() {
        let (_dir, store) = store();
        store.create(new_tool("dup", "result = 1")).unwrap();
        let err = store.create(new_tool("dup", "result = 2")).unwrap_err();
        assert!(matches!(err, ToolforgeError::InvalidInput(_)));
    }

    #[test]
    fn resolve_accepts_id_or_name() {
        let (_dir, store) = store();
        let created = store.create(new_tool("by_both", "result = 1")).unwrap();
        assert!(store
            .resolve(&created.id.to_string())
            .unwrap()
            .is_some());
        assert!(store.resolve("by_both").unwrap().is_some());
        assert!(store.resolve("missing").unwrap().is_none());
    }

    #[test]
    fn update_changes_only_given_fields() {
        let (_dir, store) = store();
        let created = store.create(new_tool("up", "result = 1")).unwrap();
        let updated = store
            .update(
                created.id,
                ToolUpdate {
                    description: Some("new description".to_string()),
                    ..ToolUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(updated.description, "new description");
        assert_eq!(updated.code, "result = 1");
    }

    #[test]
    fn failure_lifecycle_reaches_quarantine_and_preserves_history() {
        let (_dir, store) = store();
        let created = store.create(new_tool("flaky", "raise_boom")).unwrap();

        store
            .record_execution_failure(created.id, "boom 1", None, &json!({"n": 1}))
            .unwrap();
        let after_one = store.get(created.id).unwrap().unwrap();
        assert_eq!(after_one.bug_count, 1);
        assert!(!after_one.is_bugged);

        store
            .record_execution_failure(created.id, "boom 2", Some("Traceback..."), &json!({"n": 2}))
            .unwrap();
        let after_two = store.get(created.id).unwrap().unwrap();
        assert!(after_two.is_bugged);
        assert_eq!(after_two.bug_details.as_array().unwrap().len(), 2);

        // Clearing the flag keeps the append-only log.
        store.clear_bugs(created.id).unwrap();
        let cleared = store.get(created.id).unwrap().unwrap();
        assert!(!cleared.is_bugged);
        assert_eq!(cleared.bug_count, 0);
        assert_eq!(cleared.bug_details.as_array().unwrap().len(), 2);
    }

    #[test]
    fn list_filters_apply() {
        let (_dir, store) = store();
        let a = store.create(new_tool("active_one", "result = 1")).unwrap();
        let b = store.create(new_tool("inactive_one", "result = 1")).unwrap();
        store.deactivate(b.id).unwrap();
        store
            .record_execution_failure(a.id, "x", None, &json!({}))
            .unwrap();
        store
            .record_execution_failure(a.id, "y", None, &json!({}))
            .unwrap();

        let all = store.list(&ListFilter::default()).unwrap();
        assert_eq!(all.len(), 2);

        let active = store
            .list(&ListFilter {
                active_only: true,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "active_one");

        let healthy = store
            .list(&ListFilter {
                exclude_bugged: true,
                ..ListFilter::default()
            })
            .unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].name, "inactive_one");

        let bugged = store.bugged_list().unwrap();
        assert_eq!(bugged.len(), 1);
        assert_eq!(bugged[0].name, "active_one");
    }

    #[test]
    fn search_ranks_exact_name_first() {
        let (_dir, store) = store();
        store
            .create(new_tool("calculate_factorial", "result = 1"))
            .unwrap();
        store.create(new_tool("get_weather", "result = 1")).unwrap();

        let hits = store.search("factorial", 10, None, true).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].0.name, "calculate_factorial");
        for pair in hits.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn callee_extraction_finds_quoted_names() {
        let code = "a = execute_tool('first', {})\nb = execute_tool(\"second\", {'x': 1})\n";
        assert_eq!(ToolStore::callee_names(code), ["first", "second"]);
        assert!(ToolStore::callee_names("no calls here").is_empty());
    }

    #[test]
    fn composite_resolution_inlines_transitive_callees() {
        let (_dir, store) = store();
        store.create(new_tool("leaf", "result = params['n'] * 2")).unwrap();
        store
            .create(new_tool(
                "middle",
                "result = execute_tool('leaf', {'n': params['n']}) + 1",
            ))
            .unwrap();

        let table = store
            .resolve_composites("root", "x = execute_tool('middle', {'n': 3})\nresult = x")
            .unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains_key("leaf"));
        assert!(table.contains_key("middle"));
    }

    #[test]
    fn composite_cycle_refused() {
        let (_dir, store) = store();
        store
            .create(new_tool("ping", "result = execute_tool('pong', {})"))
            .unwrap();
        store
            .create(new_tool("pong", "result = execute_tool('ping', {})"))
            .unwrap();

        let err = store
            .resolve_composites("ping", "result = execute_tool('pong', {})")
            .unwrap_err();
        assert!(matches!(err, ToolforgeError::InvalidInput(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn composite_bugged_callee_refused() {
        let (_dir, store) = store();
        let callee = store.create(new_tool("shaky", "result = 1")).unwrap();
        store
            .record_execution_failure(callee.id, "a", None, &json!({}))
            .unwrap();
        store
            .record_execution_failure(callee.id, "b", None, &json!({}))
            .unwrap();

        let err = store
            .resolve_composites("root", "result = execute_tool('shaky', {})")
            .unwrap_err();
        assert!(matches!(err, ToolforgeError::Bugged { .. }));
    }

    #[test]
    fn composite_missing_callee_refused() {
        let (_dir, store) = store();
        let err = store
            .resolve_composites("root", "result = execute_tool('nope', {})")
            .unwrap_err();
        assert!(matches!(err, ToolforgeError::NotFound(_)));
    }
}
