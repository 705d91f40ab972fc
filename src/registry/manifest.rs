use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn default_category() -> String {
    "general".to_string()
}

/// Sidecar metadata for one tool in the tools directory.
///
/// Each tool is a `<name>.py` source file plus a `<name>.json` manifest; the
/// manifest carries the full parameter schema so the registry never has to
/// introspect code. An empty `entrypoint` marks script-style tools whose
/// body assigns `result` instead of defining a function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    #[serde(default)]
    pub entrypoint: String,
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Optional parameter name → default value.
    #[serde(default)]
    pub optional_params: BTreeMap<String, Value>,
    /// Parameter name → type name, where the author declared one.
    #[serde(default)]
    pub param_types: BTreeMap<String, String>,
    #[serde(default)]
    pub return_schema: Option<Value>,
    /// Packages installed in the sandbox before execution.
    #[serde(default)]
    pub requirements: Vec<String>,
}

impl ToolManifest {
    /// Validate structural invariants that `serde` cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("manifest is missing 'name'".to_string());
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!(
                "tool name '{}' must be alphanumeric/underscore",
                self.name
            ));
        }
        for p in &self.required_params {
            if self.optional_params.contains_key(p) {
                return Err(format!("parameter '{p}' is both required and optional"));
            }
        }
        Ok(())
    }
}
