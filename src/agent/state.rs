//! Parsing of LLM-emitted agent decisions.
//!
//! The model is asked for strict JSON but drifts in practice: code fences,
//! `response` vs `reasoning`, `parameters` vs `params`, flat vs nested
//! action payloads, raw newlines inside code strings. Parsing is tolerant
//! of all of these; only genuinely unusable output becomes a
//! `parse_failure`.

use crate::errors::{ToolforgeError, ToolforgeResult};
use regex::Regex;
use serde_json::{Map, Value};

/// Code fragments that reject a `create_tool` submission outright.
pub const FORBIDDEN_CODE_PATTERNS: &[&str] = &[
    "placeholder",
    "simulated",
    "mock",
    "dummy",
    "fake",
    "todo",
    "not implemented",
    "pass  # implementation",
];

/// Whether authored code contains a forbidden placeholder pattern.
pub fn find_forbidden_pattern(code: &str) -> Option<&'static str> {
    let lower = code.to_lowercase();
    FORBIDDEN_CODE_PATTERNS
        .iter()
        .find(|p| lower.contains(*p))
        .copied()
}

/// Full tool specification supplied by the model for `create_tool`.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub category: String,
    pub required_params: Vec<String>,
    pub optional_params: Value,
    pub return_schema: Option<Value>,
    pub examples: Option<Value>,
    pub tags: Vec<String>,
    pub requirements: Vec<String>,
    pub code: String,
}

#[derive(Debug, Clone)]
pub enum AgentAction {
    Respond {
        answer: Option<String>,
        confidence: Option<String>,
    },
    SearchTools {
        query: String,
    },
    UseTool {
        tool_name: String,
        params: Value,
    },
    CreateTool {
        spec: Box<ToolSpec>,
    },
    AnalyzeForComposite {
        tool_names: Vec<String>,
    },
    Unknown {
        state: String,
    },
}

#[derive(Debug, Clone)]
pub struct AgentDecision {
    /// Raw state string as emitted by the model.
    pub state: String,
    pub reasoning: String,
    pub action: AgentAction,
}

/// Strip a markdown code fence wrapper, if present.
fn strip_code_fences(raw: &str) -> String {
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").expect("static regex is valid");
    if let Some(captures) = fence.captures(raw) {
        return captures[1].to_string();
    }
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim().to_string()
}

/// Re-escape raw control characters that appear inside JSON string values
/// (typically unescaped newlines in generated code bodies).
fn escape_control_chars_in_strings(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut in_string = false;
    let mut escaped = false;
    for c in raw.chars() {
        if in_string {
            if escaped {
                escaped = false;
                out.push(c);
                continue;
            }
            match c {
                '\\' => {
                    escaped = true;
                    out.push(c);
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                }
                c => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

fn first_string(candidates: &[&Value]) -> Option<String> {
    candidates
        .iter()
        .find_map(|v| v.as_str())
        .map(|s| s.to_string())
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn unescape_fragment(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut chars = fragment.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Last-resort field extraction from malformed JSON.
fn salvage(text: &str) -> Option<AgentDecision> {
    let action_re =
        Regex::new(r#""(?:action|state)"\s*:\s*"(\w+)""#).expect("static regex is valid");
    let action = action_re.captures(text)?[1].to_string();

    let string_field = |field: &str| -> Option<String> {
        let re = Regex::new(&format!(r#"(?s)"{field}"\s*:\s*"((?:[^"\\]|\\.)*)""#))
            .expect("static regex is valid");
        re.captures(text).map(|c| unescape_fragment(&c[1]))
    };

    if action == "create_tool" {
        let name = string_field("tool_name").or_else(|| string_field("name"))?;
        let code = string_field("tool_code").or_else(|| string_field("code"))?;
        return Some(AgentDecision {
            state: action,
            reasoning: "Extracted from malformed JSON".to_string(),
            action: AgentAction::CreateTool {
                spec: Box::new(ToolSpec {
                    name,
                    description: string_field("description").unwrap_or_default(),
                    category: "general".to_string(),
                    required_params: Vec::new(),
                    optional_params: Value::Object(Map::new()),
                    return_schema: None,
                    examples: None,
                    tags: Vec::new(),
                    requirements: Vec::new(),
                    code,
                }),
            },
        });
    }

    let response = string_field("response").or_else(|| string_field("final_answer"))?;
    let resolved = if action == "respond" || action == "exit_response" {
        AgentAction::Respond {
            answer: Some(response),
            confidence: None,
        }
    } else {
        AgentAction::Unknown {
            state: action.clone(),
        }
    };
    Some(AgentDecision {
        state: action,
        reasoning: String::new(),
        action: resolved,
    })
}

fn build_decision(v: &Value) -> ToolforgeResult<AgentDecision> {
    let state = v["state"]
        .as_str()
        .or_else(|| v["action"].as_str())
        .ok_or_else(|| {
            ToolforgeError::ParseFailure("missing 'state' or 'action' discriminator".to_string())
        })?
        .to_string();

    // Both shapes are accepted: a nested `action` object, or payload fields
    // at the top level.
    let payload = if v["action"].is_object() {
        v["action"].clone()
    } else {
        v.clone()
    };

    let is_terminal = matches!(state.as_str(), "respond" | "exit_response");
    let mut reasoning =
        first_string(&[&v["reasoning"], &payload["reasoning"]]).unwrap_or_default();
    if reasoning.is_empty() && !is_terminal {
        reasoning = first_string(&[&v["response"]]).unwrap_or_default();
    }

    let action = match state.as_str() {
        "respond" | "exit_response" => AgentAction::Respond {
            answer: first_string(&[
                &payload["final_answer"],
                &payload["answer"],
                &payload["response"],
                &v["final_answer"],
                &v["answer"],
                &v["response"],
            ]),
            confidence: first_string(&[&payload["confidence"], &v["confidence"]]),
        },
        "search_tools" | "fetch_tool" => AgentAction::SearchTools {
            query: first_string(&[&payload["query"], &v["query"]]).unwrap_or_default(),
        },
        "use_tool" => {
            let tool_name = first_string(&[
                &payload["tool_name"],
                &payload["name"],
                &v["tool_name"],
            ])
            .ok_or_else(|| {
                ToolforgeError::ParseFailure("use_tool without a tool name".to_string())
            })?;
            let params = [&payload["params"], &payload["parameters"], &v["params"], &v["parameters"]]
                .into_iter()
                .find(|p| p.is_object())
                .cloned()
                .unwrap_or_else(|| Value::Object(Map::new()));
            AgentAction::UseTool { tool_name, params }
        }
        "create_tool" => {
            let name = first_string(&[&payload["name"], &v["tool_name"], &payload["tool_name"]])
                .ok_or_else(|| {
                    ToolforgeError::ParseFailure("create_tool without a name".to_string())
                })?;
            let code = first_string(&[&payload["code"], &v["tool_code"], &payload["tool_code"]])
                .unwrap_or_default();
            AgentAction::CreateTool {
                spec: Box::new(ToolSpec {
                    name,
                    description: first_string(&[&payload["description"], &v["description"]])
                        .unwrap_or_default(),
                    category: first_string(&[&payload["category"]])
                        .unwrap_or_else(|| "general".to_string()),
                    required_params: string_list(&payload["required_params"]),
                    optional_params: if payload["optional_params"].is_object() {
                        payload["optional_params"].clone()
                    } else {
                        Value::Object(Map::new())
                    },
                    return_schema: payload
                        .get("return_schema")
                        .filter(|v| !v.is_null())
                        .cloned(),
                    examples: payload.get("examples").filter(|v| !v.is_null()).cloned(),
                    tags: string_list(&payload["tags"]),
                    requirements: string_list(&payload["requirements"]),
                    code,
                }),
            }
        }
        "analyze_tools_for_composite" => AgentAction::AnalyzeForComposite {
            tool_names: {
                let mut names = string_list(&payload["tool_names"]);
                if names.is_empty() {
                    names = string_list(&payload["tools"]);
                }
                names
            },
        },
        other => AgentAction::Unknown {
            state: other.to_string(),
        },
    };

    Ok(AgentDecision {
        state,
        reasoning,
        action,
    })
}

/// Parse a raw model response into a decision.
pub fn parse_decision(raw: &str) -> ToolforgeResult<AgentDecision> {
    let text = strip_code_fences(raw);

    if let Ok(v) = serde_json::from_str::<Value>(&text) {
        return build_decision(&v);
    }

    // Second attempt: repair raw control characters inside strings
    // (unescaped newlines in tool code are the usual culprit).
    let repaired = escape_control_chars_in_strings(&text);
    if let Ok(v) = serde_json::from_str::<Value>(&repaired) {
        return build_decision(&v);
    }

    if let Some(decision) = salvage(&text) {
        return Ok(decision);
    }

    Err(ToolforgeError::ParseFailure(format!(
        "response is not valid JSON: {}",
        text.chars().take(200).collect::<String>()
    )))
}
