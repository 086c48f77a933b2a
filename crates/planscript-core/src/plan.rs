//! Plan schema
//!
//! A Plan is the tagged single-action object the LLM returns and the tool
//! dispatcher consumes. Canonical wire form:
//!
//! ```json
//! {"action": "WRITE_FILE", "args": {"path": "...", "content": "..."},
//!  "done": true, "confidence": 0.9, "reason": "..."}
//! ```
//!
//! Seven action tags are recognized; each carries its own validated
//! argument payload.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Required prefix for PATCH_FILE payloads. Everything after the marker is
/// the new file content.
pub const PATCH_MARKER: &str = "REPLACE:\n";

/// Upper bound on READ_FILE `maxBytes`.
pub const MAX_READ_BYTES: u64 = 500_000;
/// Upper bound on SEARCH `maxResults`.
pub const MAX_SEARCH_RESULTS: u64 = 5_000;
/// Upper bound on RUN_CMD `timeoutMs`.
pub const MAX_CMD_TIMEOUT_MS: u64 = 120_000;

/// Plan or tool-argument validation failure.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("SchemaError: {action}.{field} is required")]
    MissingField { action: String, field: String },

    #[error("SchemaError: {action}.{field}: {reason}")]
    InvalidField {
        action: String,
        field: String,
        reason: String,
    },

    #[error("SchemaError: unknown action '{0}'")]
    UnknownAction(String),

    #[error("SchemaError: {0}")]
    Malformed(String),
}

/// WRITE_FILE collision behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace existing content (default).
    Overwrite,
    /// Fail when the target already exists.
    CreateOnly,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::CreateOnly => "create_only",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "overwrite" => Some(Self::Overwrite),
            "create_only" => Some(Self::CreateOnly),
            _ => None,
        }
    }
}

/// The seven action kinds with their validated argument payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    ReadFile {
        path: String,
        max_bytes: Option<u64>,
    },
    Search {
        query: String,
        globs: Vec<String>,
        max_results: Option<u64>,
    },
    WriteFile {
        path: String,
        content: String,
        mode: WriteMode,
    },
    PatchFile {
        path: String,
        patch: String,
    },
    RunCmd {
        cmd: String,
        args: Vec<String>,
        timeout_ms: Option<u64>,
    },
    AskUser {
        question: String,
        choices: Option<Vec<String>>,
    },
    Report {
        message: String,
        files_changed: Vec<String>,
        next_suggestions: Vec<String>,
    },
}

impl PlanAction {
    /// All recognized action tags, in wire order.
    pub const TAGS: [&'static str; 7] = [
        "READ_FILE",
        "SEARCH",
        "WRITE_FILE",
        "PATCH_FILE",
        "RUN_CMD",
        "ASK_USER",
        "REPORT",
    ];

    /// Wire tag for this action.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "READ_FILE",
            Self::Search { .. } => "SEARCH",
            Self::WriteFile { .. } => "WRITE_FILE",
            Self::PatchFile { .. } => "PATCH_FILE",
            Self::RunCmd { .. } => "RUN_CMD",
            Self::AskUser { .. } => "ASK_USER",
            Self::Report { .. } => "REPORT",
        }
    }

    /// Parse and validate the argument payload for the given tag.
    pub fn parse(tag: &str, args: &Value) -> Result<Self, SchemaError> {
        let args = args.as_object().cloned().unwrap_or_default();
        match tag {
            "READ_FILE" => {
                let path = require_string(tag, &args, "path")?;
                let max_bytes = optional_u64(tag, &args, "maxBytes")?;
                if let Some(max) = max_bytes {
                    bounded(tag, "maxBytes", max, MAX_READ_BYTES)?;
                }
                Ok(Self::ReadFile { path, max_bytes })
            }
            "SEARCH" => {
                let query = require_string(tag, &args, "query")?;
                let globs = optional_string_array(tag, &args, "globs")?.unwrap_or_default();
                let max_results = optional_u64(tag, &args, "maxResults")?;
                if let Some(max) = max_results {
                    bounded(tag, "maxResults", max, MAX_SEARCH_RESULTS)?;
                }
                Ok(Self::Search {
                    query,
                    globs,
                    max_results,
                })
            }
            "WRITE_FILE" => {
                let path = require_string(tag, &args, "path")?;
                let content = require_string(tag, &args, "content")?;
                let mode = match optional_string(tag, &args, "mode")? {
                    None => WriteMode::Overwrite,
                    Some(raw) => WriteMode::parse(&raw).ok_or_else(|| {
                        SchemaError::InvalidField {
                            action: tag.to_string(),
                            field: "mode".to_string(),
                            reason: format!("expected overwrite|create_only, got '{}'", raw),
                        }
                    })?,
                };
                Ok(Self::WriteFile {
                    path,
                    content,
                    mode,
                })
            }
            "PATCH_FILE" => {
                let path = require_string(tag, &args, "path")?;
                let patch = require_string(tag, &args, "patch")?;
                if !patch.starts_with(PATCH_MARKER) {
                    return Err(SchemaError::InvalidField {
                        action: tag.to_string(),
                        field: "patch".to_string(),
                        reason: format!("must begin with the literal marker {:?}", PATCH_MARKER),
                    });
                }
                Ok(Self::PatchFile { path, patch })
            }
            "RUN_CMD" => {
                let cmd = require_string(tag, &args, "cmd")?;
                let cmd_args = optional_string_array(tag, &args, "args")?.unwrap_or_default();
                let timeout_ms = optional_u64(tag, &args, "timeoutMs")?;
                if let Some(max) = timeout_ms {
                    bounded(tag, "timeoutMs", max, MAX_CMD_TIMEOUT_MS)?;
                }
                Ok(Self::RunCmd {
                    cmd,
                    args: cmd_args,
                    timeout_ms,
                })
            }
            "ASK_USER" => {
                let question = require_string(tag, &args, "question")?;
                let choices = optional_string_array(tag, &args, "choices")?;
                if let Some(choices) = &choices {
                    if choices.is_empty() {
                        return Err(SchemaError::InvalidField {
                            action: tag.to_string(),
                            field: "choices".to_string(),
                            reason: "must contain at least one choice".to_string(),
                        });
                    }
                }
                Ok(Self::AskUser { question, choices })
            }
            "REPORT" => {
                let message = require_string(tag, &args, "message")?;
                let files_changed =
                    optional_string_array(tag, &args, "filesChanged")?.unwrap_or_default();
                let next_suggestions =
                    optional_string_array(tag, &args, "nextSuggestions")?.unwrap_or_default();
                Ok(Self::Report {
                    message,
                    files_changed,
                    next_suggestions,
                })
            }
            other => Err(SchemaError::UnknownAction(other.to_string())),
        }
    }

    /// Canonical wire form of the argument payload.
    pub fn args_value(&self) -> Value {
        match self {
            Self::ReadFile { path, max_bytes } => {
                let mut map = Map::new();
                map.insert("path".to_string(), json!(path));
                if let Some(max) = max_bytes {
                    map.insert("maxBytes".to_string(), json!(max));
                }
                Value::Object(map)
            }
            Self::Search {
                query,
                globs,
                max_results,
            } => {
                let mut map = Map::new();
                map.insert("query".to_string(), json!(query));
                if !globs.is_empty() {
                    map.insert("globs".to_string(), json!(globs));
                }
                if let Some(max) = max_results {
                    map.insert("maxResults".to_string(), json!(max));
                }
                Value::Object(map)
            }
            Self::WriteFile {
                path,
                content,
                mode,
            } => json!({"path": path, "content": content, "mode": mode.as_str()}),
            Self::PatchFile { path, patch } => json!({"path": path, "patch": patch}),
            Self::RunCmd {
                cmd,
                args,
                timeout_ms,
            } => {
                let mut map = Map::new();
                map.insert("cmd".to_string(), json!(cmd));
                if !args.is_empty() {
                    map.insert("args".to_string(), json!(args));
                }
                if let Some(ms) = timeout_ms {
                    map.insert("timeoutMs".to_string(), json!(ms));
                }
                Value::Object(map)
            }
            Self::AskUser { question, choices } => {
                let mut map = Map::new();
                map.insert("question".to_string(), json!(question));
                if let Some(choices) = choices {
                    map.insert("choices".to_string(), json!(choices));
                }
                Value::Object(map)
            }
            Self::Report {
                message,
                files_changed,
                next_suggestions,
            } => {
                let mut map = Map::new();
                map.insert("message".to_string(), json!(message));
                if !files_changed.is_empty() {
                    map.insert("filesChanged".to_string(), json!(files_changed));
                }
                if !next_suggestions.is_empty() {
                    map.insert("nextSuggestions".to_string(), json!(next_suggestions));
                }
                Value::Object(map)
            }
        }
    }
}

/// A validated Plan: common envelope plus one tagged action.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub action: PlanAction,
    pub done: bool,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
}

impl Plan {
    pub fn new(action: PlanAction) -> Self {
        Self {
            action,
            done: false,
            confidence: None,
            reason: None,
        }
    }

    pub fn done(mut self) -> Self {
        self.done = true;
        self
    }

    /// Parse a plan from its canonical JSON representation.
    pub fn from_value(value: &Value) -> Result<Self, SchemaError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SchemaError::Malformed("plan must be a JSON object".to_string()))?;
        let tag = obj
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SchemaError::Malformed("plan is missing 'action'".to_string()))?;
        let empty = Value::Object(Map::new());
        let args = obj.get("args").unwrap_or(&empty);
        let action = PlanAction::parse(tag, args)?;

        let done = match obj.get("done") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    action: tag.to_string(),
                    field: "done".to_string(),
                    reason: format!("expected boolean, got {}", json_type_name(other)),
                })
            }
        };
        let confidence = match obj.get("confidence") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64().map(|c| c.clamp(0.0, 1.0)),
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    action: tag.to_string(),
                    field: "confidence".to_string(),
                    reason: format!("expected number, got {}", json_type_name(other)),
                })
            }
        };
        let reason = match obj.get("reason") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => {
                return Err(SchemaError::InvalidField {
                    action: tag.to_string(),
                    field: "reason".to_string(),
                    reason: format!("expected string, got {}", json_type_name(other)),
                })
            }
        };

        Ok(Self {
            action,
            done,
            confidence,
            reason,
        })
    }

    /// Canonical JSON representation.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        map.insert("action".to_string(), json!(self.action.name()));
        map.insert("args".to_string(), self.action.args_value());
        map.insert("done".to_string(), json!(self.done));
        if let Some(confidence) = self.confidence {
            map.insert("confidence".to_string(), json!(confidence));
        }
        if let Some(reason) = &self.reason {
            map.insert("reason".to_string(), json!(reason));
        }
        Value::Object(map)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn require_string(
    action: &str,
    args: &Map<String, Value>,
    field: &str,
) -> Result<String, SchemaError> {
    match args.get(field) {
        None | Some(Value::Null) => Err(SchemaError::MissingField {
            action: action.to_string(),
            field: field.to_string(),
        }),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(SchemaError::InvalidField {
            action: action.to_string(),
            field: field.to_string(),
            reason: format!("expected string, got {}", json_type_name(other)),
        }),
    }
}

fn optional_string(
    action: &str,
    args: &Map<String, Value>,
    field: &str,
) -> Result<Option<String>, SchemaError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(SchemaError::InvalidField {
            action: action.to_string(),
            field: field.to_string(),
            reason: format!("expected string, got {}", json_type_name(other)),
        }),
    }
}

fn optional_u64(
    action: &str,
    args: &Map<String, Value>,
    field: &str,
) -> Result<Option<u64>, SchemaError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(v) => Ok(Some(v)),
            None => Err(SchemaError::InvalidField {
                action: action.to_string(),
                field: field.to_string(),
                reason: "expected a non-negative integer".to_string(),
            }),
        },
        Some(other) => Err(SchemaError::InvalidField {
            action: action.to_string(),
            field: field.to_string(),
            reason: format!("expected integer, got {}", json_type_name(other)),
        }),
    }
}

fn optional_string_array(
    action: &str,
    args: &Map<String, Value>,
    field: &str,
) -> Result<Option<Vec<String>>, SchemaError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return Err(SchemaError::InvalidField {
                            action: action.to_string(),
                            field: field.to_string(),
                            reason: format!(
                                "expected array of strings, found {}",
                                json_type_name(item)
                            ),
                        })
                    }
                }
            }
            Ok(Some(out))
        }
        Some(other) => Err(SchemaError::InvalidField {
            action: action.to_string(),
            field: field.to_string(),
            reason: format!("expected array, got {}", json_type_name(other)),
        }),
    }
}

fn bounded(action: &str, field: &str, value: u64, max: u64) -> Result<(), SchemaError> {
    if value > max {
        return Err(SchemaError::InvalidField {
            action: action.to_string(),
            field: field.to_string(),
            reason: format!("{} exceeds the maximum of {}", value, max),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write_file_round_trip() {
        let raw = json!({
            "action": "WRITE_FILE",
            "args": {"path": "out.txt", "content": "hi"},
            "done": true
        });
        let plan = Plan::from_value(&raw).expect("parse plan");
        assert!(plan.done);
        match &plan.action {
            PlanAction::WriteFile {
                path,
                content,
                mode,
            } => {
                assert_eq!(path, "out.txt");
                assert_eq!(content, "hi");
                assert_eq!(*mode, WriteMode::Overwrite);
            }
            other => panic!("expected WRITE_FILE, got {:?}", other),
        }
        let back = plan.to_value();
        assert_eq!(back["action"], "WRITE_FILE");
        assert_eq!(back["args"]["path"], "out.txt");
    }

    #[test]
    fn test_missing_required_field_is_schema_error() {
        let raw = json!({"action": "READ_FILE", "args": {}});
        let err = Plan::from_value(&raw).expect_err("should reject");
        assert!(err.to_string().starts_with("SchemaError:"));
        assert!(err.to_string().contains("path"));
    }

    #[test]
    fn test_wrong_type_field_is_schema_error() {
        let raw = json!({"action": "SEARCH", "args": {"query": 42}});
        let err = Plan::from_value(&raw).expect_err("should reject");
        assert!(err.to_string().contains("expected string"));
    }

    #[test]
    fn test_every_tag_rejects_empty_args_when_required() {
        for tag in PlanAction::TAGS {
            let raw = json!({"action": tag, "args": {}});
            assert!(
                Plan::from_value(&raw).is_err(),
                "tag {} should require at least one field",
                tag
            );
        }
    }

    #[test]
    fn test_patch_file_requires_replace_marker() {
        let ok = json!({
            "action": "PATCH_FILE",
            "args": {"path": "a.txt", "patch": "REPLACE:\nnew content"}
        });
        assert!(Plan::from_value(&ok).is_ok());

        let bad = json!({
            "action": "PATCH_FILE",
            "args": {"path": "a.txt", "patch": "diff --git a/a.txt"}
        });
        let err = Plan::from_value(&bad).expect_err("should reject non-marker patch");
        assert!(err.to_string().contains("REPLACE"));
    }

    #[test]
    fn test_bounds_are_enforced() {
        let too_big = json!({
            "action": "READ_FILE",
            "args": {"path": "a", "maxBytes": 500_001}
        });
        assert!(Plan::from_value(&too_big).is_err());

        let too_many = json!({
            "action": "SEARCH",
            "args": {"query": "x", "maxResults": 5_001}
        });
        assert!(Plan::from_value(&too_many).is_err());

        let too_long = json!({
            "action": "RUN_CMD",
            "args": {"cmd": "ls", "timeoutMs": 120_001}
        });
        assert!(Plan::from_value(&too_long).is_err());
    }

    #[test]
    fn test_ask_user_choices_must_be_non_empty() {
        let raw = json!({
            "action": "ASK_USER",
            "args": {"question": "pick one", "choices": []}
        });
        assert!(Plan::from_value(&raw).is_err());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let raw = json!({"action": "DELETE_EVERYTHING", "args": {}});
        match Plan::from_value(&raw) {
            Err(SchemaError::UnknownAction(name)) => assert_eq!(name, "DELETE_EVERYTHING"),
            other => panic!("expected UnknownAction, got {:?}", other),
        }
    }

    #[test]
    fn test_confidence_is_clamped() {
        let raw = json!({
            "action": "REPORT",
            "args": {"message": "ok"},
            "confidence": 1.7
        });
        let plan = Plan::from_value(&raw).expect("parse");
        assert_eq!(plan.confidence, Some(1.0));
    }
}
