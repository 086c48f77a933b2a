//! SEARCH tool
//!
//! Depth-first walk of the project root. `.git` and `node_modules` are
//! never descended. Non-empty `globs` filter entries; a non-empty query
//! records `{path, line, text}` for every matching line of files under
//! the size cutoff. Results come back sorted by `(path, line)`.

use async_trait::async_trait;
use serde_json::{json, Value};
use walkdir::WalkDir;

use planscript_core::glob::GlobPattern;
use planscript_core::plan::{PlanAction, MAX_SEARCH_RESULTS};
use planscript_core::sandbox::is_sensitive_component;

use crate::{Tool, ToolCtx, ToolError};

/// Files larger than this are not scanned for query matches.
const MAX_SCANNED_FILE_BYTES: u64 = 500_000;
/// Result cap when the caller does not pass `maxResults`.
const DEFAULT_MAX_RESULTS: usize = 1_000;
/// Matched line text is cut at this many characters.
const MAX_LINE_TEXT_CHARS: usize = 300;

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &'static str {
        "SEARCH"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Substring to find; empty lists matched files without scanning."
                },
                "globs": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Glob filters over root-relative paths. Supports *, ** and ?."
                },
                "maxResults": {
                    "type": "integer",
                    "description": "Result cap.",
                    "maximum": MAX_SEARCH_RESULTS
                }
            },
            "required": ["query"]
        })
    }

    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError> {
        let PlanAction::Search {
            query,
            globs,
            max_results,
        } = action
        else {
            return Err(ToolError::Io("SEARCH received a foreign action".to_string()));
        };

        let patterns = globs
            .iter()
            .map(|g| GlobPattern::new(g))
            .collect::<Result<Vec<_>, _>>()?;
        let cap = max_results
            .map(|m| m as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let root = ctx
            .root
            .canonicalize()
            .map_err(|e| ToolError::Io(format!("project root: {}", e)))?;

        let mut results = Vec::new();
        let walker = WalkDir::new(&root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0 || !is_sensitive_component(&name)
            });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                // Unreadable subtrees are skipped, not fatal.
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = match entry.path().strip_prefix(&root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let rel_text = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if !patterns.is_empty() && !patterns.iter().any(|p| p.matches(&rel_text)) {
                continue;
            }

            if query.is_empty() {
                results.push(json!({"path": rel_text}));
                if results.len() >= cap {
                    break;
                }
                continue;
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if size > MAX_SCANNED_FILE_BYTES {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(entry.path()).await else {
                continue;
            };
            let content = String::from_utf8_lossy(&bytes);
            for (idx, line) in content.lines().enumerate() {
                if !line.contains(query.as_str()) {
                    continue;
                }
                let text: String = line.chars().take(MAX_LINE_TEXT_CHARS).collect();
                results.push(json!({
                    "path": rel_text,
                    "line": idx + 1,
                    "text": text,
                }));
                if results.len() >= cap {
                    break;
                }
            }
            if results.len() >= cap {
                break;
            }
        }

        results.sort_by(|a, b| {
            let path_a = a.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            let path_b = b.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            let line_a = a.get("line").and_then(|v| v.as_u64()).unwrap_or(0);
            let line_b = b.get("line").and_then(|v| v.as_u64()).unwrap_or(0);
            path_a.cmp(path_b).then(line_a.cmp(&line_b))
        });
        Ok(Value::Array(results))
    }
}
