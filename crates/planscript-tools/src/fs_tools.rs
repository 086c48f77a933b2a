//! File tools: READ_FILE, WRITE_FILE, PATCH_FILE
//!
//! All paths resolve through the sandbox before any filesystem access.
//! Patches are whole-file replacements keyed by the REPLACE marker; any
//! other patch format is an explicit error rather than silent corruption.

use async_trait::async_trait;
use serde_json::{json, Value};

use planscript_core::plan::{PlanAction, WriteMode, MAX_READ_BYTES, PATCH_MARKER};
use planscript_core::sandbox::safe_resolve;

use crate::{Tool, ToolCtx, ToolError};

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "READ_FILE"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File to read, relative to the project root."
                },
                "maxBytes": {
                    "type": "integer",
                    "description": "Read limit; defaults to the policy file size cap.",
                    "maximum": MAX_READ_BYTES
                }
            },
            "required": ["path"]
        })
    }

    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError> {
        let PlanAction::ReadFile { path, max_bytes } = action else {
            return Err(ToolError::Io("READ_FILE received a foreign action".to_string()));
        };
        let resolved = safe_resolve(&ctx.root, path)?;

        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| ToolError::from_io(path, &e))?;
        if meta.is_dir() {
            return Err(ToolError::IsDirectory(path.clone()));
        }
        let limit = max_bytes.unwrap_or(ctx.policy.max_file_bytes);
        if meta.len() > limit {
            return Err(ToolError::TooLarge {
                path: path.clone(),
                size: meta.len(),
                limit,
            });
        }

        let bytes = tokio::fs::read(&resolved)
            .await
            .map_err(|e| ToolError::from_io(path, &e))?;
        let content = String::from_utf8_lossy(&bytes).to_string();
        Ok(Value::String(content))
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "WRITE_FILE"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Target file, relative to the project root."
                },
                "content": {
                    "type": "string",
                    "description": "UTF-8 text to write."
                },
                "mode": {
                    "type": "string",
                    "enum": ["overwrite", "create_only"],
                    "description": "create_only fails when the target already exists.",
                    "default": "overwrite"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError> {
        let PlanAction::WriteFile {
            path,
            content,
            mode,
        } = action
        else {
            return Err(ToolError::Io("WRITE_FILE received a foreign action".to_string()));
        };
        let resolved = safe_resolve(&ctx.root, path)?;

        let size = content.len() as u64;
        if size > ctx.policy.max_file_bytes {
            return Err(ToolError::TooLarge {
                path: path.clone(),
                size,
                limit: ctx.policy.max_file_bytes,
            });
        }
        if *mode == WriteMode::CreateOnly && tokio::fs::try_exists(&resolved).await.unwrap_or(false)
        {
            return Err(ToolError::AlreadyExists(path.clone()));
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::from_io(path, &e))?;
        }
        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(|e| ToolError::from_io(path, &e))?;

        Ok(json!({"path": path, "bytes": size}))
    }
}

pub struct PatchFileTool;

#[async_trait]
impl Tool for PatchFileTool {
    fn name(&self) -> &'static str {
        "PATCH_FILE"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Target file, relative to the project root."
                },
                "patch": {
                    "type": "string",
                    "description": "Must begin with 'REPLACE:\\n'; the remainder becomes the new file contents."
                }
            },
            "required": ["path", "patch"]
        })
    }

    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError> {
        let PlanAction::PatchFile { path, patch } = action else {
            return Err(ToolError::Io("PATCH_FILE received a foreign action".to_string()));
        };
        // Validated upstream, but replacement is destructive enough that
        // the marker rule is enforced here too.
        let Some(content) = patch.strip_prefix(PATCH_MARKER) else {
            return Err(ToolError::Schema(
                planscript_core::plan::SchemaError::InvalidField {
                    action: "PATCH_FILE".to_string(),
                    field: "patch".to_string(),
                    reason: format!("must begin with the literal marker {:?}", PATCH_MARKER),
                },
            ));
        };
        let resolved = safe_resolve(&ctx.root, path)?;

        let size = content.len() as u64;
        if size > ctx.policy.max_file_bytes {
            return Err(ToolError::TooLarge {
                path: path.clone(),
                size,
                limit: ctx.policy.max_file_bytes,
            });
        }
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::from_io(path, &e))?;
        }
        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(|e| ToolError::from_io(path, &e))?;

        Ok(json!({"path": path, "bytes": size}))
    }
}
