//! # PlanScript Tools
//!
//! Validated, side-effectful operations. The VM never invokes a tool
//! directly; every dispatch funnels through the runtime's single
//! tool-action path, which charges the budget, checks policy, validates
//! arguments, awaits the tool and emits a `tool` event. This crate owns
//! the tools themselves and the registry that names them.

mod fs_tools;
mod run_cmd;
mod search;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use planscript_core::glob::GlobError;
use planscript_core::plan::{PlanAction, SchemaError};
use planscript_core::policy::{Policy, PolicyViolation};
use planscript_core::sandbox::SandboxError;

pub use fs_tools::{PatchFileTool, ReadFileTool, WriteFileTool};
pub use run_cmd::RunCmdTool;
pub use search::SearchTool;

/// Tool execution failure. Messages carry a remediation hint where one
/// exists; sandbox and policy rejections pass through with their own
/// prefixes.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("ToolError: file not found: {0} (paths are relative to the project root)")]
    NotFound(String),

    #[error("ToolError: {0} is a directory, not a file")]
    IsDirectory(String),

    #[error("ToolError: permission denied for {0}")]
    PermissionDenied(String),

    #[error("ToolError: file too large: {path} is {size} bytes, limit is {limit}")]
    TooLarge {
        path: String,
        size: u64,
        limit: u64,
    },

    #[error("ToolError: {0} already exists (mode create_only refuses to overwrite)")]
    AlreadyExists(String),

    #[error("ToolError: command '{0}' was not found on this system")]
    MissingCommand(String),

    #[error("Timeout: command '{cmd}' exceeded {ms}ms and was killed")]
    CommandTimeout { cmd: String, ms: u64 },

    #[error("ToolError: {0}")]
    Io(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Glob(#[from] GlobError),
}

impl ToolError {
    /// Map a filesystem error onto a specific tool failure kind.
    pub fn from_io(path: &str, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound(path.to_string()),
            ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Io(format!("{}: {}", path, err)),
        }
    }
}

/// Execution context handed to every tool invocation: the project root
/// and a snapshot of the policy active at dispatch time.
#[derive(Debug, Clone)]
pub struct ToolCtx {
    pub root: PathBuf,
    pub policy: Policy,
}

impl ToolCtx {
    pub fn new(root: impl Into<PathBuf>, policy: Policy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }
}

/// The tool abstraction: a named, schema-described operation over a
/// validated Plan action.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name; matches the Plan action tag it serves.
    fn name(&self) -> &'static str;

    /// JSON schema of the accepted argument payload, for prompt catalogs
    /// and diagnostics.
    fn schema(&self) -> Value;

    /// Execute against an already-validated action.
    async fn run(&self, ctx: &ToolCtx, action: &PlanAction) -> Result<Value, ToolError>;
}

/// Stub for the RECALL name. The VM intercepts RECALL before dispatch
/// and routes it to the memory store; the stub only keeps the name
/// registered.
pub struct RecallStubTool;

#[async_trait]
impl Tool for RecallStubTool {
    fn name(&self) -> &'static str {
        "RECALL"
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Recall query; resolved by the memory store."}
            }
        })
    }

    async fn run(&self, _ctx: &ToolCtx, _action: &PlanAction) -> Result<Value, ToolError> {
        Ok(json!({"stub": true}))
    }
}

/// Name-keyed tool collection.
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry with every built-in tool.
    pub fn builtin() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry.register(Arc::new(ReadFileTool));
        registry.register(Arc::new(WriteFileTool));
        registry.register(Arc::new(PatchFileTool));
        registry.register(Arc::new(SearchTool));
        registry.register(Arc::new(RunCmdTool));
        registry.register(Arc::new(RecallStubTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.tools.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Validate args for `name` and execute it. This is the registry
    /// half of the dispatch funnel; budget, policy and event emission
    /// live with the caller.
    pub async fn execute(
        &self,
        ctx: &ToolCtx,
        name: &str,
        args: &Value,
    ) -> Result<Value, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::Schema(SchemaError::UnknownAction(name.to_string())))?;
        let action = PlanAction::parse(name, args)?;
        tool.run(ctx, &action).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
