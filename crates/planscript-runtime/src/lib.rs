//! # PlanScript Runtime
//!
//! The tree-walking VM and everything it routes to: the tool dispatch
//! funnel, the agent loop, `parallel`, the sub-workflow executor, the
//! append-only run logger, and the replay surface.

pub mod agent;
pub mod builtins;
pub mod context;
pub mod dispatch;
pub mod logger;
pub mod parallel;
pub mod replay;
pub mod subflow;
pub mod value;
pub mod vm;

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use planscript_core::budget::{BudgetConfig, BudgetError};
use planscript_core::plan::SchemaError;
use planscript_core::policy::{Policy, PolicyViolation};
use planscript_core::sandbox::SandboxError;
use planscript_lang::ParseError;
use planscript_llm::{LlmConfig, LlmError, LlmTransport};
use planscript_memory::{MemoryError, MemoryStore};
use planscript_tools::{ToolError, ToolRegistry};

pub use context::{Operator, RunContext, ScriptedOperator, TtyOperator};
pub use logger::RunLogger;
pub use replay::replay_run;
pub use value::Value;
pub use vm::Vm;

/// Any failure the runtime can surface. Display strings keep the fixed
/// per-kind prefixes (ParseError, SchemaError, PolicyViolation,
/// BudgetExceeded, LoopDetected, ToolError, Timeout, Guard failed).
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Budget(#[from] BudgetError),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("LoopDetected: {0}")]
    LoopDetected(String),

    #[error("Timeout: operation exceeded {0}ms")]
    Timeout(u64),

    #[error("Guard failed: line {0}")]
    GuardFailed(usize),

    #[error("VmError: {0}")]
    Runtime(String),

    #[error("LogError: {0}")]
    Log(String),
}

/// Options for one run.
pub struct RunOptions {
    pub policy: Policy,
    pub budget: BudgetConfig,
    pub llm: LlmConfig,
    pub run_id: Option<String>,
    pub operator: Option<Rc<dyn Operator>>,
    pub transport: Option<Arc<dyn LlmTransport>>,
    /// Share an existing memory store (sub-workflows with
    /// `inherit_memory`, multi-run tooling). A fresh store otherwise.
    pub memory: Option<Rc<RefCell<MemoryStore>>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            budget: BudgetConfig::default(),
            llm: LlmConfig::default(),
            run_id: None,
            operator: None,
            transport: None,
            memory: None,
        }
    }
}

/// One finished run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: String,
    pub logs_dir: PathBuf,
    /// Top-level `return` value of the script, if any.
    pub result: Option<serde_json::Value>,
}

/// Parse and execute a script file against a project root.
pub async fn run_script_file(
    root: &Path,
    script_path: &Path,
    options: RunOptions,
) -> Result<RunOutcome, VmError> {
    let source = std::fs::read_to_string(script_path)
        .map_err(|e| VmError::Runtime(format!("reading {}: {}", script_path.display(), e)))?;
    run_script_source(root, &source, options).await
}

/// Parse and execute script text against a project root.
pub async fn run_script_source(
    root: &Path,
    source: &str,
    options: RunOptions,
) -> Result<RunOutcome, VmError> {
    let stmts = planscript_lang::parse_script(source)?;

    let run_id = options
        .run_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let logger = RunLogger::create(root, run_id.clone())?;
    let memory = options
        .memory
        .unwrap_or_else(|| Rc::new(RefCell::new(MemoryStore::new(root))));
    let operator: Rc<dyn Operator> = options.operator.unwrap_or_else(|| Rc::new(TtyOperator));
    let ctx = Rc::new(RunContext::new(
        root.to_path_buf(),
        logger,
        options.policy,
        options.budget,
        Rc::new(ToolRegistry::builtin()),
        memory,
        operator,
        options.llm,
        options.transport,
    ));

    info!(run_id = %run_id, root = %root.display(), "run started");
    let vm = Vm::new(ctx.clone());
    match vm.run(&stmts).await {
        Ok(result) => {
            ctx.logger.finalize(&ctx.summary(true, None))?;
            info!(run_id = %run_id, "run finished");
            Ok(RunOutcome {
                run_id,
                logs_dir: ctx.logger.dir().to_path_buf(),
                result,
            })
        }
        Err(e) => {
            let message = e.to_string();
            ctx.emit_error(&message);
            let _ = ctx.logger.finalize(&ctx.summary(false, Some(&message)));
            error!(run_id = %run_id, error = %message, "run failed");
            Err(e)
        }
    }
}
