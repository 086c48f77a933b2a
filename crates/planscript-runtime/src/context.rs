//! Run context
//!
//! Process-wide shared state for one run: the policy stack, budget
//! tracker, event logger, loop detector, memory store, tool registry and
//! LLM defaults. Sub-workflows get their own context with an isolated
//! policy copy and an independent budget tracker.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};

use planscript_core::budget::{BudgetConfig, BudgetTracker};
use planscript_core::event::{Event, EventKind};
use planscript_core::loopdetect::LoopDetector;
use planscript_core::policy::Policy;
use planscript_core::serialize::ContextFormat;
use planscript_llm::{LlmConfig, LlmTransport};
use planscript_memory::MemoryStore;
use planscript_tools::ToolRegistry;

use crate::VmError;
use crate::logger::RunLogger;

/// Cadence of automatic budget_update events.
const BUDGET_UPDATE_EVERY: u64 = 50;

/// Operator interaction surface: ASK_USER questions and approval gates.
#[async_trait(?Send)]
pub trait Operator {
    async fn ask(&self, question: &str, choices: Option<&[String]>) -> Result<String, VmError>;

    async fn approve(&self, tool: &str, summary: &str) -> Result<bool, VmError>;
}

/// Reads answers from the controlling terminal.
pub struct TtyOperator;

#[async_trait(?Send)]
impl Operator for TtyOperator {
    async fn ask(&self, question: &str, choices: Option<&[String]>) -> Result<String, VmError> {
        println!("[ps] {}", question);
        if let Some(choices) = choices {
            for (i, choice) in choices.iter().enumerate() {
                println!("[ps]   {}. {}", i + 1, choice);
            }
        }
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| VmError::Runtime(format!("reading operator answer: {}", e)))?;
        let answer = line.trim().to_string();
        // A numeric answer selects the choice it names.
        if let (Some(choices), Ok(n)) = (choices, answer.parse::<usize>()) {
            if n >= 1 && n <= choices.len() {
                return Ok(choices[n - 1].clone());
            }
        }
        Ok(answer)
    }

    async fn approve(&self, tool: &str, summary: &str) -> Result<bool, VmError> {
        println!("[ps] approve {}? {} [y/N]", tool, summary);
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| VmError::Runtime(format!("reading approval: {}", e)))?;
        let answer = line.trim().to_ascii_lowercase();
        Ok(matches!(answer.as_str(), "y" | "yes" | "approve"))
    }
}

/// Scripted operator for tests and headless runs: pops prepared answers,
/// approves everything unless told otherwise.
pub struct ScriptedOperator {
    answers: RefCell<Vec<String>>,
    approve_all: bool,
}

impl ScriptedOperator {
    pub fn new(mut answers: Vec<String>, approve_all: bool) -> Self {
        answers.reverse();
        Self {
            answers: RefCell::new(answers),
            approve_all,
        }
    }
}

#[async_trait(?Send)]
impl Operator for ScriptedOperator {
    async fn ask(&self, _question: &str, _choices: Option<&[String]>) -> Result<String, VmError> {
        Ok(self.answers.borrow_mut().pop().unwrap_or_default())
    }

    async fn approve(&self, _tool: &str, _summary: &str) -> Result<bool, VmError> {
        Ok(self.approve_all)
    }
}

/// Shared state for one run.
pub struct RunContext {
    pub root: PathBuf,
    pub logger: RunLogger,
    pub registry: Rc<ToolRegistry>,
    pub memory: Rc<RefCell<MemoryStore>>,
    pub operator: Rc<dyn Operator>,
    pub llm_defaults: LlmConfig,
    /// Test/offline override for the HTTP transport.
    pub transport_override: Option<Arc<dyn LlmTransport>>,
    policy_stack: RefCell<Vec<Policy>>,
    budget: RefCell<BudgetTracker>,
    detector: RefCell<LoopDetector>,
    format: Cell<ContextFormat>,
}

impl RunContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: PathBuf,
        logger: RunLogger,
        policy: Policy,
        budget: BudgetConfig,
        registry: Rc<ToolRegistry>,
        memory: Rc<RefCell<MemoryStore>>,
        operator: Rc<dyn Operator>,
        llm_defaults: LlmConfig,
        transport_override: Option<Arc<dyn LlmTransport>>,
    ) -> Self {
        Self {
            root,
            logger,
            registry,
            memory,
            operator,
            llm_defaults,
            transport_override,
            policy_stack: RefCell::new(vec![policy]),
            budget: RefCell::new(BudgetTracker::new(budget)),
            detector: RefCell::new(LoopDetector::default()),
            format: Cell::new(ContextFormat::Json),
        }
    }

    // ---- policy ----

    /// Snapshot of the currently active policy.
    pub fn active_policy(&self) -> Policy {
        self.policy_stack
            .borrow()
            .last()
            .cloned()
            .unwrap_or_default()
    }

    pub fn push_policy(&self, policy: Policy) {
        self.policy_stack.borrow_mut().push(policy);
    }

    pub fn pop_policy(&self) {
        let mut stack = self.policy_stack.borrow_mut();
        // The base policy is never popped.
        if stack.len() > 1 {
            stack.pop();
        }
    }

    // ---- budget ----

    pub fn budget(&self) -> &RefCell<BudgetTracker> {
        &self.budget
    }

    pub fn current_step(&self) -> u64 {
        self.budget.borrow().steps()
    }

    // ---- loop detector ----

    pub fn detector(&self) -> &RefCell<LoopDetector> {
        &self.detector
    }

    // ---- context format ----

    pub fn context_format(&self) -> ContextFormat {
        self.format.get()
    }

    pub fn set_context_format(&self, format: ContextFormat) {
        self.format.set(format);
    }

    // ---- events ----

    /// Append an event stamped with the current step; every 50th append
    /// also snapshots the budget.
    pub fn emit(&self, kind: EventKind) -> Result<(), VmError> {
        let step = self.current_step();
        let count = self.logger.append(&Event::new(step, kind))?;
        if count % BUDGET_UPDATE_EVERY == 0 {
            let snapshot = self.budget.borrow().snapshot();
            self.logger
                .append(&Event::new(step, EventKind::BudgetUpdate { snapshot }))?;
        }
        Ok(())
    }

    /// Record an error event without failing on logger trouble.
    pub fn emit_error(&self, message: &str) {
        let _ = self.emit(EventKind::Error {
            message: message.to_string(),
        });
    }

    /// Summary written at finalization.
    pub fn summary(&self, ok: bool, error: Option<&str>) -> serde_json::Value {
        json!({
            "ok": ok,
            "error": error,
            "budget": self.budget.borrow().snapshot(),
        })
    }
}
