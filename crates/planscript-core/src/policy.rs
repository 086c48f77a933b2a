//! Execution policy
//!
//! A Policy is the set of permissions active at a given point of execution:
//! which tools may run, which command tokens RUN_CMD may spawn, whether
//! tool calls require operator approval, and the file size cap. Policies
//! are read through the active context and mutated only by `with policy`
//! blocks, which save and restore in strict LIFO order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::plan::PlanAction;

/// Default file size cap in bytes.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 500_000;

/// Tool or command use rejected by the active policy.
#[derive(Debug, Error)]
pub enum PolicyViolation {
    #[error("PolicyViolation: tool '{0}' is not allowed by the active policy")]
    ToolNotAllowed(String),

    #[error("PolicyViolation: command '{0}' is not in allowCommands")]
    CommandNotAllowed(String),

    #[error("PolicyViolation: operator denied '{0}'")]
    ApprovalDenied(String),
}

/// Active permission set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Tool names that may be dispatched.
    pub allow_tools: BTreeSet<String>,
    /// Command tokens RUN_CMD may spawn.
    pub allow_commands: BTreeSet<String>,
    /// Whether each tool dispatch needs operator approval.
    pub require_approval: bool,
    /// Size cap applied to file reads and writes.
    pub max_file_bytes: u64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_tools: PlanAction::TAGS.iter().map(|t| t.to_string()).collect(),
            allow_commands: BTreeSet::new(),
            require_approval: false,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl Policy {
    /// Restrictive baseline used for non-inheriting sub-workflows:
    /// read-only tools, no commands, no approval gate, 100 kB files.
    pub fn restricted() -> Self {
        Self {
            allow_tools: ["READ_FILE", "SEARCH"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            allow_commands: BTreeSet::new(),
            require_approval: false,
            max_file_bytes: 100_000,
        }
    }

    pub fn check_tool(&self, name: &str) -> Result<(), PolicyViolation> {
        if self.allow_tools.contains(name) {
            Ok(())
        } else {
            Err(PolicyViolation::ToolNotAllowed(name.to_string()))
        }
    }

    pub fn check_command(&self, cmd: &str) -> Result<(), PolicyViolation> {
        if self.allow_commands.contains(cmd) {
            Ok(())
        } else {
            Err(PolicyViolation::CommandNotAllowed(cmd.to_string()))
        }
    }

    /// Overlay fields from a `with policy {…}` object literal. Recognized
    /// keys: `allowActions` (maps onto `allow_tools`), `allowCommands`,
    /// `requireApproval`, `maxFileBytes`. Unknown keys are ignored.
    pub fn overlay(&self, spec: &Value) -> Self {
        let mut next = self.clone();
        if let Some(tools) = string_set(spec.get("allowActions")) {
            next.allow_tools = tools;
        }
        if let Some(commands) = string_set(spec.get("allowCommands")) {
            next.allow_commands = commands;
        }
        if let Some(flag) = spec.get("requireApproval").and_then(|v| v.as_bool()) {
            next.require_approval = flag;
        }
        if let Some(max) = spec.get("maxFileBytes").and_then(|v| v.as_u64()) {
            next.max_file_bytes = max;
        }
        next
    }
}

fn string_set(value: Option<&Value>) -> Option<BTreeSet<String>> {
    value.and_then(|v| v.as_array()).map(|items| {
        items
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect()
    })
}
