//! Memory data model

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default cap on STM recent_events.
pub const DEFAULT_WINDOW_STEPS: u64 = 50;

/// One remembered event inside an STM window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StmEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl StmEvent {
    pub fn new(event_type: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Short-term memory: a summary plus a bounded window of recent events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stm {
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objective: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default)]
    pub recent_events: Vec<StmEvent>,
    pub window_steps: u64,
}

impl Default for Stm {
    fn default() -> Self {
        Self {
            summary: String::new(),
            objective: None,
            context: None,
            recent_events: Vec::new(),
            window_steps: DEFAULT_WINDOW_STEPS,
        }
    }
}

/// Long-term memory: facts, per-file summaries, capabilities, glossary
/// and a keyword index over sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Ltm {
    #[serde(default)]
    pub facts: BTreeMap<String, Value>,
    #[serde(default)]
    pub file_summaries: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub glossary: BTreeMap<String, String>,
    #[serde(default)]
    pub index: BTreeMap<String, Vec<String>>,
}

/// One verifiable milestone inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
}

/// Compact, verifiable state for one memory key; survives `forget`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub milestones: BTreeMap<String, Milestone>,
    pub next: String,
    pub timestamp: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(next: impl Into<String>) -> Self {
        Self {
            milestones: BTreeMap::new(),
            next: next.into(),
            timestamp: Utc::now(),
        }
    }

    /// One-line recap used when forget rewrites an STM summary.
    pub fn recap(&self) -> String {
        let done = self.milestones.values().filter(|m| m.ok).count();
        let total = self.milestones.len();
        if total == 0 {
            format!("checkpoint: next {}", self.next)
        } else {
            format!(
                "checkpoint: {}/{} milestones ok; next {}",
                done, total, self.next
            )
        }
    }
}
