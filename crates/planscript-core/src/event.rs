//! Event model
//!
//! Events are the append-only facts of a run. Every event carries the
//! step counter at emission time and a wall-clock timestamp; the stream
//! is totally ordered and replayable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::budget::BudgetSnapshot;

/// Token usage reported by the LLM provider, when available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// The event payload variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// One executed statement.
    Stmt { node: String },

    /// One dispatched tool with its validated input and output.
    Tool {
        name: String,
        input: Value,
        output: Value,
    },

    /// One completed LLM call.
    Llm {
        input: Value,
        plan: Value,
        usage: LlmUsage,
        latency_ms: u64,
        retries: u32,
    },

    /// An error surfaced to the event stream.
    Error { message: String },

    /// The loop detector flagged a pathological pattern.
    LoopWarning { kind: String, suggestion: String },

    /// Periodic snapshot of all budget counters.
    BudgetUpdate { snapshot: BudgetSnapshot },

    /// The runtime is waiting on operator approval for a tool dispatch.
    ApprovalRequest { tool: String, input: Value },

    /// The operator answered an approval request.
    ApprovalResponse { approved: bool },

    /// A child workflow was launched.
    SubworkflowStart {
        child_run_id: String,
        options: Value,
    },

    /// A child workflow finished.
    SubworkflowEnd { child_run_id: String, result: Value },
}

impl EventKind {
    /// Stable label used by summaries and the replay surface.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stmt { .. } => "stmt",
            Self::Tool { .. } => "tool",
            Self::Llm { .. } => "llm",
            Self::Error { .. } => "error",
            Self::LoopWarning { .. } => "loop_warning",
            Self::BudgetUpdate { .. } => "budget_update",
            Self::ApprovalRequest { .. } => "approval_request",
            Self::ApprovalResponse { .. } => "approval_response",
            Self::SubworkflowStart { .. } => "subworkflow_start",
            Self::SubworkflowEnd { .. } => "subworkflow_end",
        }
    }
}

/// One appended event: step counter, timestamp, payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub step: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn new(step: u64, kind: EventKind) -> Self {
        Self {
            step,
            ts: Utc::now(),
            kind,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_round_trips_with_type_tag() {
        let event = Event::new(
            7,
            EventKind::Tool {
                name: "WRITE_FILE".to_string(),
                input: json!({"path": "out.txt"}),
                output: json!({"bytes": 2}),
            },
        );
        let line = serde_json::to_string(&event).expect("serialize");
        assert!(line.contains("\"type\":\"tool\""));
        assert!(line.contains("\"step\":7"));

        let back: Event = serde_json::from_str(&line).expect("deserialize");
        assert_eq!(back.step, 7);
        match back.kind {
            EventKind::Tool { name, .. } => assert_eq!(name, "WRITE_FILE"),
            other => panic!("expected tool event, got {:?}", other),
        }
    }

    #[test]
    fn test_labels_match_wire_tags() {
        let kinds = [
            (
                EventKind::Stmt {
                    node: "If".to_string(),
                },
                "stmt",
            ),
            (
                EventKind::Error {
                    message: "boom".to_string(),
                },
                "error",
            ),
            (
                EventKind::LoopWarning {
                    kind: "exact_repeat".to_string(),
                    suggestion: "vary the plan".to_string(),
                },
                "loop_warning",
            ),
        ];
        for (kind, expected) in kinds {
            assert_eq!(kind.label(), expected);
            let value = serde_json::to_value(Event::new(0, kind)).expect("serialize");
            assert_eq!(value["type"], expected);
        }
    }
}
