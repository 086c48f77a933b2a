//! Replay
//!
//! Reads a run's events.jsonl and reconstructs a human-readable
//! timeline. Sub-runs referenced by subworkflow_end events are stitched
//! in beneath their parent entry, indented one level per depth.

use std::fmt::Write as _;
use std::path::Path;

use serde_json::Value as Json;

use planscript_core::event::{Event, EventKind};

use crate::VmError;

const MAX_DETAIL_CHARS: usize = 120;
/// Runaway nesting guard for cyclic or corrupted child references.
const MAX_DEPTH: usize = 8;

/// Render the timeline of a run, following child runs.
pub fn replay_run(project_root: &Path, run_id: &str) -> Result<String, VmError> {
    let mut out = String::new();
    render_run(project_root, run_id, 0, &mut out)?;
    Ok(out)
}

fn render_run(
    project_root: &Path,
    run_id: &str,
    depth: usize,
    out: &mut String,
) -> Result<(), VmError> {
    let dir = project_root.join(".ps-runs").join(run_id);
    let events_path = dir.join("events.jsonl");
    let text = std::fs::read_to_string(&events_path)
        .map_err(|e| VmError::Runtime(format!("no run '{}': {}", run_id, e)))?;
    let pad = "  ".repeat(depth);

    let _ = writeln!(out, "{}=== run {} ===", pad, run_id);
    for line in text.lines() {
        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(_) => {
                let _ = writeln!(out, "{}  <unreadable event line>", pad);
                continue;
            }
        };
        let _ = writeln!(
            out,
            "{}{} #{:<4} {:<18} {}",
            pad,
            event.ts.format("%H:%M:%S%.3f"),
            event.step,
            event.kind.label(),
            detail(&event.kind)
        );
        if let EventKind::SubworkflowEnd { child_run_id, .. } = &event.kind {
            if depth < MAX_DEPTH {
                // A missing child directory is reported inline rather
                // than failing the whole replay.
                if render_run(project_root, child_run_id, depth + 1, out).is_err() {
                    let _ = writeln!(out, "{}  (child run {} not found)", pad, child_run_id);
                }
            }
        }
    }

    if let Ok(summary_text) = std::fs::read_to_string(dir.join("summary.json")) {
        if let Ok(summary) = serde_json::from_str::<Json>(&summary_text) {
            let ok = summary.get("ok").and_then(|v| v.as_bool()).unwrap_or(false);
            let disposition = if ok {
                "ok".to_string()
            } else {
                format!(
                    "error: {}",
                    summary
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown")
                )
            };
            let _ = writeln!(out, "{}=== end {} ({}) ===", pad, run_id, disposition);
        }
    }
    Ok(())
}

fn detail(kind: &EventKind) -> String {
    let text = match kind {
        EventKind::Stmt { node } => node.clone(),
        EventKind::Tool { name, output, .. } => format!("{} -> {}", name, output),
        EventKind::Llm {
            plan,
            latency_ms,
            retries,
            ..
        } => format!(
            "{} ({}ms, {} retries)",
            plan.get("action").and_then(|v| v.as_str()).unwrap_or("?"),
            latency_ms,
            retries
        ),
        EventKind::Error { message } => message.clone(),
        EventKind::LoopWarning { kind, suggestion } => format!("{}: {}", kind, suggestion),
        EventKind::BudgetUpdate { snapshot } => format!(
            "steps={} tools={} llm={} tokens={} cost=${:.4}",
            snapshot.steps,
            snapshot.tool_calls,
            snapshot.llm_calls,
            snapshot.tokens,
            snapshot.cost_usd
        ),
        EventKind::ApprovalRequest { tool, .. } => format!("awaiting approval for {}", tool),
        EventKind::ApprovalResponse { approved } => {
            format!("{}", if *approved { "approved" } else { "denied" })
        }
        EventKind::SubworkflowStart { child_run_id, .. } => format!("-> {}", child_run_id),
        EventKind::SubworkflowEnd {
            child_run_id,
            result,
        } => format!(
            "<- {} ok={}",
            child_run_id,
            result.get("ok").and_then(|v| v.as_bool()).unwrap_or(false)
        ),
    };
    truncate(&text)
}

fn truncate(text: &str) -> String {
    let flattened = text.replace('\n', " ");
    let count = flattened.chars().count();
    if count <= MAX_DETAIL_CHARS {
        return flattened;
    }
    let mut cut: String = flattened.chars().take(MAX_DETAIL_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RunLogger;
    use serde_json::json;

    #[test]
    fn test_replay_renders_timeline_and_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = RunLogger::create(dir.path(), "replay-test").expect("logger");
        logger
            .append(&Event::new(
                1,
                EventKind::Stmt {
                    node: "Assign".to_string(),
                },
            ))
            .expect("append");
        logger
            .append(&Event::new(
                2,
                EventKind::Tool {
                    name: "WRITE_FILE".to_string(),
                    input: json!({"path": "a.txt"}),
                    output: json!({"bytes": 2}),
                },
            ))
            .expect("append");
        logger.finalize(&json!({"ok": true})).expect("finalize");

        let timeline = replay_run(dir.path(), "replay-test").expect("replay");
        assert!(timeline.contains("=== run replay-test ==="));
        assert!(timeline.contains("stmt"));
        assert!(timeline.contains("WRITE_FILE"));
        assert!(timeline.contains("(ok)"));
    }

    #[test]
    fn test_replay_stitches_child_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let child = RunLogger::create(dir.path(), "sub-1-abc").expect("child logger");
        child
            .append(&Event::new(
                1,
                EventKind::Stmt {
                    node: "ExprStmt".to_string(),
                },
            ))
            .expect("append");
        child.finalize(&json!({"ok": true})).expect("finalize child");

        let parent = RunLogger::create(dir.path(), "parent").expect("parent logger");
        parent
            .append(&Event::new(
                3,
                EventKind::SubworkflowEnd {
                    child_run_id: "sub-1-abc".to_string(),
                    result: json!({"ok": true}),
                },
            ))
            .expect("append");
        parent.finalize(&json!({"ok": true})).expect("finalize parent");

        let timeline = replay_run(dir.path(), "parent").expect("replay");
        assert!(timeline.contains("=== run parent ==="));
        assert!(timeline.contains("  === run sub-1-abc ==="));
        assert!(timeline.contains("<- sub-1-abc ok=true"));
    }

    #[test]
    fn test_replay_missing_run_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(replay_run(dir.path(), "nope").is_err());
    }
}
