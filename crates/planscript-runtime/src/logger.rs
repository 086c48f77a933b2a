//! Run logger
//!
//! Owns the run identifier and its on-disk directory:
//! `.ps-runs/<runId>/{meta.json, events.jsonl, summary.json}`. Events are
//! appended in emission order; finalization writes the summary.

use std::cell::{Cell, RefCell};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value as Json};
use tracing::debug;

use planscript_core::event::Event;

use crate::VmError;

/// Append-only event log for one run.
pub struct RunLogger {
    run_id: String,
    dir: PathBuf,
    events: RefCell<File>,
    event_count: Cell<u64>,
    finalized: Cell<bool>,
}

impl RunLogger {
    /// Create the run directory and meta.json; open events.jsonl.
    pub fn create(project_root: &Path, run_id: impl Into<String>) -> Result<Self, VmError> {
        let run_id = run_id.into();
        let dir = project_root.join(".ps-runs").join(&run_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| VmError::Log(format!("create {}: {}", dir.display(), e)))?;

        let meta = json!({
            "run_id": run_id,
            "started_at": Utc::now(),
            "pid": std::process::id(),
            "cwd": project_root.display().to_string(),
        });
        std::fs::write(
            dir.join("meta.json"),
            serde_json::to_string_pretty(&meta)
                .map_err(|e| VmError::Log(e.to_string()))?,
        )
        .map_err(|e| VmError::Log(e.to_string()))?;

        let events = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("events.jsonl"))
            .map_err(|e| VmError::Log(e.to_string()))?;

        debug!(run_id = %run_id, dir = %dir.display(), "run log opened");
        Ok(Self {
            run_id,
            dir,
            events: RefCell::new(events),
            event_count: Cell::new(0),
            finalized: Cell::new(false),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn event_count(&self) -> u64 {
        self.event_count.get()
    }

    /// Append one event. Returns the new appended-event count.
    pub fn append(&self, event: &Event) -> Result<u64, VmError> {
        let line =
            serde_json::to_string(event).map_err(|e| VmError::Log(e.to_string()))?;
        let mut file = self.events.borrow_mut();
        writeln!(file, "{}", line).map_err(|e| VmError::Log(e.to_string()))?;
        let count = self.event_count.get() + 1;
        self.event_count.set(count);
        Ok(count)
    }

    /// Write summary.json. Safe to call once; later calls are ignored.
    pub fn finalize(&self, summary: &Json) -> Result<(), VmError> {
        if self.finalized.replace(true) {
            return Ok(());
        }
        let mut enriched = summary.clone();
        if let Some(map) = enriched.as_object_mut() {
            map.insert("run_id".to_string(), json!(self.run_id));
            map.insert("finished_at".to_string(), json!(Utc::now()));
            map.insert("event_count".to_string(), json!(self.event_count.get()));
        }
        std::fs::write(
            self.dir.join("summary.json"),
            serde_json::to_string_pretty(&enriched)
                .map_err(|e| VmError::Log(e.to_string()))?,
        )
        .map_err(|e| VmError::Log(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use planscript_core::event::EventKind;

    #[test]
    fn test_logger_writes_meta_events_and_summary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = RunLogger::create(dir.path(), "run-1").expect("create");
        assert!(dir.path().join(".ps-runs/run-1/meta.json").exists());

        for step in 0..3 {
            logger
                .append(&Event::new(
                    step,
                    EventKind::Stmt {
                        node: "Assign".to_string(),
                    },
                ))
                .expect("append");
        }
        assert_eq!(logger.event_count(), 3);

        logger.finalize(&json!({"ok": true})).expect("finalize");
        let summary: Json = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(".ps-runs/run-1/summary.json"))
                .expect("read summary"),
        )
        .expect("parse summary");
        assert_eq!(summary["ok"], true);
        assert_eq!(summary["event_count"], 3);
        assert_eq!(summary["run_id"], "run-1");

        let lines: Vec<String> = std::fs::read_to_string(dir.path().join(".ps-runs/run-1/events.jsonl"))
            .expect("read events")
            .lines()
            .map(|l| l.to_string())
            .collect();
        assert_eq!(lines.len(), 3);
        let first: Event = serde_json::from_str(&lines[0]).expect("parse event");
        assert_eq!(first.step, 0);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let logger = RunLogger::create(dir.path(), "run-2").expect("create");
        logger.finalize(&json!({"ok": true})).expect("first");
        logger.finalize(&json!({"ok": false})).expect("second is a no-op");
        let summary: Json = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join(".ps-runs/run-2/summary.json"))
                .expect("read summary"),
        )
        .expect("parse");
        assert_eq!(summary["ok"], true);
    }
}
