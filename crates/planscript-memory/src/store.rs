//! Memory store
//!
//! STM entries are volatile; LTM entries persist under
//! `<project>/.ps-memory/<name>/ltm.json` and are lazily reloaded. All
//! persisted paths use forward slashes regardless of host.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use planscript_core::glob::GlobPattern;
use planscript_core::sandbox::is_sensitive_component;

use crate::types::{Checkpoint, Ltm, Stm, StmEvent};
use crate::{estimate_tokens, MemoryError};

/// Files larger than this are not excerpted into LTM summaries.
const MAX_INDEXED_FILE_BYTES: u64 = 500_000;
/// Head excerpt length per file summary.
const SUMMARY_EXCERPT_CHARS: usize = 400;
/// Minimum keyword length admitted to the LTM index.
const MIN_INDEX_TERM_CHARS: usize = 3;
/// Events kept by `forget` in compact mode.
const COMPACT_KEPT_EVENTS: usize = 3;

/// One recall hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RecallChunk {
    pub source: String,
    pub content: String,
    pub relevance: f64,
}

impl RecallChunk {
    pub fn to_value(&self) -> Value {
        json!({
            "source": self.source,
            "content": self.content,
            "relevance": self.relevance,
        })
    }
}

/// Process-wide memory for one run.
pub struct MemoryStore {
    root: PathBuf,
    stm: HashMap<String, Stm>,
    ltm: HashMap<String, Ltm>,
    checkpoints: HashMap<String, Checkpoint>,
    archive_counter: u64,
}

impl MemoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stm: HashMap::new(),
            ltm: HashMap::new(),
            checkpoints: HashMap::new(),
            archive_counter: 0,
        }
    }

    // ---- STM ----

    pub fn stm(&self, key: &str) -> Option<&Stm> {
        self.stm.get(key)
    }

    pub fn stm_mut(&mut self, key: &str) -> &mut Stm {
        self.stm.entry(key.to_string()).or_default()
    }

    pub fn set_summary(&mut self, key: &str, summary: impl Into<String>) {
        self.stm_mut(key).summary = summary.into();
    }

    pub fn set_checkpoint(&mut self, key: &str, checkpoint: Checkpoint) {
        self.checkpoints.insert(key.to_string(), checkpoint);
    }

    pub fn checkpoint(&self, key: &str) -> Option<&Checkpoint> {
        self.checkpoints.get(key)
    }

    /// Append one event to an STM window, trimming to `window_steps`.
    pub fn note_event(&mut self, key: &str, event_type: &str, detail: &str) {
        let stm = self.stm_mut(key);
        stm.recent_events.push(StmEvent::new(event_type, detail));
        let window = stm.window_steps as usize;
        if stm.recent_events.len() > window {
            let overflow = stm.recent_events.len() - window;
            stm.recent_events.drain(0..overflow);
        }
    }

    /// Render an STM entry as the memory block injected into prompts.
    pub fn context_block(&self, key: &str) -> Option<String> {
        let stm = self.stm.get(key)?;
        let mut block = String::new();
        if !stm.summary.is_empty() {
            block.push_str(&format!("summary: {}\n", stm.summary));
        }
        if let Some(objective) = &stm.objective {
            block.push_str(&format!("objective: {}\n", objective));
        }
        if let Some(context) = &stm.context {
            block.push_str(&format!("context: {}\n", context));
        }
        for event in stm.recent_events.iter().rev().take(5).rev() {
            block.push_str(&format!("- [{}] {}\n", event.event_type, event.detail));
        }
        if block.is_empty() {
            None
        } else {
            Some(block)
        }
    }

    /// Shrink an STM entry. Returns `{before_tokens, after_tokens}`.
    pub fn forget(
        &mut self,
        key: &str,
        mode: &str,
        keep_n: Option<usize>,
    ) -> Result<Value, MemoryError> {
        let checkpoint_summary = self
            .checkpoints
            .get(key)
            .map(|c| c.recap())
            .unwrap_or_else(|| "no checkpoint recorded".to_string());
        let stm = self
            .stm
            .get_mut(key)
            .ok_or_else(|| MemoryError::UnknownKey(key.to_string()))?;
        let before_tokens = stm_tokens(stm)?;

        match mode {
            "compact" => {
                stm.summary = checkpoint_summary;
                let len = stm.recent_events.len();
                if len > COMPACT_KEPT_EVENTS {
                    stm.recent_events.drain(0..len - COMPACT_KEPT_EVENTS);
                }
            }
            "reset" => {
                stm.summary = checkpoint_summary;
                stm.recent_events.clear();
                stm.context = None;
            }
            "keep_last" => {
                let keep = keep_n.unwrap_or(COMPACT_KEPT_EVENTS);
                let len = stm.recent_events.len();
                if len > keep {
                    stm.recent_events.drain(0..len - keep);
                }
            }
            other => {
                return Err(MemoryError::Serialization(format!(
                    "unknown forget mode '{}'; expected compact|reset|keep_last",
                    other
                )))
            }
        }

        let after_tokens = stm_tokens(stm)?;
        debug!(key, mode, before_tokens, after_tokens, "stm forgotten");
        Ok(json!({
            "before_tokens": before_tokens,
            "after_tokens": after_tokens,
        }))
    }

    /// Copy the STM digest into an LTM fact under a unique archive key,
    /// optionally discarding the STM afterwards.
    pub fn archive(
        &mut self,
        key: &str,
        to_ltm: Option<&str>,
        clear_stm: bool,
    ) -> Result<Value, MemoryError> {
        let stm = self
            .stm
            .get(key)
            .ok_or_else(|| MemoryError::UnknownKey(key.to_string()))?;
        let digest = json!({
            "summary": stm.summary,
            "objective": stm.objective,
            "event_count": stm.recent_events.len(),
            "archived_at": Utc::now(),
        });

        let target = to_ltm.unwrap_or(key).to_string();
        self.archive_counter += 1;
        let archive_key = format!(
            "archive-{}-{}",
            Utc::now().timestamp_millis(),
            self.archive_counter
        );
        self.load_ltm_if_present(&target);
        let ltm = self.ltm.entry(target.clone()).or_default();
        ltm.facts.insert(archive_key.clone(), digest);
        self.persist_ltm(&target)?;

        if clear_stm {
            self.stm.remove(key);
        }
        Ok(json!({"ltm": target, "key": archive_key, "cleared": clear_stm}))
    }

    // ---- LTM ----

    pub fn ltm(&self, name: &str) -> Option<&Ltm> {
        self.ltm.get(name)
    }

    pub fn ltm_mut(&mut self, name: &str) -> &mut Ltm {
        self.ltm.entry(name.to_string()).or_default()
    }

    /// Create or refresh an LTM entry from file globs and persist it.
    /// `refresh` rebuilds from scratch; `update` merges over what exists.
    pub fn build_memory(
        &mut self,
        name: &str,
        globs: &[String],
        mode: &str,
    ) -> Result<Value, MemoryError> {
        let patterns = globs
            .iter()
            .map(|g| GlobPattern::new(g))
            .collect::<Result<Vec<_>, _>>()?;

        let mut built = if mode == "update" {
            self.load_ltm_if_present(name);
            self.ltm.get(name).cloned().unwrap_or_default()
        } else {
            Ltm::default()
        };

        let mut matched_files = 0usize;
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|entry| {
                let name = entry.file_name().to_string_lossy();
                entry.depth() == 0 || !is_sensitive_component(&name)
            });
        for entry in walker.flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let rel_text = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if rel_text.starts_with(".ps-memory/") || rel_text.starts_with(".ps-runs/") {
                continue;
            }
            if !patterns.is_empty() && !patterns.iter().any(|p| p.matches(&rel_text)) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(u64::MAX);
            if size > MAX_INDEXED_FILE_BYTES {
                continue;
            }
            let Ok(bytes) = std::fs::read(entry.path()) else {
                continue;
            };
            let content = String::from_utf8_lossy(&bytes);
            let excerpt: String = content.chars().take(SUMMARY_EXCERPT_CHARS).collect();
            built.file_summaries.insert(rel_text.clone(), excerpt);
            for term in index_terms(&rel_text) {
                let sources = built.index.entry(term).or_default();
                if !sources.contains(&rel_text) {
                    sources.push(rel_text.clone());
                }
            }
            matched_files += 1;
        }

        let indexed_terms = built.index.len();
        self.ltm.insert(name.to_string(), built);
        self.persist_ltm(name)?;
        info!(name, matched_files, indexed_terms, "ltm built");
        Ok(json!({
            "name": name,
            "files": matched_files,
            "indexed_terms": indexed_terms,
        }))
    }

    /// Case-insensitive substring recall over `file_summaries` and
    /// `glossary`, descending relevance, file summaries ranked above
    /// glossary hits.
    pub fn recall(&mut self, name: &str, query: &str, top_k: usize) -> Vec<RecallChunk> {
        self.load_ltm_if_present(name);
        let Some(ltm) = self.ltm.get(name) else {
            return Vec::new();
        };
        let needle = query.to_lowercase();
        let mut chunks = Vec::new();
        for (path, summary) in &ltm.file_summaries {
            if path.to_lowercase().contains(&needle) || summary.to_lowercase().contains(&needle) {
                chunks.push(RecallChunk {
                    source: path.clone(),
                    content: summary.clone(),
                    relevance: 1.0,
                });
            }
        }
        for (term, definition) in &ltm.glossary {
            if term.to_lowercase().contains(&needle)
                || definition.to_lowercase().contains(&needle)
            {
                chunks.push(RecallChunk {
                    source: format!("glossary:{}", term),
                    content: definition.clone(),
                    relevance: 0.5,
                });
            }
        }
        chunks.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source.cmp(&b.source))
        });
        chunks.truncate(top_k);
        chunks
    }

    fn ltm_path(&self, name: &str) -> PathBuf {
        self.root.join(".ps-memory").join(name).join("ltm.json")
    }

    fn load_ltm_if_present(&mut self, name: &str) {
        if self.ltm.contains_key(name) {
            return;
        }
        let path = self.ltm_path(name);
        let Ok(text) = std::fs::read_to_string(&path) else {
            return;
        };
        if let Ok(ltm) = serde_json::from_str::<Ltm>(&text) {
            self.ltm.insert(name.to_string(), ltm);
        }
    }

    fn persist_ltm(&self, name: &str) -> Result<(), MemoryError> {
        let Some(ltm) = self.ltm.get(name) else {
            return Err(MemoryError::UnknownKey(name.to_string()));
        };
        let path = self.ltm_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| MemoryError::Io(e.to_string()))?;
        }
        let text = serde_json::to_string_pretty(ltm)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        std::fs::write(&path, text).map_err(|e| MemoryError::Io(e.to_string()))?;
        Ok(())
    }
}

fn stm_tokens(stm: &Stm) -> Result<u64, MemoryError> {
    let serialized =
        serde_json::to_string(stm).map_err(|e| MemoryError::Serialization(e.to_string()))?;
    Ok(estimate_tokens(serialized.len()))
}

/// Keywords from a path: lowercased alphanumeric runs of the segments.
fn index_terms(path: &str) -> Vec<String> {
    let mut terms = Vec::new();
    for segment in path.split('/') {
        for term in segment.split(|c: char| !c.is_ascii_alphanumeric()) {
            if term.len() >= MIN_INDEX_TERM_CHARS {
                let lowered = term.to_lowercase();
                if !terms.contains(&lowered) {
                    terms.push(lowered);
                }
            }
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Milestone;

    fn seeded_store() -> (tempfile::TempDir, MemoryStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("docs")).expect("mkdir");
        std::fs::write(
            dir.path().join("docs/setup.md"),
            "How to configure the gateway timeout settings.",
        )
        .expect("seed");
        std::fs::write(
            dir.path().join("docs/usage.md"),
            "Daily usage notes, nothing about networking.",
        )
        .expect("seed");
        let store = MemoryStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_forget_keep_last_truncates_events() {
        let (_dir, mut store) = seeded_store();
        for i in 0..10 {
            store.note_event("task", "tool", &format!("call {}", i));
        }
        let result = store.forget("task", "keep_last", Some(3)).expect("forget");
        let stm = store.stm("task").expect("stm");
        assert_eq!(stm.recent_events.len(), 3);
        assert_eq!(stm.recent_events[0].detail, "call 7");
        let before = result["before_tokens"].as_u64().expect("before");
        let after = result["after_tokens"].as_u64().expect("after");
        assert!(after <= before);
    }

    #[test]
    fn test_forget_reset_clears_events_and_context() {
        let (_dir, mut store) = seeded_store();
        {
            let stm = store.stm_mut("task");
            stm.context = Some(serde_json::json!({"branch": "main"}));
        }
        store.note_event("task", "tool", "one");
        let mut checkpoint = Checkpoint::new("wire the parser");
        checkpoint.milestones.insert(
            "lexer".to_string(),
            Milestone {
                ok: true,
                evidence: None,
            },
        );
        store.set_checkpoint("task", checkpoint);

        store.forget("task", "reset", None).expect("forget");
        let stm = store.stm("task").expect("stm");
        assert!(stm.recent_events.is_empty());
        assert!(stm.context.is_none());
        assert!(stm.summary.contains("1/1 milestones ok"));
        assert!(stm.summary.contains("wire the parser"));
    }

    #[test]
    fn test_forget_compact_keeps_three_events() {
        let (_dir, mut store) = seeded_store();
        for i in 0..8 {
            store.note_event("task", "tool", &format!("call {}", i));
        }
        store.forget("task", "compact", None).expect("forget");
        let stm = store.stm("task").expect("stm");
        assert_eq!(stm.recent_events.len(), 3);
        assert!(stm.summary.starts_with("checkpoint:"));
    }

    #[test]
    fn test_forget_unknown_key_fails() {
        let (_dir, mut store) = seeded_store();
        assert!(store.forget("nope", "reset", None).is_err());
    }

    #[test]
    fn test_build_memory_persists_and_indexes() {
        let (dir, mut store) = seeded_store();
        let stats = store
            .build_memory("kb", &["docs/*.md".to_string()], "refresh")
            .expect("build");
        assert_eq!(stats["files"], 2);
        assert!(dir.path().join(".ps-memory/kb/ltm.json").exists());

        let ltm = store.ltm("kb").expect("ltm");
        assert!(ltm.file_summaries.contains_key("docs/setup.md"));
        assert!(ltm.index.contains_key("setup"));
        assert!(ltm.index.contains_key("docs"));
    }

    #[test]
    fn test_recall_matches_file_summaries_before_glossary() {
        let (_dir, mut store) = seeded_store();
        store
            .build_memory("kb", &["docs/*.md".to_string()], "refresh")
            .expect("build");
        store.ltm_mut("kb").glossary.insert(
            "timeout".to_string(),
            "wall-clock limit on an operation".to_string(),
        );

        let chunks = store.recall("kb", "timeout", 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].source, "docs/setup.md");
        assert!(chunks[0].relevance > chunks[1].relevance);
        assert_eq!(chunks[1].source, "glossary:timeout");
    }

    #[test]
    fn test_recall_is_case_insensitive_and_caps_results() {
        let (_dir, mut store) = seeded_store();
        store
            .build_memory("kb", &["docs/*.md".to_string()], "refresh")
            .expect("build");
        let chunks = store.recall("kb", "DOCS", 1);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_recall_reloads_persisted_ltm() {
        let (dir, mut store) = seeded_store();
        store
            .build_memory("kb", &["docs/*.md".to_string()], "refresh")
            .expect("build");
        drop(store);

        let mut fresh = MemoryStore::new(dir.path());
        let chunks = fresh.recall("kb", "gateway", 10);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].source, "docs/setup.md");
    }

    #[test]
    fn test_archive_writes_fact_and_clears_stm() {
        let (_dir, mut store) = seeded_store();
        store.set_summary("task", "built the gateway");
        store.note_event("task", "tool", "WRITE_FILE ok");
        let out = store.archive("task", Some("kb"), true).expect("archive");
        assert_eq!(out["ltm"], "kb");
        assert!(store.stm("task").is_none());

        let ltm = store.ltm("kb").expect("ltm");
        let (key, fact) = ltm.facts.iter().next().expect("one fact");
        assert!(key.starts_with("archive-"));
        assert_eq!(fact["summary"], "built the gateway");
    }

    #[test]
    fn test_note_event_respects_window() {
        let (_dir, mut store) = seeded_store();
        store.stm_mut("task").window_steps = 4;
        for i in 0..10 {
            store.note_event("task", "tool", &format!("call {}", i));
        }
        let stm = store.stm("task").expect("stm");
        assert_eq!(stm.recent_events.len(), 4);
        assert_eq!(stm.recent_events[0].detail, "call 6");
    }
}
