//! Loop detector
//!
//! Observes every LLM-produced Plan and flags pathological patterns over
//! a sliding window of fingerprints: exact repeats, short action cycles,
//! failure streaks, and two-action oscillation. Detection itself never
//! stops a run; the caller decides whether a warning is fatal.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use serde_json::Value;

/// Detector configuration.
#[derive(Debug, Clone)]
pub struct LoopDetectorConfig {
    /// Fingerprints kept in the sliding window.
    pub window_size: usize,
    /// Consecutive identical (action, args) entries that count as a loop.
    pub max_repeats: usize,
    /// Consecutive failed actions that count as a failure loop.
    pub max_consecutive_failures: usize,
}

impl Default for LoopDetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 20,
            max_repeats: 4,
            max_consecutive_failures: 5,
        }
    }
}

impl LoopDetectorConfig {
    /// Read overrides from a loosely-typed options object.
    pub fn from_options(spec: &Value) -> Self {
        let defaults = Self::default();
        Self {
            window_size: spec
                .get("windowSize")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(defaults.window_size),
            max_repeats: spec
                .get("maxRepeats")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(defaults.max_repeats),
            max_consecutive_failures: spec
                .get("maxConsecutiveFailures")
                .and_then(|v| v.as_u64())
                .map(|v| v as usize)
                .unwrap_or(defaults.max_consecutive_failures),
        }
    }
}

/// Which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    ExactRepeat,
    ActionCycle,
    FailureLoop,
    Oscillation,
}

impl LoopKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactRepeat => "exact_repeat",
            Self::ActionCycle => "action_cycle",
            Self::FailureLoop => "failure_loop",
            Self::Oscillation => "oscillation",
        }
    }
}

/// A fired detection with a short operator-facing suggestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopWarning {
    pub kind: LoopKind,
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Fingerprint {
    action: String,
    args_hash: u64,
    success: bool,
}

/// Sliding-window fingerprint detector.
#[derive(Debug)]
pub struct LoopDetector {
    config: LoopDetectorConfig,
    window: VecDeque<Fingerprint>,
    detected: bool,
}

impl LoopDetector {
    pub fn new(config: LoopDetectorConfig) -> Self {
        Self {
            config,
            window: VecDeque::new(),
            detected: false,
        }
    }

    pub fn detected(&self) -> bool {
        self.detected
    }

    /// Record one produced Plan and check the rules in order. A single
    /// call fires at most one rule.
    pub fn observe(&mut self, action: &str, args: &Value, success: bool) -> Option<LoopWarning> {
        let fingerprint = Fingerprint {
            action: action.to_string(),
            args_hash: stable_args_hash(args),
            success,
        };
        if self.window.len() == self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(fingerprint);

        let warning = self
            .check_exact_repeat()
            .or_else(|| self.check_action_cycle())
            .or_else(|| self.check_failure_loop())
            .or_else(|| self.check_oscillation());
        if warning.is_some() {
            self.detected = true;
        }
        warning
    }

    fn check_exact_repeat(&self) -> Option<LoopWarning> {
        let n = self.config.max_repeats;
        if n == 0 || self.window.len() < n {
            return None;
        }
        let tail: Vec<&Fingerprint> = self.window.iter().rev().take(n).collect();
        let head = tail[0];
        if tail
            .iter()
            .all(|f| f.action == head.action && f.args_hash == head.args_hash)
        {
            return Some(LoopWarning {
                kind: LoopKind::ExactRepeat,
                suggestion: format!(
                    "the last {} plans were identical {} calls; change the arguments or ask for help",
                    n, head.action
                ),
            });
        }
        None
    }

    fn check_action_cycle(&self) -> Option<LoopWarning> {
        let actions: Vec<&str> = self.window.iter().map(|f| f.action.as_str()).collect();
        for k in 2..=4usize {
            let needed = k * 3;
            if actions.len() < needed {
                continue;
            }
            let tail = &actions[actions.len() - needed..];
            let block = &tail[..k];
            // Strict two-action alternation is the oscillation rule's case.
            if k == 2 && block[0] != block[1] {
                continue;
            }
            if tail.chunks(k).all(|chunk| chunk == block) {
                return Some(LoopWarning {
                    kind: LoopKind::ActionCycle,
                    suggestion: format!(
                        "a {}-action cycle [{}] has repeated 3 times; break the pattern",
                        k,
                        block.join(" -> ")
                    ),
                });
            }
        }
        None
    }

    fn check_failure_loop(&self) -> Option<LoopWarning> {
        let n = self.config.max_consecutive_failures;
        if n == 0 || self.window.len() < n {
            return None;
        }
        if self.window.iter().rev().take(n).all(|f| !f.success) {
            return Some(LoopWarning {
                kind: LoopKind::FailureLoop,
                suggestion: format!(
                    "{} actions in a row failed; reconsider the approach before retrying",
                    n
                ),
            });
        }
        None
    }

    fn check_oscillation(&self) -> Option<LoopWarning> {
        if self.window.len() < 6 {
            return None;
        }
        let tail: Vec<&str> = self
            .window
            .iter()
            .rev()
            .take(6)
            .map(|f| f.action.as_str())
            .collect();
        let a = tail[0];
        let b = tail[1];
        if a != b && tail[2] == a && tail[3] == b && tail[4] == a && tail[5] == b {
            return Some(LoopWarning {
                kind: LoopKind::Oscillation,
                suggestion: format!(
                    "actions are oscillating between {} and {}; pick one path and finish it",
                    a, b
                ),
            });
        }
        None
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new(LoopDetectorConfig::default())
    }
}

/// Hash over the canonicalized args (object keys sorted recursively) so
/// the same arguments fingerprint identically regardless of key order.
fn stable_args_hash(args: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_canonical(args, &mut hasher);
    hasher.finish()
}

fn hash_canonical(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_canonical(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            keys.len().hash(hasher);
            for key in keys {
                key.hash(hasher);
                if let Some(v) = map.get(key) {
                    hash_canonical(v, hasher);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_exact_repeat_fires_on_fourth_identical_plan() {
        let mut detector = LoopDetector::default();
        let args = json!({"path": "a.txt"});
        for _ in 0..3 {
            assert!(detector.observe("READ_FILE", &args, true).is_none());
        }
        let warning = detector
            .observe("READ_FILE", &args, true)
            .expect("fourth repeat fires");
        assert_eq!(warning.kind, LoopKind::ExactRepeat);
        assert!(detector.detected());
    }

    #[test]
    fn test_key_order_does_not_change_the_fingerprint() {
        let mut detector = LoopDetector::default();
        detector.observe("SEARCH", &json!({"query": "x", "maxResults": 5}), true);
        detector.observe("SEARCH", &json!({"maxResults": 5, "query": "x"}), true);
        detector.observe("SEARCH", &json!({"query": "x", "maxResults": 5}), true);
        let warning = detector
            .observe("SEARCH", &json!({"maxResults": 5, "query": "x"}), true)
            .expect("canonicalized args repeat");
        assert_eq!(warning.kind, LoopKind::ExactRepeat);
    }

    #[test]
    fn test_different_args_do_not_repeat() {
        let mut detector = LoopDetector::default();
        for i in 0..10 {
            let warning = detector.observe("READ_FILE", &json!({"path": format!("f{}.txt", i)}), true);
            assert!(warning.is_none(), "varying args must not fire");
        }
    }

    #[test]
    fn test_oscillation_after_six_alternating_actions() {
        let mut detector = LoopDetector::default();
        let mut last = None;
        for i in 0..6 {
            let action = if i % 2 == 0 { "READ_FILE" } else { "WRITE_FILE" };
            let args = json!({"i": i});
            last = detector.observe(action, &args, true);
        }
        let warning = last.expect("sixth alternation fires");
        assert_eq!(warning.kind, LoopKind::Oscillation);
    }

    #[test]
    fn test_failure_streak() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            // Keep exact-repeat out of the way so the failure rule is hit.
            max_repeats: 10,
            ..LoopDetectorConfig::default()
        });
        let mut last = None;
        for i in 0..5 {
            last = detector.observe("RUN_CMD", &json!({"i": i}), false);
        }
        assert_eq!(last.expect("fifth failure fires").kind, LoopKind::FailureLoop);
    }

    #[test]
    fn test_action_cycle_of_three() {
        let mut detector = LoopDetector::new(LoopDetectorConfig {
            max_repeats: 20,
            ..LoopDetectorConfig::default()
        });
        let cycle = ["READ_FILE", "SEARCH", "WRITE_FILE"];
        let mut fired = None;
        for round in 0..3 {
            for (i, action) in cycle.iter().enumerate() {
                let args = json!({"round": round, "i": i, "r": round * 3 + i});
                if let Some(w) = detector.observe(action, &args, true) {
                    fired = Some(w);
                }
            }
        }
        assert_eq!(fired.expect("cycle fires").kind, LoopKind::ActionCycle);
    }
}
