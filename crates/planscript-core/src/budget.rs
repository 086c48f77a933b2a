//! Budgets
//!
//! Numeric limits on steps, wall time, tool calls, LLM calls, tokens and
//! estimated cost. Counters are monotone non-decreasing within a run;
//! crossing any configured limit is fatal and names the counter that
//! tripped.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fallback USD rate per 1000 tokens for unknown models.
pub const FALLBACK_RATE_PER_1K: f64 = 0.002;

/// Per-model USD rates per 1000 tokens (blended prompt/completion).
const MODEL_RATES: [(&str, f64); 4] = [
    ("gpt-4o-mini", 0.0006),
    ("gpt-4o", 0.01),
    ("gpt-4.1-mini", 0.0016),
    ("o3-mini", 0.0044),
];

/// Rate lookup with fallback.
pub fn rate_per_1k(model: &str) -> f64 {
    MODEL_RATES
        .iter()
        .find(|(name, _)| *name == model)
        .map(|(_, rate)| *rate)
        .unwrap_or(FALLBACK_RATE_PER_1K)
}

/// A budget limit was crossed. The message names the counter.
#[derive(Debug, Error)]
#[error("BudgetExceeded: {counter}")]
pub struct BudgetError {
    pub counter: &'static str,
}

impl BudgetError {
    fn new(counter: &'static str) -> Self {
        Self { counter }
    }
}

/// Configured limits. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub max_steps: Option<u64>,
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default)]
    pub max_tool_calls: Option<u64>,
    #[serde(default)]
    pub max_llm_calls: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
}

impl BudgetConfig {
    /// Read limits from a loosely-typed options object (DSL side), e.g.
    /// `{maxSteps: 100, maxCostUsd: 0.5}`. Missing keys stay unlimited.
    pub fn from_options(spec: &serde_json::Value) -> Self {
        Self {
            max_steps: spec.get("maxSteps").and_then(|v| v.as_u64()),
            max_time_ms: spec.get("maxTimeMs").and_then(|v| v.as_u64()),
            max_tool_calls: spec.get("maxToolCalls").and_then(|v| v.as_u64()),
            max_llm_calls: spec.get("maxLLMCalls").and_then(|v| v.as_u64()),
            max_tokens: spec.get("maxTokens").and_then(|v| v.as_u64()),
            max_cost_usd: spec.get("maxCostUsd").and_then(|v| v.as_f64()),
        }
    }

    /// Overlay non-empty limits from `other` onto `self`.
    pub fn merged(&self, other: &Self) -> Self {
        Self {
            max_steps: other.max_steps.or(self.max_steps),
            max_time_ms: other.max_time_ms.or(self.max_time_ms),
            max_tool_calls: other.max_tool_calls.or(self.max_tool_calls),
            max_llm_calls: other.max_llm_calls.or(self.max_llm_calls),
            max_tokens: other.max_tokens.or(self.max_tokens),
            max_cost_usd: other.max_cost_usd.or(self.max_cost_usd),
        }
    }
}

/// Serializable snapshot of all counters with percent-of-max for every
/// configured limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub steps: u64,
    pub tool_calls: u64,
    pub llm_calls: u64,
    pub tokens: u64,
    pub cost_usd: f64,
    pub elapsed_ms: u64,
    /// counter name -> (current / max) * 100
    pub pct: BTreeMap<String, f64>,
}

/// Running counters for one run.
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    started: Instant,
    steps: u64,
    tool_calls: u64,
    llm_calls: u64,
    tokens: u64,
    cost_usd: f64,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            steps: 0,
            tool_calls: 0,
            llm_calls: 0,
            tokens: 0,
            cost_usd: 0.0,
        }
    }

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Count one executed statement. Returns the new step number, or the
    /// named limit when the statement would cross it.
    pub fn charge_step(&mut self) -> Result<u64, BudgetError> {
        self.check_time()?;
        if let Some(max) = self.config.max_steps {
            if self.steps + 1 > max {
                return Err(BudgetError::new("maxSteps"));
            }
        }
        self.steps += 1;
        Ok(self.steps)
    }

    /// Count one tool dispatch.
    pub fn charge_tool_call(&mut self) -> Result<(), BudgetError> {
        self.check_time()?;
        if let Some(max) = self.config.max_tool_calls {
            if self.tool_calls + 1 > max {
                return Err(BudgetError::new("maxToolCalls"));
            }
        }
        self.tool_calls += 1;
        Ok(())
    }

    /// Count one LLM call plus its token usage and estimated cost.
    pub fn charge_llm_call(&mut self, tokens: u64, model: &str) -> Result<(), BudgetError> {
        self.check_time()?;
        if let Some(max) = self.config.max_llm_calls {
            if self.llm_calls + 1 > max {
                return Err(BudgetError::new("maxLLMCalls"));
            }
        }
        self.llm_calls += 1;
        if let Some(max) = self.config.max_tokens {
            if self.tokens + tokens > max {
                self.tokens += tokens;
                return Err(BudgetError::new("maxTokens"));
            }
        }
        self.tokens += tokens;
        let cost = tokens as f64 / 1000.0 * rate_per_1k(model);
        self.cost_usd += cost;
        if let Some(max) = self.config.max_cost_usd {
            if self.cost_usd > max {
                return Err(BudgetError::new("maxCostUsd"));
            }
        }
        Ok(())
    }

    /// Check the wall-clock limit without advancing any counter.
    pub fn check_time(&self) -> Result<(), BudgetError> {
        if let Some(max) = self.config.max_time_ms {
            if self.elapsed_ms() > max {
                return Err(BudgetError::new("maxTimeMs"));
            }
        }
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut pct = BTreeMap::new();
        let elapsed = self.elapsed_ms();
        if let Some(max) = self.config.max_steps {
            pct.insert("maxSteps".to_string(), percent(self.steps as f64, max as f64));
        }
        if let Some(max) = self.config.max_time_ms {
            pct.insert("maxTimeMs".to_string(), percent(elapsed as f64, max as f64));
        }
        if let Some(max) = self.config.max_tool_calls {
            pct.insert(
                "maxToolCalls".to_string(),
                percent(self.tool_calls as f64, max as f64),
            );
        }
        if let Some(max) = self.config.max_llm_calls {
            pct.insert(
                "maxLLMCalls".to_string(),
                percent(self.llm_calls as f64, max as f64),
            );
        }
        if let Some(max) = self.config.max_tokens {
            pct.insert(
                "maxTokens".to_string(),
                percent(self.tokens as f64, max as f64),
            );
        }
        if let Some(max) = self.config.max_cost_usd {
            pct.insert("maxCostUsd".to_string(), percent(self.cost_usd, max));
        }
        BudgetSnapshot {
            steps: self.steps,
            tool_calls: self.tool_calls,
            llm_calls: self.llm_calls,
            tokens: self.tokens,
            cost_usd: self.cost_usd,
            elapsed_ms: elapsed,
            pct,
        }
    }
}

fn percent(current: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 100.0;
    }
    current / max * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_limit_allows_exactly_k_statements() {
        let mut tracker = BudgetTracker::new(BudgetConfig {
            max_steps: Some(3),
            ..BudgetConfig::default()
        });
        for expected in 1..=3 {
            assert_eq!(tracker.charge_step().expect("within budget"), expected);
        }
        let err = tracker.charge_step().expect_err("fourth step must trip");
        assert_eq!(err.to_string(), "BudgetExceeded: maxSteps");
        // The counter did not advance past the limit.
        assert_eq!(tracker.steps(), 3);
    }

    #[test]
    fn test_llm_call_and_token_limits() {
        let mut tracker = BudgetTracker::new(BudgetConfig {
            max_llm_calls: Some(1),
            max_tokens: Some(100),
            ..BudgetConfig::default()
        });
        tracker.charge_llm_call(80, "gpt-4o-mini").expect("first call");
        let err = tracker
            .charge_llm_call(10, "gpt-4o-mini")
            .expect_err("second call must trip");
        assert_eq!(err.to_string(), "BudgetExceeded: maxLLMCalls");
    }

    #[test]
    fn test_cost_uses_model_table_with_fallback() {
        let mut tracker = BudgetTracker::new(BudgetConfig::default());
        tracker.charge_llm_call(1000, "gpt-4o-mini").expect("charge");
        tracker.charge_llm_call(1000, "some-unknown-model").expect("charge");
        let snapshot = tracker.snapshot();
        let expected = rate_per_1k("gpt-4o-mini") + FALLBACK_RATE_PER_1K;
        assert!((snapshot.cost_usd - expected).abs() < 1e-9);
    }

    #[test]
    fn test_time_limit() {
        let mut tracker = BudgetTracker::new(BudgetConfig {
            max_time_ms: Some(1),
            ..BudgetConfig::default()
        });
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = tracker.charge_step().expect_err("time limit must trip");
        assert_eq!(err.to_string(), "BudgetExceeded: maxTimeMs");
    }

    #[test]
    fn test_snapshot_percentages() {
        let mut tracker = BudgetTracker::new(BudgetConfig {
            max_steps: Some(10),
            max_tool_calls: Some(4),
            ..BudgetConfig::default()
        });
        tracker.charge_step().expect("step");
        tracker.charge_tool_call().expect("tool");
        tracker.charge_tool_call().expect("tool");
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.pct.get("maxSteps"), Some(&10.0));
        assert_eq!(snapshot.pct.get("maxToolCalls"), Some(&50.0));
        assert!(snapshot.pct.get("maxTokens").is_none());
    }

    #[test]
    fn test_merged_prefers_override() {
        let base = BudgetConfig {
            max_steps: Some(100),
            max_tokens: Some(1000),
            ..BudgetConfig::default()
        };
        let merged = base.merged(&BudgetConfig {
            max_steps: Some(5),
            ..BudgetConfig::default()
        });
        assert_eq!(merged.max_steps, Some(5));
        assert_eq!(merged.max_tokens, Some(1000));
    }
}
