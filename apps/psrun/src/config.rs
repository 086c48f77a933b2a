//! Optional YAML configuration for the driver: LLM defaults, budget
//! limits and the base policy. Every section and field is optional;
//! command-line flags win over file values.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use planscript_core::budget::BudgetConfig;
use planscript_core::policy::Policy;
use planscript_llm::LlmConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriverConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub budget: BudgetSection,
    #[serde(default)]
    pub policy: PolicySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmSection {
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSection {
    pub max_steps: Option<u64>,
    pub max_time_ms: Option<u64>,
    pub max_tool_calls: Option<u64>,
    pub max_llm_calls: Option<u64>,
    pub max_tokens: Option<u64>,
    pub max_cost_usd: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySection {
    pub allow_actions: Option<Vec<String>>,
    pub allow_commands: Option<Vec<String>>,
    pub require_approval: Option<bool>,
    pub max_file_bytes: Option<u64>,
}

impl DriverConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: DriverConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn llm_config(&self) -> LlmConfig {
        let mut config = LlmConfig::default();
        if let Some(endpoint) = &self.llm.endpoint {
            config.endpoint = endpoint.clone();
        }
        let key_env = self
            .llm
            .api_key_env
            .clone()
            .unwrap_or_else(|| "OPENAI_API_KEY".to_string());
        config.api_key = std::env::var(key_env).ok();
        if let Some(model) = &self.llm.model {
            config.model = model.clone();
        }
        if let Some(temperature) = self.llm.temperature {
            config.temperature = temperature;
        }
        if let Some(max_tokens) = self.llm.max_tokens {
            config.max_tokens = max_tokens;
        }
        if let Some(timeout_ms) = self.llm.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(max_retries) = self.llm.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(retry_delay_ms) = self.llm.retry_delay_ms {
            config.retry_delay_ms = retry_delay_ms;
        }
        config
    }

    pub fn budget_config(&self) -> BudgetConfig {
        BudgetConfig {
            max_steps: self.budget.max_steps,
            max_time_ms: self.budget.max_time_ms,
            max_tool_calls: self.budget.max_tool_calls,
            max_llm_calls: self.budget.max_llm_calls,
            max_tokens: self.budget.max_tokens,
            max_cost_usd: self.budget.max_cost_usd,
        }
    }

    pub fn policy(&self) -> Policy {
        let mut policy = Policy::default();
        if let Some(actions) = &self.policy.allow_actions {
            policy.allow_tools = actions.iter().cloned().collect::<BTreeSet<_>>();
        }
        if let Some(commands) = &self.policy.allow_commands {
            policy.allow_commands = commands.iter().cloned().collect::<BTreeSet<_>>();
        }
        if let Some(require_approval) = self.policy.require_approval {
            policy.require_approval = require_approval;
        }
        if let Some(max_file_bytes) = self.policy.max_file_bytes {
            policy.max_file_bytes = max_file_bytes;
        }
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parses() {
        let text = "llm:\n  model: gpt-4o\n  timeout_ms: 30000\nbudget:\n  max_steps: 500\n  max_cost_usd: 1.5\npolicy:\n  allow_commands: [ls, cat]\n  require_approval: true\n";
        let config: DriverConfig = serde_yaml::from_str(text).expect("parse");
        assert_eq!(config.llm_config().model, "gpt-4o");
        assert_eq!(config.budget_config().max_steps, Some(500));
        let policy = config.policy();
        assert!(policy.check_command("ls").is_ok());
        assert!(policy.require_approval);
    }

    #[test]
    fn test_empty_config_is_all_defaults() {
        let config: DriverConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config.budget_config(), BudgetConfig::default());
        assert_eq!(config.policy().allow_commands.len(), 0);
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(serde_yaml::from_str::<DriverConfig>("llm:\n  modle: typo\n").is_err());
    }
}
