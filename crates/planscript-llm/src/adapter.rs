//! Adapter
//!
//! Composes the message list, calls the transport, recovers a Plan from
//! whatever came back, and applies the retry policy: schema failures get
//! a terse correction request and an exponential back-off; 429s wait
//! without consuming an attempt; timeouts and other HTTP failures
//! propagate.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, warn};

use planscript_core::event::LlmUsage;
use planscript_core::plan::Plan;

use crate::extract::{extract_plan_json, recover_truncated_write};
use crate::transport::{ChatMessage, HttpTransport, LlmTransport, TransportError};
use crate::LlmError;

const MAX_RATE_LIMIT_WAITS: u32 = 10;
const MAX_PROMPT_LOG_CHARS: usize = 2_000;

/// Adapter configuration. One instance per provider/model pairing.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.2,
            max_tokens: 4096,
            timeout_ms: 60_000,
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

impl LlmConfig {
    /// Overlay recognized keys from a loosely-typed options object.
    pub fn overlaid(&self, spec: &Value) -> Self {
        let mut next = self.clone();
        if let Some(model) = spec.get("model").and_then(|v| v.as_str()) {
            next.model = model.to_string();
        }
        if let Some(endpoint) = spec.get("endpoint").and_then(|v| v.as_str()) {
            next.endpoint = endpoint.to_string();
        }
        if let Some(provider) = spec.get("provider").and_then(|v| v.as_str()) {
            // Providers are addressed by endpoint; a bare name selects the
            // OpenAI-compatible default path for that host.
            if provider != "openai" && !next.endpoint.contains(provider) {
                next.endpoint = format!("https://api.{}.com/v1/chat/completions", provider);
            }
        }
        if let Some(key) = spec.get("apiKey").and_then(|v| v.as_str()) {
            next.api_key = Some(key.to_string());
        }
        if let Some(temperature) = spec.get("temperature").and_then(|v| v.as_f64()) {
            next.temperature = temperature;
        }
        if let Some(max_tokens) = spec.get("maxTokens").and_then(|v| v.as_u64()) {
            next.max_tokens = max_tokens;
        }
        if let Some(timeout) = spec.get("timeoutMs").and_then(|v| v.as_u64()) {
            next.timeout_ms = timeout;
        }
        if let Some(retries) = spec.get("maxRetries").and_then(|v| v.as_u64()) {
            next.max_retries = retries as u32;
        }
        if let Some(delay) = spec.get("retryDelayMs").and_then(|v| v.as_u64()) {
            next.retry_delay_ms = delay;
        }
        next
    }
}

/// One structured request to the adapter.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub system: Option<String>,
    pub user: String,
    /// Pre-encoded structured context, injected as its own message.
    pub context: Option<String>,
    pub history: Vec<ChatMessage>,
    /// Present in tests and offline runs: parsed directly, zero latency,
    /// zero tokens, no transport call.
    pub mock_plan: Option<Value>,
    /// Delimited memory block appended to the system prompt.
    pub memory_context: Option<String>,
}

/// A completed adapter call.
#[derive(Debug, Clone)]
pub struct LlmResult {
    pub plan: Plan,
    pub raw: String,
    pub usage: LlmUsage,
    pub latency_ms: u64,
    pub retries: u32,
}

/// The LLM adapter: transport plus retry policy.
pub struct LlmAdapter {
    config: LlmConfig,
    transport: Arc<dyn LlmTransport>,
}

impl LlmAdapter {
    pub fn new(config: LlmConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(
            config.endpoint.clone(),
            config.api_key.clone(),
            config.timeout_ms,
        ));
        Self { config, transport }
    }

    /// Adapter over a caller-supplied transport (tests, offline runs).
    pub fn with_transport(config: LlmConfig, transport: Arc<dyn LlmTransport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub async fn call(&self, request: &LlmRequest) -> Result<LlmResult, LlmError> {
        if let Some(mock) = &request.mock_plan {
            let plan = Plan::from_value(mock)?;
            return Ok(LlmResult {
                raw: mock.to_string(),
                plan,
                usage: LlmUsage::default(),
                latency_ms: 0,
                retries: 0,
            });
        }

        let started = Instant::now();
        let mut messages = self.build_messages(request);
        let mut usage = LlmUsage::default();
        let mut attempts = 0u32;
        let mut rate_limit_waits = 0u32;

        loop {
            let body = json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens,
                "response_format": {"type": "json_object"},
            });
            debug!(
                model = %self.config.model,
                attempt = attempts,
                message_count = messages.len(),
                "llm request"
            );

            let reply = match self.transport.complete(&body).await {
                Ok(reply) => reply,
                Err(TransportError::RateLimited { retry_after_ms }) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > MAX_RATE_LIMIT_WAITS {
                        return Err(LlmError::RateLimitExhausted(MAX_RATE_LIMIT_WAITS));
                    }
                    let wait = retry_after_ms.unwrap_or(self.config.retry_delay_ms);
                    warn!(wait_ms = wait, "rate limited; waiting");
                    sleep(Duration::from_millis(wait)).await;
                    continue;
                }
                Err(TransportError::Timeout) => {
                    return Err(LlmError::Timeout(self.config.timeout_ms))
                }
                Err(TransportError::Status { status, body }) => {
                    return Err(LlmError::Http { status, body })
                }
                Err(TransportError::Malformed(message)) => {
                    return Err(LlmError::MalformedResponse(message))
                }
                Err(TransportError::Network(message)) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(LlmError::Network { attempts, message });
                    }
                    sleep(self.backoff(attempts)).await;
                    continue;
                }
            };

            usage.prompt_tokens += reply.usage.prompt_tokens;
            usage.completion_tokens += reply.usage.completion_tokens;
            usage.total_tokens += reply.usage.total_tokens;

            match plan_from_text(&reply.content) {
                Ok(plan) => {
                    return Ok(LlmResult {
                        plan,
                        raw: reply.content,
                        usage,
                        latency_ms: elapsed_ms(started),
                        retries: attempts,
                    })
                }
                Err(reason) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(LlmError::InvalidPlan {
                            attempts,
                            last: reason,
                        });
                    }
                    debug!(attempt = attempts, %reason, "invalid plan; requesting correction");
                    messages.push(ChatMessage::assistant(reply.content.clone()));
                    messages.push(ChatMessage::user(format!(
                        "That reply was not a valid plan ({}). Return ONLY one JSON object with \
                         fields action, args, done.",
                        reason
                    )));
                    sleep(self.backoff(attempts)).await;
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(factor))
    }

    fn build_messages(&self, request: &LlmRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        let mut system = request.system.clone().unwrap_or_default();
        if let Some(memory) = &request.memory_context {
            if !system.is_empty() {
                system.push_str("\n\n");
            }
            system.push_str("--- Memory Context ---\n");
            system.push_str(memory);
            system.push_str("\n--- End Memory ---");
        }
        if !system.is_empty() {
            messages.push(ChatMessage::system(truncate_owned(system)));
        }
        if let Some(context) = &request.context {
            messages.push(ChatMessage::user(format!("Current context:\n{}", context)));
        }
        messages.extend(request.history.iter().cloned());
        messages.push(ChatMessage::user(request.user.clone()));
        messages
    }
}

fn truncate_owned(text: String) -> String {
    // System prompts are bounded only defensively at the message layer;
    // prompts this long indicate a runaway memory block.
    const MAX_SYSTEM_CHARS: usize = 100_000;
    if text.chars().count() <= MAX_SYSTEM_CHARS {
        return text;
    }
    let truncated: String = text.chars().take(MAX_SYSTEM_CHARS).collect();
    debug!(
        original_chars = text.chars().count(),
        preview = %truncate_for_log(&text),
        "system prompt truncated"
    );
    truncated
}

fn truncate_for_log(input: &str) -> String {
    let count = input.chars().count();
    if count <= MAX_PROMPT_LOG_CHARS {
        return input.to_string();
    }
    let mut preview: String = input.chars().take(MAX_PROMPT_LOG_CHARS).collect();
    preview.push_str(&format!("... [truncated, total_chars={}]", count));
    preview
}

/// Extract, clean, recover and validate a Plan out of raw reply text.
fn plan_from_text(raw: &str) -> Result<Plan, String> {
    match extract_plan_json(raw) {
        Some(value) => match Plan::from_value(&value) {
            Ok(plan) => Ok(plan),
            Err(e) => recover_truncated_write(raw).ok_or_else(|| e.to_string()),
        },
        None => recover_truncated_write(raw)
            .ok_or_else(|| "reply did not contain a JSON object".to_string()),
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ScriptedTransport, TransportReply};
    use planscript_core::plan::PlanAction;

    fn adapter_with(script: ScriptedTransport) -> LlmAdapter {
        let config = LlmConfig {
            retry_delay_ms: 1,
            ..LlmConfig::default()
        };
        LlmAdapter::with_transport(config, Arc::new(script))
    }

    #[test]
    fn test_mock_plan_short_circuits() {
        tokio_test::block_on(async {
            let adapter = adapter_with(ScriptedTransport::from_contents(vec![]));
            let request = LlmRequest {
                user: ".".to_string(),
                mock_plan: Some(json!({
                    "action": "WRITE_FILE",
                    "args": {"path": "out.txt", "content": "hi"},
                    "done": true
                })),
                ..LlmRequest::default()
            };
            let result = adapter.call(&request).await.expect("mock call");
            assert_eq!(result.latency_ms, 0);
            assert_eq!(result.usage.total_tokens, 0);
            assert_eq!(result.retries, 0);
            assert!(result.plan.done);
        });
    }

    #[test]
    fn test_fenced_reply_parses() {
        tokio_test::block_on(async {
            let adapter = adapter_with(ScriptedTransport::from_contents(vec![
                "```json\n{\"action\": \"REPORT\", \"args\": {\"message\": \"done\"}, \"done\": true}\n```",
            ]));
            let request = LlmRequest {
                user: "finish".to_string(),
                ..LlmRequest::default()
            };
            let result = adapter.call(&request).await.expect("call");
            assert!(matches!(result.plan.action, PlanAction::Report { .. }));
            assert_eq!(result.usage.total_tokens, 20);
        });
    }

    #[test]
    fn test_invalid_plan_triggers_correction_retry() {
        tokio_test::block_on(async {
            let adapter = adapter_with(ScriptedTransport::from_contents(vec![
                "this is not json at all",
                "{\"action\": \"REPORT\", \"args\": {\"message\": \"ok\"}, \"done\": true}",
            ]));
            let request = LlmRequest {
                user: "go".to_string(),
                ..LlmRequest::default()
            };
            let result = adapter.call(&request).await.expect("second attempt succeeds");
            assert_eq!(result.retries, 1);
            // Both replies' usage is accounted.
            assert_eq!(result.usage.total_tokens, 40);
        });
    }

    #[test]
    fn test_retries_exhaust_into_invalid_plan_error() {
        tokio_test::block_on(async {
            let config = LlmConfig {
                max_retries: 1,
                retry_delay_ms: 1,
                ..LlmConfig::default()
            };
            let adapter = LlmAdapter::with_transport(
                config,
                Arc::new(ScriptedTransport::from_contents(vec!["junk", "more junk"])),
            );
            let request = LlmRequest {
                user: "go".to_string(),
                ..LlmRequest::default()
            };
            let err = adapter.call(&request).await.expect_err("must give up");
            assert!(matches!(err, LlmError::InvalidPlan { attempts: 2, .. }));
        });
    }

    #[test]
    fn test_rate_limit_does_not_consume_attempts() {
        tokio_test::block_on(async {
            let adapter = adapter_with(ScriptedTransport::new(vec![
                Err(TransportError::RateLimited {
                    retry_after_ms: Some(1),
                }),
                Ok(TransportReply {
                    content: "{\"action\": \"REPORT\", \"args\": {\"message\": \"ok\"}}".to_string(),
                    usage: LlmUsage::default(),
                }),
            ]));
            let request = LlmRequest {
                user: "go".to_string(),
                ..LlmRequest::default()
            };
            let result = adapter.call(&request).await.expect("call");
            assert_eq!(result.retries, 0);
        });
    }

    #[test]
    fn test_timeout_propagates_with_fixed_message() {
        tokio_test::block_on(async {
            let adapter = adapter_with(ScriptedTransport::new(vec![Err(TransportError::Timeout)]));
            let request = LlmRequest {
                user: "go".to_string(),
                ..LlmRequest::default()
            };
            let err = adapter.call(&request).await.expect_err("must time out");
            assert!(err.to_string().contains("LLM request timed out"));
        });
    }

    #[test]
    fn test_truncated_write_file_is_recovered() {
        tokio_test::block_on(async {
            let truncated = "{\"action\": \"WRITE_FILE\", \"args\": {\"path\": \"index.html\", \
                             \"content\": \"<html><p>hello</p></html>";
            let adapter = adapter_with(ScriptedTransport::from_contents(vec![truncated]));
            let request = LlmRequest {
                user: "write the page".to_string(),
                ..LlmRequest::default()
            };
            let result = adapter.call(&request).await.expect("recovered");
            match result.plan.action {
                PlanAction::WriteFile { path, content, .. } => {
                    assert_eq!(path, "index.html");
                    assert!(content.ends_with("</html>"));
                }
                other => panic!("expected WRITE_FILE, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_memory_context_is_delimited_in_system_prompt() {
        let adapter = adapter_with(ScriptedTransport::from_contents(vec![]));
        let request = LlmRequest {
            system: Some("You are a planner.".to_string()),
            user: "go".to_string(),
            memory_context: Some("objective: ship it".to_string()),
            ..LlmRequest::default()
        };
        let messages = adapter.build_messages(&request);
        assert_eq!(messages[0].role, "system");
        assert!(messages[0].content.contains("--- Memory Context ---"));
        assert!(messages[0].content.contains("objective: ship it"));
        assert!(messages[0].content.contains("--- End Memory ---"));
    }

    #[test]
    fn test_context_message_precedes_history_and_user() {
        let adapter = adapter_with(ScriptedTransport::from_contents(vec![]));
        let request = LlmRequest {
            system: Some("sys".to_string()),
            user: "latest".to_string(),
            context: Some("k: v".to_string()),
            history: vec![ChatMessage::user("earlier")],
            ..LlmRequest::default()
        };
        let messages = adapter.build_messages(&request);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user", "user"]);
        assert!(messages[1].content.starts_with("Current context:\n"));
        assert_eq!(messages[3].content, "latest");
    }
}
