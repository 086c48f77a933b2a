//! LLM transport
//!
//! One HTTPS POST per attempt against an OpenAI-compatible chat
//! endpoint. The transport reports rate limiting, timeouts and network
//! failures as distinct outcomes so the adapter can apply the right
//! retry policy to each.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use planscript_core::event::LlmUsage;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Raw completion text plus usage, before any plan parsing.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub content: String,
    pub usage: LlmUsage,
}

/// Transport-level outcomes the adapter treats differently.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rate limited")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("network: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn complete(&self, body: &Value) -> Result<TransportReply, TransportError>;
}

/// reqwest-backed transport with bearer auth.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Debug, Deserialize)]
struct ChatMessageBody {
    content: String,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn complete(&self, body: &Value) -> Result<TransportReply, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            let value = format!("Bearer {}", key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&value)
                    .map_err(|e| TransportError::Network(e.to_string()))?,
            );
        }

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let header_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let text = response.text().await.unwrap_or_default();
            let retry_after_ms = header_ms.or_else(|| parse_try_again_snippet(&text));
            return Err(TransportError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;
        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| TransportError::Malformed("missing choices".to_string()))?;
        let usage = parsed
            .usage
            .map(|u| LlmUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();
        Ok(TransportReply { content, usage })
    }
}

/// Parse a "try again in Xs" snippet out of a 429 body.
pub fn parse_try_again_snippet(body: &str) -> Option<u64> {
    let idx = body.find("try again in ")?;
    let after = &body[idx + "try again in ".len()..];
    let digits: String = after
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let rest = &after[digits.len()..];
    if !rest.starts_with('s') {
        return None;
    }
    let seconds: f64 = digits.parse().ok()?;
    Some((seconds * 1000.0) as u64)
}

/// Scripted transport for tests: pops one prepared outcome per call.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<TransportReply, TransportError>>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<TransportReply, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
        }
    }

    pub fn from_contents(contents: Vec<&str>) -> Self {
        Self::new(
            contents
                .into_iter()
                .map(|content| {
                    Ok(TransportReply {
                        content: content.to_string(),
                        usage: LlmUsage {
                            prompt_tokens: 10,
                            completion_tokens: 10,
                            total_tokens: 20,
                        },
                    })
                })
                .collect(),
        )
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn complete(&self, _body: &Value) -> Result<TransportReply, TransportError> {
        let mut replies = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        replies
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_again_snippet_parsing() {
        assert_eq!(
            parse_try_again_snippet("Rate limit reached, please try again in 2s."),
            Some(2000)
        );
        assert_eq!(
            parse_try_again_snippet("please try again in 1.5s"),
            Some(1500)
        );
        assert_eq!(parse_try_again_snippet("try again later"), None);
    }

    #[test]
    fn test_scripted_transport_pops_in_order() {
        tokio_test::block_on(async {
            let transport = ScriptedTransport::from_contents(vec!["first", "second"]);
            let body = serde_json::json!({});
            assert_eq!(transport.complete(&body).await.expect("first").content, "first");
            assert_eq!(
                transport.complete(&body).await.expect("second").content,
                "second"
            );
            assert!(transport.complete(&body).await.is_err());
        });
    }
}
