//! # PlanScript LLM
//!
//! The adapter that turns a structured request into a validated Plan:
//! message assembly, one HTTPS POST per attempt, JSON extraction and
//! cleanup, truncated-output recovery, schema validation with correction
//! retries, and transport-level retry policy (429, network, timeout).

pub mod adapter;
pub mod extract;
pub mod transport;

use thiserror::Error;

use planscript_core::plan::SchemaError;

pub use adapter::{LlmAdapter, LlmConfig, LlmRequest, LlmResult};
pub use transport::{ChatMessage, HttpTransport, LlmTransport, ScriptedTransport, TransportReply};

/// Adapter failure after all internal handling is exhausted.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LlmError: LLM request timed out after {0}ms")]
    Timeout(u64),

    #[error("LlmError: HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LlmError: network failure after {attempts} attempts: {message}")]
    Network { attempts: u32, message: String },

    #[error("LlmError: gave up after {0} rate-limit waits")]
    RateLimitExhausted(u32),

    #[error("LlmError: no valid plan after {attempts} attempts: {last}")]
    InvalidPlan { attempts: u32, last: String },

    #[error("LlmError: malformed provider response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}
