//! LLM backend port.
//!
//! Infrastructure crates implement [`LlmProvider`]; the stage executor owns
//! timeouts, retries and rate limiting, so implementations perform exactly one
//! request per call.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BackendKind, ModelParameters, RetryPolicy, StageId, TokenUsage};

/// One model-facing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Stage the request is made for.
    pub stage: StageId,
    /// System prompt (the stage's role and output contract).
    pub system: String,
    /// User prompt (inputs, memory, corrective feedback).
    pub prompt: String,
    /// Model parameters.
    pub params: ModelParameters,
}

/// A successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text.
    pub content: String,
    /// Token usage reported by the backend.
    pub usage: TokenUsage,
}

impl LlmResponse {
    /// A response with no usage metadata.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Backend failure signal.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum LlmError {
    /// No response within the configured timeout.
    #[error("Backend timed out after {after:?}")]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The backend asked the caller to slow down.
    #[error("Backend rate limit reached")]
    RateLimited {
        /// Server-suggested delay, if any.
        retry_after: Option<Duration>,
    },

    /// 5xx-equivalent failure.
    #[error("Backend server error {status}: {message}")]
    Server {
        /// HTTP status (or equivalent).
        status: u16,
        /// Server-provided description.
        message: String,
    },

    /// Connection-level failure.
    #[error("Backend transport error: {0}")]
    Transport(String),

    /// Credentials missing or refused.
    #[error("Backend authentication failed: {0}")]
    Authentication(String),

    /// The request was rejected as invalid (4xx other than auth and rate limit).
    #[error("Backend rejected request {status}: {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Server-provided description.
        message: String,
    },

    /// The response body could not be interpreted.
    #[error("Backend returned a malformed response: {0}")]
    MalformedResponse(String),
}

impl LlmError {
    /// Whether the executor may retry after this error.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            LlmError::Timeout { .. } | LlmError::Server { .. } | LlmError::Transport(_) => {
                RetryPolicy::Retryable { after: None }
            }
            LlmError::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            LlmError::Authentication(_)
            | LlmError::Rejected { .. }
            | LlmError::MalformedResponse(_) => RetryPolicy::NonRetryable,
        }
    }
}

/// A model inference backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// The backend kind this provider serves.
    fn kind(&self) -> BackendKind;

    /// Performs one completion request.
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;
}
