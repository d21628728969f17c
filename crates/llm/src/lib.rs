//! Stagecraft LLM backend adapters.
//!
//! Implements [`pipeline::LlmProvider`] for the closed set of
//! [`pipeline::BackendKind`]s: Anthropic, OpenAI-compatible servers and a
//! deterministic stub. [`build_provider`] turns a configured
//! [`BackendDefinition`] into a ready client.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing and
//! status classification live here. Timeouts across attempts, retries and rate
//! limiting are owned by the stage executor in `nodes`; a provider performs
//! exactly one request per call.

use std::sync::Arc;

use pipeline::{BackendDefinition, BackendKind, LlmProvider};
use thiserror::Error;

mod anthropic;
mod http;
mod openai;
mod stub;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAiProvider;
pub use stub::StubProvider;

/// Environment variable read for Anthropic keys when none is configured.
pub const DEFAULT_ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Environment variable read for OpenAI keys when none is configured.
pub const DEFAULT_OPENAI_KEY_ENV: &str = "OPENAI_API_KEY";

/// A backend definition could not be turned into a client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderBuildError {
    /// The API key environment variable is unset or empty.
    #[error("Backend '{backend}' requires an API key in ${variable}")]
    MissingApiKey {
        /// Backend being built.
        backend: String,
        /// Environment variable that was read.
        variable: String,
    },

    /// A stub backend was configured without a response.
    #[error("Stub backend '{backend}' has no configured response")]
    MissingStubResponse {
        /// Backend being built.
        backend: String,
    },
}

/// Builds the client for `definition`.
///
/// API keys are read from the environment at build time so a missing key is
/// reported before any stage runs.
pub fn build_provider(
    definition: &BackendDefinition,
) -> Result<Arc<dyn LlmProvider>, ProviderBuildError> {
    build_provider_with(definition, |var| std::env::var(var).ok())
}

/// [`build_provider`] with an injectable environment lookup.
pub fn build_provider_with(
    definition: &BackendDefinition,
    env: impl Fn(&str) -> Option<String>,
) -> Result<Arc<dyn LlmProvider>, ProviderBuildError> {
    let endpoint = definition.endpoint.clone();
    let timeout = definition.timeout;
    let key_for = |default_var: &str| {
        let variable = definition.api_key_env.as_deref().unwrap_or(default_var);
        (variable.to_string(), env(variable).filter(|k| !k.trim().is_empty()))
    };

    let provider: Arc<dyn LlmProvider> = match definition.kind {
        BackendKind::Anthropic => {
            let (variable, key) = key_for(DEFAULT_ANTHROPIC_KEY_ENV);
            let key = key.ok_or_else(|| ProviderBuildError::MissingApiKey {
                backend: definition.id.to_string(),
                variable,
            })?;
            Arc::new(AnthropicProvider::new(key, endpoint, timeout))
        }
        BackendKind::OpenAi => {
            let (variable, key) = key_for(DEFAULT_OPENAI_KEY_ENV);
            // Local OpenAI-compatible servers usually run without a key.
            if key.is_none() && endpoint.is_none() {
                return Err(ProviderBuildError::MissingApiKey {
                    backend: definition.id.to_string(),
                    variable,
                });
            }
            Arc::new(OpenAiProvider::new(key, endpoint, timeout))
        }
        BackendKind::Stub => {
            let response = definition.stub_response.clone().ok_or_else(|| {
                ProviderBuildError::MissingStubResponse {
                    backend: definition.id.to_string(),
                }
            })?;
            Arc::new(StubProvider::fixed(response))
        }
    };

    tracing::debug!(backend = %definition.id, kind = %definition.kind, "backend client built");
    Ok(provider)
}
