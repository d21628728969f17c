//! Model router: stage identifier → backend configuration.
//!
//! Backends form a closed set of kinds ([`BackendKind`]). The router is a pure
//! lookup over static configuration; it never constructs clients. Infrastructure
//! crates turn a [`BackendDefinition`] into an [`crate::LlmProvider`].

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{BackendId, ConfigurationError, ModelParameters, PipelineGraph, StageId};

/// Default number of retries after the first backend attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default per-call backend timeout.
pub const DEFAULT_BACKEND_TIMEOUT: Duration = Duration::from_secs(120);

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling on the retry delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Anthropic Messages API.
    Anthropic,
    /// OpenAI-compatible chat completions API.
    #[serde(rename = "openai")]
    OpenAi,
    /// Fixed-response backend for dry runs and tests.
    Stub,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BackendKind::Anthropic => "anthropic",
            BackendKind::OpenAi => "openai",
            BackendKind::Stub => "stub",
        };
        f.write_str(label)
    }
}

/// Client-side limits shared by every run that targets a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    /// Maximum request starts per minute; unlimited when `None`.
    pub requests_per_minute: Option<u32>,
    /// Maximum in-flight requests; unlimited when `None`.
    pub max_concurrent: Option<usize>,
}

/// Retry schedule for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt. Total attempts are `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Ceiling on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            multiplier: 2.0,
        }
    }
}

/// A configured backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDefinition {
    /// Identifier stages bind to.
    pub id: BackendId,
    /// Which client implementation serves this backend.
    pub kind: BackendKind,
    /// Base URL; the kind's public endpoint when `None`.
    pub endpoint: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: Option<String>,
    /// Timeout for one backend call.
    pub timeout: Duration,
    /// Retry schedule for transient failures.
    pub retry: RetrySettings,
    /// Shared client-side rate limit.
    pub rate_limit: RateLimit,
    /// Fixed completion returned by [`BackendKind::Stub`] backends.
    pub stub_response: Option<String>,
}

impl BackendDefinition {
    /// Creates a definition with default timeout, retry schedule and no limits.
    pub fn new(id: BackendId, kind: BackendKind) -> Self {
        Self {
            id,
            kind,
            endpoint: None,
            api_key_env: None,
            timeout: DEFAULT_BACKEND_TIMEOUT,
            retry: RetrySettings::default(),
            rate_limit: RateLimit::default(),
            stub_response: None,
        }
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry schedule.
    #[must_use]
    pub fn with_retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the shared rate limit.
    #[must_use]
    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}

/// Everything the executor needs to call the backend for one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// The backend endpoint.
    pub backend: BackendDefinition,
    /// Per-stage model parameters.
    pub params: ModelParameters,
}

/// Resolves stages to backend configurations.
#[derive(Debug, Clone, Default)]
pub struct ModelRouter {
    backends: HashMap<BackendId, BackendDefinition>,
    bindings: HashMap<StageId, ModelParameters>,
    overrides: HashMap<StageId, BackendConfig>,
}

impl ModelRouter {
    /// Creates a router over the given backends with no stage bindings.
    pub fn new(backends: impl IntoIterator<Item = BackendDefinition>) -> Self {
        Self {
            backends: backends.into_iter().map(|b| (b.id.clone(), b)).collect(),
            bindings: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Creates a router with every stage's own model binding registered.
    pub fn for_graph(
        graph: &PipelineGraph,
        backends: impl IntoIterator<Item = BackendDefinition>,
    ) -> Self {
        let mut router = Self::new(backends);
        for stage in graph.stages() {
            if let Some(model) = &stage.model {
                router.bind(stage.id.clone(), model.clone());
            }
        }
        router
    }

    /// Binds (or rebinds) a stage to model parameters.
    pub fn bind(&mut self, stage: StageId, params: ModelParameters) {
        self.bindings.insert(stage, params);
    }

    /// Installs a caller-supplied configuration that takes precedence over the
    /// static binding of `stage`.
    #[must_use]
    pub fn with_override(mut self, stage: StageId, config: BackendConfig) -> Self {
        self.overrides.insert(stage, config);
        self
    }

    /// Resolves the backend configuration of `stage`.
    ///
    /// # Errors
    ///
    /// - [`ConfigurationError::UnboundStage`] if the stage has neither an
    ///   override nor a binding.
    /// - [`ConfigurationError::UnknownBackend`] if the binding names a backend
    ///   that is not configured.
    pub fn resolve(&self, stage: &StageId) -> Result<BackendConfig, ConfigurationError> {
        if let Some(config) = self.overrides.get(stage) {
            return Ok(config.clone());
        }
        let params = self
            .bindings
            .get(stage)
            .ok_or_else(|| ConfigurationError::UnboundStage {
                stage: stage.clone(),
            })?;
        let backend = self.backends.get(&params.backend).ok_or_else(|| {
            ConfigurationError::UnknownBackend {
                stage: stage.clone(),
                backend: params.backend.clone(),
            }
        })?;
        Ok(BackendConfig {
            backend: backend.clone(),
            params: params.clone(),
        })
    }

    /// All configured backends (override backends excluded).
    pub fn backends(&self) -> impl Iterator<Item = &BackendDefinition> {
        self.backends.values()
    }
}
