//! LLM gateway: every backend call goes through here.
//!
//! The gateway owns the provider for each configured backend together with
//! that backend's shared [`RateLimiter`]. One call is rate limited, bounded by
//! the backend timeout, and retried with exponential backoff while the failure
//! is transient and the retry budget lasts.

use std::collections::HashMap;
use std::sync::Arc;

use pipeline::{
    BackendConfig, BackendDefinition, BackendId, LlmError, LlmProvider, LlmRequest, LlmResponse,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::rate_limit::RateLimiter;
use crate::retry::Backoff;

struct Route {
    provider: Arc<dyn LlmProvider>,
    limiter: RateLimiter,
}

/// A completion and how many attempts it took.
#[derive(Debug, Clone)]
pub struct GatewayResponse {
    /// The successful response.
    pub response: LlmResponse,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

/// Why a gateway call failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// No provider is registered for the backend.
    #[error("No provider registered for backend '{0}'")]
    Unrouted(BackendId),

    /// The backend's last failure after the retry budget was spent (or a
    /// non-retryable failure).
    #[error(transparent)]
    Backend(#[from] LlmError),
}

/// A failed gateway call and how many attempts it consumed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct GatewayFailure {
    /// The terminal error.
    pub error: GatewayError,
    /// Attempts made.
    pub attempts: u32,
}

/// Routes requests to backend providers.
#[derive(Default)]
pub struct LlmGateway {
    routes: HashMap<BackendId, Route>,
}

impl LlmGateway {
    /// Creates a gateway with no backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the provider serving `definition`, replacing any previous one.
    pub fn register(&mut self, definition: &BackendDefinition, provider: Arc<dyn LlmProvider>) {
        debug!(backend = %definition.id, kind = %provider.kind(), "backend registered");
        self.routes.insert(
            definition.id.clone(),
            Route {
                provider,
                limiter: RateLimiter::new(definition.rate_limit),
            },
        );
    }

    /// Builder form of [`LlmGateway::register`].
    #[must_use]
    pub fn with_backend(
        mut self,
        definition: &BackendDefinition,
        provider: Arc<dyn LlmProvider>,
    ) -> Self {
        self.register(definition, provider);
        self
    }

    /// Returns `true` if a provider is registered for `backend`.
    pub fn serves(&self, backend: &BackendId) -> bool {
        self.routes.contains_key(backend)
    }

    /// Performs one logical completion with timeout, rate limiting and retries.
    pub async fn complete(
        &self,
        config: &BackendConfig,
        request: &LlmRequest,
    ) -> Result<GatewayResponse, GatewayFailure> {
        let backend = &config.backend;
        let route = self.routes.get(&backend.id).ok_or_else(|| GatewayFailure {
            error: GatewayError::Unrouted(backend.id.clone()),
            attempts: 0,
        })?;
        let backoff = Backoff::new(backend.retry);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match Self::attempt(route, backend, request).await {
                Ok(response) => {
                    debug!(backend = %backend.id, attempts, "backend call succeeded");
                    return Ok(GatewayResponse { response, attempts });
                }
                Err(error) => {
                    // Retry number `attempts` follows attempt number `attempts`.
                    let Some(delay) = backoff.next_delay(attempts, &error.retry_policy()) else {
                        warn!(backend = %backend.id, attempts, error = %error, "backend call failed");
                        return Err(GatewayFailure {
                            error: GatewayError::Backend(error),
                            attempts,
                        });
                    };
                    warn!(
                        backend = %backend.id,
                        attempt = attempts,
                        delay = ?delay,
                        error = %error,
                        "transient backend failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn attempt(
        route: &Route,
        backend: &BackendDefinition,
        request: &LlmRequest,
    ) -> Result<LlmResponse, LlmError> {
        let _permit = route.limiter.acquire().await;
        match tokio::time::timeout(backend.timeout, route.provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                after: backend.timeout,
            }),
        }
    }
}

impl std::fmt::Debug for LlmGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut backends: Vec<&str> = self.routes.keys().map(BackendId::as_str).collect();
        backends.sort_unstable();
        f.debug_struct("LlmGateway")
            .field("backends", &backends)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use llm::StubProvider;
    use pipeline::{BackendKind, ModelParameters, RetrySettings, StageId};

    fn config(max_retries: u32, timeout: Duration) -> BackendConfig {
        let backend = BackendDefinition::new(BackendId::new("stub").unwrap(), BackendKind::Stub)
            .with_timeout(timeout)
            .with_retry(RetrySettings {
                max_retries,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
            });
        BackendConfig {
            params: ModelParameters::new(backend.id.clone(), "stub-model"),
            backend,
        }
    }

    fn request() -> LlmRequest {
        LlmRequest {
            stage: StageId::new("code").unwrap(),
            system: "system".into(),
            prompt: "prompt".into(),
            params: ModelParameters::new(BackendId::new("stub").unwrap(), "stub-model"),
        }
    }

    fn failing_then_ok(failures: usize) -> Arc<StubProvider> {
        let mut script: Vec<Result<String, LlmError>> = (0..failures)
            .map(|_| {
                Err(LlmError::Server {
                    status: 503,
                    message: "overloaded".into(),
                })
            })
            .collect();
        script.push(Ok("done".into()));
        Arc::new(StubProvider::scripted(script))
    }

    #[tokio::test]
    async fn transient_failures_within_budget_succeed() {
        let cfg = config(3, Duration::from_secs(5));
        let stub = failing_then_ok(3);
        let gateway = LlmGateway::new().with_backend(&cfg.backend, stub.clone());

        let ok = gateway.complete(&cfg, &request()).await.unwrap();
        assert_eq!(ok.response.content, "done");
        assert_eq!(ok.attempts, 4);
        assert_eq!(stub.calls(), 4);
    }

    #[tokio::test]
    async fn failures_beyond_budget_are_terminal() {
        let cfg = config(2, Duration::from_secs(5));
        let stub = failing_then_ok(3);
        let gateway = LlmGateway::new().with_backend(&cfg.backend, stub.clone());

        let failure = gateway.complete(&cfg, &request()).await.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert!(matches!(
            failure.error,
            GatewayError::Backend(LlmError::Server { status: 503, .. })
        ));
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let cfg = config(3, Duration::from_secs(5));
        let stub = Arc::new(StubProvider::scripted(vec![Err(LlmError::Authentication(
            "bad key".into(),
        ))]));
        let gateway = LlmGateway::new().with_backend(&cfg.backend, stub.clone());

        let failure = gateway.complete(&cfg, &request()).await.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backends_time_out() {
        let cfg = config(1, Duration::from_millis(50));
        let stub = Arc::new(StubProvider::fixed("late").with_delay(Duration::from_secs(10)));
        let gateway = LlmGateway::new().with_backend(&cfg.backend, stub.clone());

        let failure = gateway.complete(&cfg, &request()).await.unwrap_err();
        assert_eq!(
            failure.error,
            GatewayError::Backend(LlmError::Timeout {
                after: Duration::from_millis(50)
            })
        );
        assert_eq!(failure.attempts, 2);
    }

    #[tokio::test]
    async fn unknown_backend_makes_no_attempt() {
        let cfg = config(3, Duration::from_secs(1));
        let failure = LlmGateway::new()
            .complete(&cfg, &request())
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 0);
        assert!(matches!(failure.error, GatewayError::Unrouted(_)));
    }
}
