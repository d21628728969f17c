//! Deterministic backend for dry runs and tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{BackendKind, LlmError, LlmProvider, LlmRequest, LlmResponse};
use tracing::debug;

type Responder = dyn Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync;

enum Behaviour {
    Fixed(String),
    Scripted(Vec<Result<String, LlmError>>),
    Dynamic(Arc<Responder>),
}

#[derive(Default)]
struct Recorded {
    requests: Vec<LlmRequest>,
}

/// A backend that answers from a fixed text, a script or a closure.
///
/// Every request is recorded so tests can assert on call counts and prompts.
pub struct StubProvider {
    behaviour: Behaviour,
    delay: Option<Duration>,
    recorded: Mutex<Recorded>,
}

impl StubProvider {
    /// Always answers `content`.
    pub fn fixed(content: impl Into<String>) -> Self {
        Self::with_behaviour(Behaviour::Fixed(content.into()))
    }

    /// Answers the `n`th call with `script[n]`; the last entry repeats.
    ///
    /// An empty script answers every call with an empty string.
    pub fn scripted(script: Vec<Result<String, LlmError>>) -> Self {
        Self::with_behaviour(Behaviour::Scripted(script))
    }

    /// Answers by calling `f` with each request.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&LlmRequest) -> Result<String, LlmError> + Send + Sync + 'static,
    {
        Self::with_behaviour(Behaviour::Dynamic(Arc::new(f)))
    }

    /// Sleeps for `delay` before answering each call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of calls received so far.
    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    /// Copies of every request received so far.
    pub fn requests(&self) -> Vec<LlmRequest> {
        self.lock().requests.clone()
    }

    fn with_behaviour(behaviour: Behaviour) -> Self {
        Self {
            behaviour,
            delay: None,
            recorded: Mutex::new(Recorded::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        // A poisoned lock only means a test panicked mid-record.
        self.recorded.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for StubProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubProvider")
            .field("calls", &self.calls())
            .field("delay", &self.delay)
            .finish()
    }
}

#[async_trait]
impl LlmProvider for StubProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Stub
    }

    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let call = {
            let mut recorded = self.lock();
            recorded.requests.push(request.clone());
            recorded.requests.len() - 1
        };
        debug!(stage = %request.stage, call, "stub backend called");

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let answer = match &self.behaviour {
            Behaviour::Fixed(text) => Ok(text.clone()),
            Behaviour::Scripted(script) => match script.get(call).or_else(|| script.last()) {
                Some(entry) => entry.clone(),
                None => Ok(String::new()),
            },
            Behaviour::Dynamic(f) => f(request),
        };
        answer.map(LlmResponse::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{BackendId, ModelParameters, StageId};

    fn request(stage: &str) -> LlmRequest {
        LlmRequest {
            stage: StageId::new(stage).unwrap(),
            system: "system".into(),
            prompt: "prompt".into(),
            params: ModelParameters::new(BackendId::new("stub").unwrap(), "stub-model"),
        }
    }

    #[tokio::test]
    async fn scripted_repeats_last_entry() {
        let stub = StubProvider::scripted(vec![
            Err(LlmError::Transport("reset".into())),
            Ok("done".into()),
        ]);
        assert!(stub.complete(&request("a")).await.is_err());
        assert_eq!(stub.complete(&request("a")).await.unwrap().content, "done");
        assert_eq!(stub.complete(&request("a")).await.unwrap().content, "done");
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn from_fn_sees_the_request() {
        let stub = StubProvider::from_fn(|req| Ok(format!("echo {}", req.stage)));
        let response = stub.complete(&request("code")).await.unwrap();
        assert_eq!(response.content, "echo code");
        assert_eq!(stub.requests()[0].stage, StageId::new("code").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_applied_before_answering() {
        let stub = StubProvider::fixed("late").with_delay(Duration::from_secs(5));
        let started = tokio::time::Instant::now();
        stub.complete(&request("a")).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }
}
