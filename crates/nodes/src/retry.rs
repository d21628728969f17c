//! Exponential backoff for transient backend failures.

use std::time::Duration;

use pipeline::{RetryPolicy, RetrySettings};

/// Delay schedule derived from a backend's [`RetrySettings`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    settings: RetrySettings,
}

impl Backoff {
    /// Creates a schedule from backend settings.
    pub fn new(settings: RetrySettings) -> Self {
        Self { settings }
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.settings.max_retries
    }

    /// Delay before retry number `retry` (1-based):
    /// `initial * multiplier^(retry - 1)`, capped at the configured maximum.
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms =
            self.settings.initial_backoff.as_millis() as f64 * self.settings.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.settings.max_backoff.as_millis() as f64);
        if capped_ms.is_finite() && capped_ms > 0.0 {
            Duration::from_millis(capped_ms as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before retry `retry` given the failure's policy, or `None` when the
    /// failure must not be retried or the retry budget is spent.
    ///
    /// A server-suggested delay replaces the computed one.
    pub fn next_delay(&self, retry: u32, policy: &RetryPolicy) -> Option<Duration> {
        if retry > self.settings.max_retries {
            return None;
        }
        match policy {
            RetryPolicy::Retryable { after: Some(after) } => Some(*after),
            RetryPolicy::Retryable { after: None } => Some(self.delay(retry)),
            RetryPolicy::NonRetryable => None,
        }
    }
}
