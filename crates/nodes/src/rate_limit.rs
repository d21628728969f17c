//! Client-side rate limiting per backend.
//!
//! One [`RateLimiter`] exists per configured backend and is shared by every run
//! the process executes, so concurrent runs draw from the same budget.

use std::sync::Arc;
use std::time::Duration;

use pipeline::RateLimit;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

/// Caps in-flight requests and spaces request starts.
#[derive(Debug)]
pub struct RateLimiter {
    concurrency: Option<Arc<Semaphore>>,
    min_interval: Option<Duration>,
    next_start: Mutex<Option<Instant>>,
}

/// Holds a concurrency slot until dropped.
#[derive(Debug)]
pub struct RatePermit {
    _slot: Option<OwnedSemaphorePermit>,
}

impl RateLimiter {
    /// Creates a limiter from backend limits. Zero values are treated as unlimited.
    pub fn new(limit: RateLimit) -> Self {
        let concurrency = limit
            .max_concurrent
            .filter(|n| *n > 0)
            .map(|n| Arc::new(Semaphore::new(n)));
        let min_interval = limit
            .requests_per_minute
            .filter(|n| *n > 0)
            .map(|rpm| Duration::from_secs(60) / rpm);
        Self {
            concurrency,
            min_interval,
            next_start: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(RateLimit::default())
    }

    /// Waits for a concurrency slot and for the next start slot.
    pub async fn acquire(&self) -> RatePermit {
        let slot = match &self.concurrency {
            // The semaphore is never closed; a closed one degrades to unlimited.
            Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
            None => None,
        };

        if let Some(interval) = self.min_interval {
            let start_at = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let start_at = next.map_or(now, |n| n.max(now));
                *next = Some(start_at + interval);
                start_at
            };
            if start_at > Instant::now() {
                debug!(wait = ?(start_at - Instant::now()), "rate limit delaying request");
                tokio::time::sleep_until(start_at).await;
            }
        }

        RatePermit { _slot: slot }
    }

    /// Free concurrency slots, or `None` when concurrency is unlimited.
    pub fn available_slots(&self) -> Option<usize> {
        self.concurrency.as_ref().map(|s| s.available_permits())
    }
}
