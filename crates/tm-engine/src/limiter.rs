//! Rolling-window cap on job claims, shared by every worker.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tm_core::config::RateLimitConfig;
use tokio_util::sync::CancellationToken;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Admits at most `max_jobs` claims per `window`.
///
/// A zero limit disables throttling.
#[derive(Clone)]
pub struct ClaimLimiter {
    inner: Option<Arc<DirectLimiter>>,
}

impl ClaimLimiter {
    pub fn new(max_jobs: u32, window: Duration) -> Self {
        let inner = NonZeroU32::new(max_jobs)
            .filter(|_| !window.is_zero())
            .and_then(|burst| {
                Quota::with_period(window / burst.get()).map(|q| q.allow_burst(burst))
            })
            .map(|quota| Arc::new(RateLimiter::direct(quota)));
        Self { inner }
    }

    pub fn unlimited() -> Self {
        Self { inner: None }
    }

    /// Wait for a claim slot. Returns `false` if `cancel` fired first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        let Some(limiter) = &self.inner else {
            return !cancel.is_cancelled();
        };
        tokio::select! {
            _ = limiter.until_ready() => true,
            _ = cancel.cancelled() => false,
        }
    }
}

impl From<&RateLimitConfig> for ClaimLimiter {
    fn from(config: &RateLimitConfig) -> Self {
        Self::new(config.max_jobs, Duration::from_secs(config.window_secs))
    }
}
