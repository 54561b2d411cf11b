//! Rate limiting and retry for I/O-bound calls.
//!
//! A [`Resilience`] value is handed to every component that talks to the
//! network. It composes two policies:
//!
//! - **[`RateLimiter`]**: a token bucket holding `calls` tokens that refill
//!   at each `period` boundary. When the bucket is empty the caller
//!   suspends until the next refill; calls are never dropped.
//! - **[`RetryPolicy`]**: retries calls that fail with a transient error
//!   (see [`Error::is_transient`]) up to `max_attempts`, sleeping a fixed or
//!   exponentially growing delay between attempts. When the budget runs out
//!   the last error comes back wrapped in [`Error::RetriesExhausted`].
//!
//! A token is acquired before every attempt but attempts are only counted
//! once the call actually runs, so time spent throttled never uses up a
//! retry.
//!
//! The limiter is shared through an `Arc`: one limiter per job, cloned into
//! extractors, loaders and attachment fetchers alike.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// `calls` requests per `period`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub calls: u32,
    pub period: Duration,
}

struct Bucket {
    tokens: u32,
    window_start: Instant,
}

/// Token bucket shared by all concurrent callers of a job.
pub struct RateLimiter {
    limit: RateLimit,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            bucket: Mutex::new(Bucket {
                tokens: limit.calls,
                window_start: Instant::now(),
            }),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Take one token, waiting for the next period if the bucket is empty.
    ///
    /// The bucket lock is held while waiting, so waiters are served in
    /// arrival order.
    pub async fn acquire(&self) {
        let mut bucket = self.bucket.lock().await;
        loop {
            let now = Instant::now();
            if now.duration_since(bucket.window_start) >= self.limit.period {
                bucket.window_start = now;
                bucket.tokens = self.limit.calls;
            }
            if bucket.tokens > 0 {
                bucket.tokens -= 1;
                return;
            }
            let wake = bucket.window_start + self.limit.period;
            debug!(
                wait_ms = wake.saturating_duration_since(now).as_millis() as u64,
                "rate limit reached, waiting for refill"
            );
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Tokens left in the current window.
    pub async fn available(&self) -> u32 {
        let bucket = self.bucket.lock().await;
        if bucket.window_start.elapsed() >= self.limit.period {
            self.limit.calls
        } else {
            bucket.tokens
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// A policy that runs the call once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn delay_for(&self, failed: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 1u32 << failed.saturating_sub(1).min(16);
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }
}

/// Retry policy plus an optional shared rate limiter.
#[derive(Clone)]
pub struct Resilience {
    retry: RetryPolicy,
    limiter: Option<Arc<RateLimiter>>,
}

impl Resilience {
    pub fn new(retry: RetryPolicy, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { retry, limiter }
    }

    /// No throttling, single attempt.
    pub fn passthrough() -> Self {
        Self::new(RetryPolicy::no_retry(), None)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Same retry policy, but a fresh limiter with the same rate.
    pub fn with_independent_limiter(&self) -> Self {
        Self {
            retry: self.retry,
            limiter: self
                .limiter
                .as_ref()
                .map(|l| Arc::new(RateLimiter::new(l.limit()))),
        }
    }

    /// Run `f` under the rate limit, retrying transient failures.
    pub async fn call<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if attempt >= max_attempts {
                        warn!(op, attempts = attempt, error = %e, "giving up after transient failures");
                        return Err(Error::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(e),
                        });
                    }
                    let mut delay = self.retry.delay_for(attempt);
                    if let Some(requested) = e.retry_after() {
                        delay = delay.max(requested);
                    }
                    warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
