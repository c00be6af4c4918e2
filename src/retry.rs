//! Retry of limiter calls that failed for infrastructure reasons.
//!
//! This is the admission layer's retry loop. It is unrelated to the limiter's own
//! `wait` polling: `wait` repeats because the quota is exhausted, this loop repeats
//! because the backend call itself failed.
//!
//! Semantics:
//! - `max_attempts` counts total calls (initial try + retries).
//! - Only errors with [`LimiterError::is_retryable`] are retried. A denial is a
//!   successful call and is never retried; context and argument errors return at once.
//! - The delay before retry `k` is `backoff.delay(k)` with jitter applied.
//! - Every sleep races the request context; a context that finishes mid-sleep ends
//!   the loop with the context's error.
//! - Exhausting all attempts returns the last error.
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{InstantSleeper, RequestContext, RetryPolicy, RetryStrategy};
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let strategy = RetryStrategy {
//!     max_attempts: 3,
//!     retry_interval: Duration::from_millis(50),
//!     use_exponential_backoff: true,
//!     max_retry_interval: Duration::from_millis(200),
//! };
//! let policy = RetryPolicy::builder()
//!     .strategy(&strategy)
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//!
//! let ctx = RequestContext::background();
//! let out = policy.execute(&ctx, |attempt| async move { Ok(attempt) }).await;
//! assert_eq!(out.unwrap(), 1);
//! # });
//! ```

use crate::backoff::Backoff;
use crate::context::RequestContext;
use crate::error::{ConfigError, LimiterError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Plain retry configuration for the admission layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStrategy {
    /// Total limiter calls per request, including the first. Must be > 0.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub retry_interval: Duration,
    /// Double the delay on every further retry.
    pub use_exponential_backoff: bool,
    /// Cap for the exponential delay. Zero means uncapped.
    pub max_retry_interval: Duration,
}

impl RetryStrategy {
    /// The backoff schedule this strategy describes.
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        if !self.use_exponential_backoff {
            return Ok(Backoff::constant(self.retry_interval));
        }
        let backoff = Backoff::exponential(self.retry_interval);
        if self.max_retry_interval.is_zero() {
            Ok(backoff)
        } else {
            Ok(backoff.with_max(self.max_retry_interval)?)
        }
    }
}

/// Retry policy combining attempt bound, backoff, jitter, and sleeper.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("sleeper", &self.sleeper)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::constant(Duration::ZERO),
            jitter: Jitter::None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Policy for `strategy` with the tokio timer and no jitter.
    pub fn from_strategy(strategy: &RetryStrategy) -> Result<Self, ConfigError> {
        Self::builder().strategy(strategy).build()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, attempts
    /// run out, or `ctx` finishes during a backoff sleep.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn execute<T, Fut, Op>(&self, ctx: &RequestContext, mut operation: Op) -> Result<T, LimiterError>
    where
        Fut: Future<Output = Result<T, LimiterError>>,
        Op: FnMut(usize) -> Fut,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            if attempt >= self.max_attempts {
                if self.max_attempts > 1 {
                    tracing::warn!(
                        target: "windowgate::retry",
                        attempts = attempt,
                        error = %err,
                        "retries exhausted"
                    );
                }
                return Err(err);
            }

            let delay = self.jitter.apply(self.backoff.delay(attempt));
            tracing::debug!(
                target: "windowgate::retry",
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying limiter call"
            );
            ctx.sleep(self.sleeper.as_ref(), delay).await?;
        }
    }
}

/// Builder for [`RetryPolicy`].
pub struct RetryPolicyBuilder {
    max_attempts: usize,
    backoff: Result<Backoff, ConfigError>,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicyBuilder {
    /// Three attempts, 100ms constant backoff, no jitter.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Ok(Backoff::constant(Duration::from_millis(100))),
            jitter: Jitter::None,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Ok(backoff);
        self
    }

    /// Take attempts and backoff from a [`RetryStrategy`]. Invalid caps surface at `build()`.
    pub fn strategy(mut self, strategy: &RetryStrategy) -> Self {
        self.max_attempts = strategy.max_attempts;
        self.backoff = strategy.backoff();
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts(0));
        }
        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff?,
            jitter: self.jitter,
            sleeper: self.sleeper,
        })
    }
}
