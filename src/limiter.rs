//! Sliding-window rate limiter over a shared [`Store`].
//!
//! All quota state lives in the backend. Each `allow_n` call is exactly one atomic
//! script invocation against the key pair `[key, key + ":counter"]` (see
//! [`script`]); the limiter never caches counts in process and never retries a
//! failed backend call itself.
//!
//! - [`RateLimiter::allow`] / [`RateLimiter::allow_n`]: one decision, `Ok(false)` when denied.
//! - [`RateLimiter::wait`]: poll `allow` every poll interval (100ms by default) until
//!   admitted, an error occurs, or the context finishes.
//! - [`RateLimiter::reset`]: delete both keys.
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{MemoryStore, RateLimiter, RequestContext, SlidingWindowLimiter};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let limiter = SlidingWindowLimiter::new(MemoryStore::new());
//! let ctx = RequestContext::background();
//! let window = Duration::from_secs(1);
//!
//! assert!(limiter.allow(&ctx, "user:1", 2, window).await.unwrap());
//! assert!(limiter.allow(&ctx, "user:1", 2, window).await.unwrap());
//! assert!(!limiter.allow(&ctx, "user:1", 2, window).await.unwrap());
//! # });
//! ```

pub mod script;

use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::{ConfigError, LimiterError, Operation};
use crate::metrics::{ActiveLimiterGuard, Metrics};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{ScriptArg, ScriptValue, Store};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Delay between `wait` polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Kind label reported through `set_active_limiters`.
pub const SLIDING_WINDOW_KIND: &str = "sliding_window";

/// Admission decisions for a logical key.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Same as `allow_n(ctx, key, 1, limit, window)`.
    async fn allow(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        self.allow_n(ctx, key, 1, limit, window).await
    }

    /// Try to admit `n` events for `key`. Denial is `Ok(false)`.
    async fn allow_n(
        &self,
        ctx: &RequestContext,
        key: &str,
        n: u64,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError>;

    /// Block until one event is admitted for `key`, or fail with the error that
    /// stopped the wait.
    async fn wait(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(), LimiterError>;

    /// Forget all quota state for `key`. Succeeds on keys with no state.
    async fn reset(&self, ctx: &RequestContext, key: &str) -> Result<(), LimiterError>;
}

#[async_trait]
impl<L> RateLimiter for Arc<L>
where
    L: RateLimiter + ?Sized,
{
    async fn allow(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        (**self).allow(ctx, key, limit, window).await
    }

    async fn allow_n(
        &self,
        ctx: &RequestContext,
        key: &str,
        n: u64,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        (**self).allow_n(ctx, key, n, limit, window).await
    }

    async fn wait(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(), LimiterError> {
        (**self).wait(ctx, key, limit, window).await
    }

    async fn reset(&self, ctx: &RequestContext, key: &str) -> Result<(), LimiterError> {
        (**self).reset(ctx, key).await
    }
}

/// The sliding-window limiter.
pub struct SlidingWindowLimiter<S> {
    store: S,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Metrics,
    poll_interval: Duration,
    _active: ActiveLimiterGuard,
}

impl<S> std::fmt::Debug for SlidingWindowLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("clock", &self.clock)
            .field("sleeper", &self.sleeper)
            .field("metrics", &self.metrics)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl<S> SlidingWindowLimiter<S>
where
    S: Store,
{
    /// Limiter with the system clock, the tokio timer and no metrics.
    pub fn new(store: S) -> Self {
        Self::from_parts(store, Arc::new(SystemClock), Arc::new(TokioSleeper), Metrics::noop(), DEFAULT_POLL_INTERVAL)
    }

    pub fn builder(store: S) -> SlidingWindowLimiterBuilder<S> {
        SlidingWindowLimiterBuilder::new(store)
    }

    fn from_parts(
        store: S,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        metrics: Metrics,
        poll_interval: Duration,
    ) -> Self {
        let active = metrics.limiter_started(SLIDING_WINDOW_KIND);
        Self { store, clock, sleeper, metrics, poll_interval, _active: active }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn eval_window(
        &self,
        ctx: &RequestContext,
        key: &str,
        n: u64,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        if n == 0 {
            return Err(LimiterError::InvalidArgument("n must be at least 1".into()));
        }
        let window_ms = window.as_millis();
        if window_ms == 0 {
            return Err(LimiterError::InvalidArgument(format!(
                "window must be at least 1ms (got {:?})",
                window
            )));
        }
        ctx.check()?;

        let args = [
            ScriptArg::from(self.clock.now_millis()),
            ScriptArg::from(u64::try_from(window_ms).unwrap_or(u64::MAX)),
            ScriptArg::from(limit),
            ScriptArg::from(n),
        ];
        let reply = self
            .store
            .eval(ctx, &script::SLIDING_WINDOW, &script::script_keys(key), &args)
            .await
            .map_err(|e| LimiterError::store(Operation::AllowN, key, e))?;

        match reply {
            ScriptValue::Int(result) => Ok(result == 1),
            other => Err(LimiterError::UnexpectedReply {
                op: Operation::AllowN,
                key: key.to_string(),
                reply: other.to_string(),
            }),
        }
    }
}

#[async_trait]
impl<S> RateLimiter for SlidingWindowLimiter<S>
where
    S: Store,
{
    async fn allow_n(
        &self,
        ctx: &RequestContext,
        key: &str,
        n: u64,
        limit: u64,
        window: Duration,
    ) -> Result<bool, LimiterError> {
        let start = Instant::now();
        let result = self.eval_window(ctx, key, n, limit, window).await;
        self.metrics.observe_latency(key, Operation::AllowN.as_str(), start.elapsed().as_secs_f64());

        match &result {
            Ok(allowed) => {
                self.metrics.observe_request(key, *allowed);
                if *allowed {
                    tracing::trace!(target: "windowgate::limiter", key, n, limit, "admitted");
                } else {
                    tracing::debug!(target: "windowgate::limiter", key, n, limit, "denied");
                }
            }
            Err(e) if e.is_backend() => {
                tracing::warn!(target: "windowgate::limiter", key, error = %e, "allow_n failed");
            }
            Err(e) => {
                tracing::debug!(target: "windowgate::limiter", key, error = %e, "allow_n aborted");
            }
        }
        result
    }

    async fn wait(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<(), LimiterError> {
        let start = Instant::now();
        let gauge = WaitingGauge { metrics: &self.metrics, key };
        let mut cycles: u64 = 0;

        let result = loop {
            if let Err(e) = ctx.check() {
                break Err(LimiterError::from(e));
            }
            cycles += 1;
            gauge.set(cycles);

            match self.allow(ctx, key, limit, window).await {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }

            tracing::trace!(target: "windowgate::limiter", key, cycles, "waiting for capacity");
            if let Err(e) = ctx.sleep(self.sleeper.as_ref(), self.poll_interval).await {
                break Err(LimiterError::from(e));
            }
        };

        drop(gauge);
        self.metrics.observe_latency(key, Operation::Wait.as_str(), start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::debug!(target: "windowgate::limiter", key, cycles, error = %e, "wait ended without admission");
        }
        result
    }

    async fn reset(&self, ctx: &RequestContext, key: &str) -> Result<(), LimiterError> {
        let start = Instant::now();
        ctx.check()?;
        let result = self
            .store
            .del(ctx, &script::script_keys(key))
            .await
            .map_err(|e| LimiterError::store(Operation::Reset, key, e));
        self.metrics.observe_latency(key, Operation::Reset.as_str(), start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::warn!(target: "windowgate::limiter", key, error = %e, "reset failed");
        }
        result
    }
}

/// Reports the waiting-queue depth for one `wait` call and clears it on exit.
struct WaitingGauge<'a> {
    metrics: &'a Metrics,
    key: &'a str,
}

impl WaitingGauge<'_> {
    fn set(&self, cycles: u64) {
        self.metrics.set_waiting_queue_size(self.key, cycles as f64);
    }
}

impl Drop for WaitingGauge<'_> {
    fn drop(&mut self) {
        self.metrics.set_waiting_queue_size(self.key, 0.0);
    }
}

/// Builder for [`SlidingWindowLimiter`].
pub struct SlidingWindowLimiterBuilder<S> {
    store: S,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    metrics: Metrics,
    poll_interval: Duration,
}

impl<S> SlidingWindowLimiterBuilder<S>
where
    S: Store,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
            metrics: Metrics::noop(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Time source for event scores. All processes sharing a backend need the same base.
    pub fn clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Sleeper used between `wait` polls.
    pub fn sleeper<T>(mut self, sleeper: T) -> Self
    where
        T: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Delay between `wait` polls. Must be > 0.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> Result<SlidingWindowLimiter<S>, ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        Ok(SlidingWindowLimiter::from_parts(
            self.store,
            self.clock,
            self.sleeper,
            self.metrics,
            self.poll_interval,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{ContextError, StoreError};
    use crate::metrics::MemoryMetrics;
    use crate::sleeper::TrackingSleeper;
    use crate::store::MemoryStore;

    const SECOND: Duration = Duration::from_secs(1);

    fn limiter_at(clock: &ManualClock) -> SlidingWindowLimiter<MemoryStore> {
        SlidingWindowLimiter::builder(MemoryStore::with_clock(clock.clone()))
            .clock(clock.clone())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn allow_admits_up_to_limit() {
        let limiter = SlidingWindowLimiter::new(MemoryStore::new());
        let ctx = RequestContext::background();
        let mut results = Vec::new();
        for _ in 0..3 {
            results.push(limiter.allow(&ctx, "user:1", 2, SECOND).await.unwrap());
        }
        assert_eq!(results, vec![true, true, false]);
    }

    #[tokio::test]
    async fn denied_allow_n_leaves_headroom_intact() {
        let clock = ManualClock::new(1_000_000);
        let limiter = limiter_at(&clock);
        let ctx = RequestContext::background();

        assert!(limiter.allow_n(&ctx, "k", 3, 5, SECOND).await.unwrap());
        assert!(!limiter.allow_n(&ctx, "k", 3, 5, SECOND).await.unwrap());
        assert_eq!(limiter.store().int_value("k:counter"), Some(3));
        assert!(limiter.allow_n(&ctx, "k", 2, 5, SECOND).await.unwrap());
        assert!(!limiter.allow(&ctx, "k", 5, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn n_larger_than_limit_is_denied() {
        let limiter = SlidingWindowLimiter::new(MemoryStore::new());
        let ctx = RequestContext::background();
        assert!(!limiter.allow_n(&ctx, "k", 11, 10, SECOND).await.unwrap());
        assert!(limiter.allow_n(&ctx, "k", 10, 10, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected_before_the_store() {
        let limiter = SlidingWindowLimiter::new(MemoryStore::new());
        let ctx = RequestContext::background();
        assert!(matches!(
            limiter.allow_n(&ctx, "k", 0, 10, SECOND).await,
            Err(LimiterError::InvalidArgument(_))
        ));
        assert!(matches!(
            limiter.allow(&ctx, "k", 10, Duration::from_micros(10)).await,
            Err(LimiterError::InvalidArgument(_))
        ));
        assert!(!limiter.store().contains_key("k:counter"));
    }

    #[tokio::test]
    async fn backend_error_is_not_a_denial() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Connection("refused".into()));
        let limiter = SlidingWindowLimiter::new(store);
        let err = limiter.allow(&RequestContext::background(), "k", 10, SECOND).await.unwrap_err();
        assert!(err.is_backend());
        assert!(matches!(err, LimiterError::Store { op: Operation::AllowN, .. }));
    }

    #[tokio::test]
    async fn non_integer_reply_is_unexpected() {
        fn nil(
            _: &mut crate::store::Keyspace,
            _: &[String],
            _: &[ScriptArg],
        ) -> Result<ScriptValue, StoreError> {
            Ok(ScriptValue::Nil)
        }
        let store = MemoryStore::new().with_script(&script::SLIDING_WINDOW, nil);
        let limiter = SlidingWindowLimiter::new(store);
        let err = limiter.allow(&RequestContext::background(), "k", 10, SECOND).await.unwrap_err();
        assert!(matches!(err, LimiterError::UnexpectedReply { .. }));
    }

    #[tokio::test]
    async fn cancelled_context_fails_allow() {
        let limiter = SlidingWindowLimiter::new(MemoryStore::new());
        let ctx = RequestContext::background();
        ctx.cancel();
        let err = limiter.allow(&ctx, "k", 10, SECOND).await.unwrap_err();
        assert_eq!(err, LimiterError::Context(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn reset_is_idempotent_and_restores_quota() {
        let limiter = SlidingWindowLimiter::new(MemoryStore::new());
        let ctx = RequestContext::background();

        limiter.reset(&ctx, "fresh").await.unwrap();

        assert!(limiter.allow_n(&ctx, "k", 4, 4, SECOND).await.unwrap());
        assert!(!limiter.allow(&ctx, "k", 4, SECOND).await.unwrap());
        limiter.reset(&ctx, "k").await.unwrap();
        assert!(!limiter.store().contains_key("k"));
        assert!(!limiter.store().contains_key("k:counter"));
        assert!(limiter.allow_n(&ctx, "k", 4, 4, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn reset_failure_names_operation() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Connection("gone".into()));
        let limiter = SlidingWindowLimiter::new(store);
        let err = limiter.reset(&RequestContext::background(), "k").await.unwrap_err();
        assert!(matches!(err, LimiterError::Store { op: Operation::Reset, .. }));
    }

    #[tokio::test]
    async fn quota_returns_after_ttl_expiry() {
        let clock = ManualClock::new(5_000);
        let limiter = limiter_at(&clock);
        let ctx = RequestContext::background();

        assert!(limiter.allow(&ctx, "k", 1, SECOND).await.unwrap());
        clock.advance(SECOND);
        assert!(!limiter.allow(&ctx, "k", 1, SECOND).await.unwrap());
        clock.advance(SECOND);
        assert!(limiter.allow(&ctx, "k", 1, SECOND).await.unwrap());
    }

    #[tokio::test]
    async fn counter_does_not_decay_while_traffic_refreshes_ttl() {
        let clock = ManualClock::new(0);
        let limiter = limiter_at(&clock);
        let ctx = RequestContext::background();

        assert!(limiter.allow(&ctx, "k", 2, SECOND).await.unwrap());
        clock.advance(Duration::from_millis(1_500));
        assert!(limiter.allow(&ctx, "k", 2, SECOND).await.unwrap());
        clock.advance(Duration::from_millis(1_500));
        // The first event left the window long ago, but the counter still holds 2.
        assert!(!limiter.allow(&ctx, "k", 2, SECOND).await.unwrap());
        assert_eq!(limiter.store().set_len("k"), 0);
    }

    #[tokio::test]
    async fn metrics_see_decisions_and_latency() {
        let hook = MemoryMetrics::new();
        let limiter = SlidingWindowLimiter::builder(MemoryStore::new())
            .metrics(Metrics::new(hook.clone()))
            .build()
            .unwrap();
        let ctx = RequestContext::background();

        limiter.allow(&ctx, "m", 1, SECOND).await.unwrap();
        limiter.allow(&ctx, "m", 1, SECOND).await.unwrap();
        limiter.reset(&ctx, "m").await.unwrap();

        assert_eq!(hook.requests("m"), (1, 1));
        assert_eq!(hook.latency_operations("m"), vec!["allow_n", "allow_n", "reset"]);
        assert_eq!(hook.active_limiters(SLIDING_WINDOW_KIND), Some(1.0));
        drop(limiter);
        assert_eq!(hook.active_limiters(SLIDING_WINDOW_KIND), Some(0.0));
    }

    #[tokio::test]
    async fn wait_returns_once_capacity_frees() {
        let clock = ManualClock::new(0);
        let store = MemoryStore::with_clock(clock.clone());
        let hook = MemoryMetrics::new();
        let sleeper = TrackingSleeper::new();
        let limiter = SlidingWindowLimiter::builder(store)
            .clock(clock.clone())
            .sleeper(sleeper.clone())
            .metrics(Metrics::new(hook.clone()))
            .build()
            .unwrap();
        let ctx = RequestContext::background();

        assert!(limiter.allow(&ctx, "w", 1, SECOND).await.unwrap());
        // TTL is 2s; jump past it so the first poll already finds free capacity.
        clock.advance(Duration::from_secs(2));
        limiter.wait(&ctx, "w", 1, SECOND).await.unwrap();

        assert_eq!(sleeper.count(), 0);
        assert_eq!(hook.waiting_sizes("w"), vec![1.0, 0.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_polls_until_reset_then_admits() {
        let limiter = Arc::new(SlidingWindowLimiter::new(MemoryStore::new()));
        let ctx = RequestContext::background();
        assert!(limiter.allow(&ctx, "w", 1, SECOND * 60).await.unwrap());

        let resetter = limiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            resetter.reset(&RequestContext::background(), "w").await.unwrap();
        });

        let start = tokio::time::Instant::now();
        limiter.wait(&ctx, "w", 1, SECOND * 60).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(350));
        assert!(waited <= Duration::from_millis(350) + DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_with_deadline_exceeded() {
        let hook = MemoryMetrics::new();
        let limiter = SlidingWindowLimiter::builder(MemoryStore::new())
            .metrics(Metrics::new(hook.clone()))
            .build()
            .unwrap();
        let bg = RequestContext::background();
        assert!(limiter.allow(&bg, "w", 1, SECOND * 60).await.unwrap());

        let ctx = bg.with_timeout(Duration::from_millis(250));
        let err = limiter.wait(&ctx, "w", 1, SECOND * 60).await.unwrap_err();
        assert_eq!(err, LimiterError::Context(ContextError::DeadlineExceeded));

        assert_eq!(hook.waiting_sizes("w"), vec![1.0, 2.0, 3.0, 0.0]);
        assert_eq!(hook.latency_operations("w").last().map(String::as_str), Some("wait"));
    }

    #[tokio::test]
    async fn wait_on_cancelled_context_never_touches_store() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Connection("should not be reached".into()));
        let limiter = SlidingWindowLimiter::new(store);
        let ctx = RequestContext::background();
        ctx.cancel();
        let err = limiter.wait(&ctx, "w", 1, SECOND).await.unwrap_err();
        assert_eq!(err, LimiterError::Context(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn wait_propagates_backend_error_immediately() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Connection("refused".into()));
        let sleeper = TrackingSleeper::new();
        let limiter = SlidingWindowLimiter::builder(store).sleeper(sleeper.clone()).build().unwrap();
        let err = limiter.wait(&RequestContext::background(), "w", 1, SECOND).await.unwrap_err();
        assert!(err.is_backend());
        assert_eq!(sleeper.count(), 0);
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let err = SlidingWindowLimiter::builder(MemoryStore::new())
            .poll_interval(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ZeroPollInterval);
    }
}
