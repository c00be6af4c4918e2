//! Admission-control middleware for axum/tower services.
//!
//! For every request the layer derives a key, asks the limiter, and either forwards
//! the request, answers with a rate-limit rejection, or answers with an error:
//!
//! - Reject mode (default): one `allow_n(cost)` decision. Denied requests get the
//!   rejection response (429 with limit and window by default).
//! - Wait mode: `wait` until admitted, bounded by `wait_timeout` and any parent
//!   [`RequestContext`] found in the request extensions. A timeout is an error.
//!
//! Limiter calls that fail for infrastructure reasons are retried by the configured
//! [`RetryPolicy`] before the error response is produced. A denial is never retried.
//! Under [`FailurePolicy::FailOpen`] backend failures let the request through instead.
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use std::time::Duration;
//! use windowgate::{AdmissionLayer, MemoryStore, SlidingWindowLimiter};
//!
//! let layer = AdmissionLayer::builder()
//!     .limiter(SlidingWindowLimiter::new(MemoryStore::new()))
//!     .limit(100)
//!     .window(Duration::from_secs(60))
//!     .build()
//!     .unwrap();
//!
//! let app: Router = Router::new().route("/", get(|| async { "ok" })).layer(layer);
//! ```

mod builder;
pub mod key;
pub mod response;

pub use builder::AdmissionLayerBuilder;
pub use key::{header_key, remote_addr_key, KeyFn, UNKNOWN_KEY};
pub use response::{default_error_response, default_rejection_response, AdmissionError, Rejection};

use crate::context::RequestContext;
use crate::error::{ConfigError, LimiterError};
use crate::limiter::RateLimiter;
use crate::metrics::{Metrics, ADMISSION_OPERATION};
use crate::retry::RetryPolicy;
use crate::settings::AdmissionSettings;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tower_layer::Layer;
use tower_service::Service;

pub(crate) type RejectedHandler = Arc<dyn Fn(&Rejection) -> Response + Send + Sync>;
pub(crate) type ErrorHandler = Arc<dyn Fn(&AdmissionError) -> Response + Send + Sync>;

/// What to do with a request when the limiter backend is failing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Answer with the error response.
    #[default]
    FailClosed,
    /// Let the request through. Context errors (timeouts, cancellation) still fail.
    FailOpen,
}

pub(crate) struct AdmissionConfig {
    pub(crate) limiter: Arc<dyn RateLimiter>,
    pub(crate) key_fn: KeyFn,
    pub(crate) limit: u64,
    pub(crate) window: Duration,
    pub(crate) cost: u64,
    pub(crate) wait_mode: bool,
    pub(crate) wait_timeout: Duration,
    pub(crate) retry: RetryPolicy,
    pub(crate) failure_policy: FailurePolicy,
    pub(crate) rejected_status: StatusCode,
    pub(crate) rejected_message: String,
    pub(crate) error_status: StatusCode,
    pub(crate) error_message: String,
    pub(crate) on_rejected: RejectedHandler,
    pub(crate) on_error: ErrorHandler,
    pub(crate) metrics: Metrics,
}

/// Result of consulting the limiter for one request.
#[derive(Debug)]
enum Admission {
    Admitted,
    Rejected(Rejection),
    Failed(AdmissionError),
}

impl AdmissionConfig {
    async fn admit(&self, parent: &RequestContext, key: &str) -> Admission {
        let result = if self.wait_mode {
            let ctx = parent.with_timeout(self.wait_timeout);
            self.retry
                .execute(&ctx, |attempt| {
                    tracing::trace!(target: "windowgate::admission", key, attempt, "wait");
                    self.limiter.wait(&ctx, key, self.limit, self.window)
                })
                .await
                .map(|()| true)
        } else {
            let ctx = parent.child();
            self.retry
                .execute(&ctx, |attempt| {
                    tracing::trace!(target: "windowgate::admission", key, attempt, "allow_n");
                    self.limiter.allow_n(&ctx, key, self.cost, self.limit, self.window)
                })
                .await
        };

        match result {
            Ok(true) => Admission::Admitted,
            Ok(false) => Admission::Rejected(Rejection {
                key: key.to_string(),
                limit: self.limit,
                window: self.window,
                status: self.rejected_status,
                message: self.rejected_message.clone(),
            }),
            Err(source) => Admission::Failed(AdmissionError {
                key: key.to_string(),
                source,
                status: self.error_status,
                message: self.error_message.clone(),
            }),
        }
    }

    fn fails_open(&self, error: &LimiterError) -> bool {
        self.failure_policy == FailurePolicy::FailOpen && error.is_backend()
    }
}

/// Tower layer enforcing admission control. Cheap to clone.
#[derive(Clone)]
pub struct AdmissionLayer {
    config: Arc<AdmissionConfig>,
}

impl std::fmt::Debug for AdmissionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("limit", &self.config.limit)
            .field("window", &self.config.window)
            .field("cost", &self.config.cost)
            .field("wait_mode", &self.config.wait_mode)
            .field("wait_timeout", &self.config.wait_timeout)
            .field("retry", &self.config.retry)
            .field("failure_policy", &self.config.failure_policy)
            .finish()
    }
}

impl AdmissionLayer {
    pub fn builder() -> AdmissionLayerBuilder {
        AdmissionLayerBuilder::new()
    }

    /// Layer from deserialized settings.
    pub fn from_settings<L>(limiter: L, settings: &AdmissionSettings) -> Result<Self, ConfigError>
    where
        L: RateLimiter + 'static,
    {
        Self::builder().limiter(limiter).settings(settings).build()
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService { inner, config: self.config.clone() }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    config: Arc<AdmissionConfig>,
}

impl<S: std::fmt::Debug> std::fmt::Debug for AdmissionService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService").field("inner", &self.inner).finish()
    }
}

impl<S> Service<Request> for AdmissionService<S>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Response: IntoResponse,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Keep the service that was polled ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let key = (config.key_fn)(&parts);
            let parent = parts.extensions.get::<RequestContext>().cloned().unwrap_or_default();
            let req = Request::from_parts(parts, body);

            let start = Instant::now();
            let admission = config.admit(&parent, &key).await;
            config.metrics.observe_latency(&key, ADMISSION_OPERATION, start.elapsed().as_secs_f64());

            match admission {
                Admission::Admitted => inner.call(req).await.map(IntoResponse::into_response),
                Admission::Rejected(rejection) => {
                    tracing::debug!(target: "windowgate::admission", key = %key, limit = rejection.limit, "request rejected");
                    Ok((config.on_rejected)(&rejection))
                }
                Admission::Failed(failure) if config.fails_open(&failure.source) => {
                    tracing::warn!(target: "windowgate::admission", key = %key, error = %failure.source, "limiter failed, admitting request");
                    inner.call(req).await.map(IntoResponse::into_response)
                }
                Admission::Failed(failure) => {
                    tracing::warn!(target: "windowgate::admission", key = %key, error = %failure.source, "limiter failed, refusing request");
                    Ok((config.on_error)(&failure))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ContextError, Operation, StoreError};
    use crate::limiter::SlidingWindowLimiter;
    use crate::metrics::MemoryMetrics;
    use crate::sleeper::TrackingSleeper;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    const SECOND: Duration = Duration::from_secs(1);

    /// Fails with a backend error for the first `failures` calls, then admits.
    #[derive(Debug, Default)]
    struct FlakyLimiter {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FlakyLimiter {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self { failures, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn next(&self) -> Result<(), LimiterError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(LimiterError::store(Operation::AllowN, "k", StoreError::Connection("refused".into())))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RateLimiter for FlakyLimiter {
        async fn allow_n(
            &self,
            _ctx: &RequestContext,
            _key: &str,
            _n: u64,
            _limit: u64,
            _window: Duration,
        ) -> Result<bool, LimiterError> {
            self.next().map(|()| true)
        }

        async fn wait(
            &self,
            _ctx: &RequestContext,
            _key: &str,
            _limit: u64,
            _window: Duration,
        ) -> Result<(), LimiterError> {
            self.next()
        }

        async fn reset(&self, _ctx: &RequestContext, _key: &str) -> Result<(), LimiterError> {
            Ok(())
        }
    }

    async fn ok(_req: Request) -> Result<Response, Infallible> {
        Ok(StatusCode::OK.into_response())
    }

    fn request() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    async fn status(layer: &AdmissionLayer) -> StatusCode {
        layer.layer(service_fn(ok)).oneshot(request()).await.unwrap().status()
    }

    fn retry(max_attempts: usize, sleeper: TrackingSleeper) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .backoff(crate::Backoff::constant(Duration::from_millis(10)))
            .with_sleeper(sleeper)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn third_request_is_rejected() {
        let layer = AdmissionLayer::builder()
            .limiter(SlidingWindowLimiter::new(MemoryStore::new()))
            .limit(2)
            .window(SECOND)
            .build()
            .unwrap();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            statuses.push(status(&layer).await);
        }
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]);
    }

    #[tokio::test]
    async fn retries_until_backend_recovers() {
        let limiter = FlakyLimiter::new(2);
        let sleeper = TrackingSleeper::new();
        let layer = AdmissionLayer::builder()
            .limiter(limiter.clone())
            .limit(5)
            .window(SECOND)
            .retry_policy(retry(3, sleeper.clone()))
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
        assert_eq!(limiter.calls(), 3);
        assert_eq!(sleeper.count(), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_produce_error_response() {
        let limiter = FlakyLimiter::new(10);
        let layer = AdmissionLayer::builder()
            .limiter(limiter.clone())
            .limit(5)
            .window(SECOND)
            .retry_policy(retry(3, TrackingSleeper::new()))
            .error_status(503)
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(limiter.calls(), 3);
    }

    #[tokio::test]
    async fn wait_mode_retries_until_backend_recovers() {
        let limiter = FlakyLimiter::new(2);
        let sleeper = TrackingSleeper::new();
        let layer = AdmissionLayer::builder()
            .limiter(limiter.clone())
            .limit(5)
            .window(SECOND)
            .wait_mode(true)
            .wait_timeout(SECOND)
            .retry_policy(retry(3, sleeper.clone()))
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
        assert_eq!(limiter.calls(), 3);
        assert_eq!(sleeper.count(), 2);
    }

    #[tokio::test]
    async fn wait_mode_exhausted_retries_produce_error_response() {
        let limiter = FlakyLimiter::new(10);
        let layer = AdmissionLayer::builder()
            .limiter(limiter.clone())
            .limit(5)
            .window(SECOND)
            .wait_mode(true)
            .wait_timeout(SECOND)
            .retry_policy(retry(3, TrackingSleeper::new()))
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(limiter.calls(), 3);
    }

    #[tokio::test]
    async fn fail_open_survives_settings_without_failure_policy() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Connection("refused".into()));
        let settings = AdmissionSettings::from_json(r#"{"limit": 5, "window_ms": 1000}"#).unwrap();
        let layer = AdmissionLayer::builder()
            .limiter(SlidingWindowLimiter::new(store))
            .failure_policy(FailurePolicy::FailOpen)
            .settings(&settings)
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
    }

    #[tokio::test]
    async fn denial_is_not_retried() {
        let limiter = Arc::new(SlidingWindowLimiter::new(MemoryStore::new()));
        let hook = MemoryMetrics::new();
        let layer = AdmissionLayer::builder()
            .limiter(limiter)
            .limit(1)
            .window(SECOND)
            .key_fn(|_| "shared".to_string())
            .retry_policy(retry(5, TrackingSleeper::new()))
            .metrics(Metrics::new(hook.clone()))
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
        assert_eq!(status(&layer).await, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(hook.latency_operations("shared"), vec![ADMISSION_OPERATION; 2]);
    }

    #[tokio::test]
    async fn fail_open_forwards_on_backend_error() {
        let layer = AdmissionLayer::builder()
            .limiter(FlakyLimiter::new(1))
            .limit(5)
            .window(SECOND)
            .failure_policy(FailurePolicy::FailOpen)
            .build()
            .unwrap();
        assert_eq!(status(&layer).await, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_mode_admits_after_capacity_frees() {
        let limiter = Arc::new(SlidingWindowLimiter::new(MemoryStore::new()));
        let layer = AdmissionLayer::builder()
            .limiter(limiter.clone())
            .limit(1)
            .window(SECOND * 60)
            .key_fn(|_| "w".to_string())
            .wait_mode(true)
            .wait_timeout(SECOND)
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
        let resetter = limiter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            resetter.reset(&RequestContext::background(), "w").await.unwrap();
        });
        assert_eq!(status(&layer).await, StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_mode_timeout_is_an_error_even_when_failing_open() {
        let layer = AdmissionLayer::builder()
            .limiter(SlidingWindowLimiter::new(MemoryStore::new()))
            .limit(1)
            .window(SECOND * 60)
            .key_fn(|_| "w".to_string())
            .wait_mode(true)
            .wait_timeout(Duration::from_millis(300))
            .failure_policy(FailurePolicy::FailOpen)
            .on_error(|e| {
                assert_eq!(e.source, LimiterError::Context(ContextError::DeadlineExceeded));
                StatusCode::GATEWAY_TIMEOUT.into_response()
            })
            .build()
            .unwrap();

        assert_eq!(status(&layer).await, StatusCode::OK);
        assert_eq!(status(&layer).await, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn parent_context_in_extensions_is_honored() {
        let layer = AdmissionLayer::builder()
            .limiter(SlidingWindowLimiter::new(MemoryStore::new()))
            .limit(5)
            .window(SECOND)
            .build()
            .unwrap();

        let parent = RequestContext::background();
        parent.cancel();
        let mut req = request();
        req.extensions_mut().insert(parent);

        let response = layer.layer(service_fn(ok)).oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn custom_rejection_hook_sees_limit_and_window() {
        let layer = AdmissionLayer::builder()
            .limiter(SlidingWindowLimiter::new(MemoryStore::new()))
            .limit(1)
            .window(Duration::from_secs(30))
            .cost(2)
            .on_rejected(|r| {
                assert_eq!((r.limit, r.window), (1, Duration::from_secs(30)));
                (StatusCode::PAYMENT_REQUIRED, "upgrade").into_response()
            })
            .build()
            .unwrap();
        assert_eq!(status(&layer).await, StatusCode::PAYMENT_REQUIRED);
    }
}
