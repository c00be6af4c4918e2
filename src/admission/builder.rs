use super::key::{remote_addr_key, KeyFn};
use super::response::{
    default_error_response, default_rejection_response, AdmissionError, Rejection,
};
use super::{AdmissionConfig, AdmissionLayer, ErrorHandler, FailurePolicy, RejectedHandler};
use crate::error::ConfigError;
use crate::jitter::Jitter;
use crate::limiter::RateLimiter;
use crate::metrics::Metrics;
use crate::retry::{RetryPolicy, RetryStrategy};
use crate::settings::AdmissionSettings;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`AdmissionLayer`]. Every setting is validated by [`build`](Self::build).
pub struct AdmissionLayerBuilder {
    limiter: Option<Arc<dyn RateLimiter>>,
    key_fn: KeyFn,
    limit: u64,
    window: Duration,
    cost: u64,
    wait_mode: bool,
    wait_timeout: Option<Duration>,
    retry_strategy: Option<RetryStrategy>,
    retry_jitter: Jitter,
    retry_policy: Option<RetryPolicy>,
    failure_policy: FailurePolicy,
    rejected_status: u16,
    rejected_message: String,
    error_status: u16,
    error_message: String,
    on_rejected: RejectedHandler,
    on_error: ErrorHandler,
    metrics: Metrics,
}

impl Default for AdmissionLayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AdmissionLayerBuilder {
    pub fn new() -> Self {
        Self {
            limiter: None,
            key_fn: Arc::new(remote_addr_key),
            limit: 0,
            window: Duration::ZERO,
            cost: 1,
            wait_mode: false,
            wait_timeout: None,
            retry_strategy: None,
            retry_jitter: Jitter::None,
            retry_policy: None,
            failure_policy: FailurePolicy::FailClosed,
            rejected_status: StatusCode::TOO_MANY_REQUESTS.as_u16(),
            rejected_message: "rate limit exceeded".to_string(),
            error_status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            error_message: "internal server error".to_string(),
            on_rejected: Arc::new(default_rejection_response),
            on_error: Arc::new(default_error_response),
            metrics: Metrics::noop(),
        }
    }

    /// Limiter consulted for every request. Required.
    pub fn limiter<L>(mut self, limiter: L) -> Self
    where
        L: RateLimiter + 'static,
    {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    pub fn limiter_arc(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Key derivation. Defaults to the caller's IP address.
    pub fn key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> String + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = limit;
        self
    }

    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Events charged per request in reject mode. Defaults to 1.
    pub fn cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Block until capacity frees (bounded by `wait_timeout`) instead of rejecting.
    pub fn wait_mode(mut self, enabled: bool) -> Self {
        self.wait_mode = enabled;
        self
    }

    pub fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Retry limiter calls that fail with backend errors.
    pub fn retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    /// Jitter applied to retry delays from [`retry`](Self::retry).
    pub fn retry_jitter(mut self, jitter: Jitter) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Fully built retry policy; takes precedence over [`retry`](Self::retry).
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn rejected_status(mut self, status: u16) -> Self {
        self.rejected_status = status;
        self
    }

    pub fn rejected_message(mut self, message: impl Into<String>) -> Self {
        self.rejected_message = message.into();
        self
    }

    pub fn error_status(mut self, status: u16) -> Self {
        self.error_status = status;
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Replace the default 429 JSON response.
    pub fn on_rejected<F>(mut self, f: F) -> Self
    where
        F: Fn(&Rejection) -> Response + Send + Sync + 'static,
    {
        self.on_rejected = Arc::new(f);
        self
    }

    /// Replace the default 500 JSON response.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&AdmissionError) -> Response + Send + Sync + 'static,
    {
        self.on_error = Arc::new(f);
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Apply deserialized settings. `limit` and `window` always replace the current
    /// values; optional fields absent from `settings` keep theirs.
    pub fn settings(mut self, settings: &AdmissionSettings) -> Self {
        self.limit = settings.limit;
        self.window = settings.window();
        if let Some(wait_mode) = settings.wait_mode {
            self.wait_mode = wait_mode;
        }
        if let Some(timeout) = settings.wait_timeout() {
            self.wait_timeout = Some(timeout);
        }
        if let Some(cost) = settings.cost {
            self.cost = cost;
        }
        if let Some(retry) = &settings.retry {
            self.retry_strategy = Some(retry.strategy());
            self.retry_jitter = retry.jitter;
        }
        if let Some(policy) = settings.failure_policy {
            self.failure_policy = policy;
        }
        if let Some(status) = settings.rejected_status {
            self.rejected_status = status;
        }
        if let Some(message) = &settings.rejected_message {
            self.rejected_message = message.clone();
        }
        if let Some(status) = settings.error_status {
            self.error_status = status;
        }
        if let Some(message) = &settings.error_message {
            self.error_message = message.clone();
        }
        self
    }

    pub fn build(self) -> Result<AdmissionLayer, ConfigError> {
        let limiter = self.limiter.ok_or(ConfigError::MissingLimiter)?;
        if self.limit == 0 {
            return Err(ConfigError::ZeroLimit);
        }
        if self.window.as_millis() == 0 {
            return Err(ConfigError::ZeroWindow);
        }
        if self.cost == 0 {
            return Err(ConfigError::ZeroCost);
        }
        let wait_timeout = match (self.wait_mode, self.wait_timeout) {
            (true, Some(timeout)) if !timeout.is_zero() => timeout,
            (true, _) => return Err(ConfigError::MissingWaitTimeout),
            (false, timeout) => timeout.unwrap_or_default(),
        };
        let rejected_status = status(self.rejected_status)?;
        let error_status = status(self.error_status)?;

        let retry = match (self.retry_policy, self.retry_strategy) {
            (Some(policy), _) => policy,
            (None, Some(strategy)) => RetryPolicy::builder()
                .strategy(&strategy)
                .with_jitter(self.retry_jitter)
                .build()?,
            (None, None) => RetryPolicy::none(),
        };

        Ok(AdmissionLayer {
            config: Arc::new(AdmissionConfig {
                limiter,
                key_fn: self.key_fn,
                limit: self.limit,
                window: self.window,
                cost: self.cost,
                wait_mode: self.wait_mode,
                wait_timeout,
                retry,
                failure_policy: self.failure_policy,
                rejected_status,
                rejected_message: self.rejected_message,
                error_status,
                error_message: self.error_message,
                on_rejected: self.on_rejected,
                on_error: self.on_error,
                metrics: self.metrics,
            }),
        })
    }
}

fn status(code: u16) -> Result<StatusCode, ConfigError> {
    StatusCode::from_u16(code).map_err(|_| ConfigError::InvalidStatus(code))
}
