#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # windowgate
//!
//! Distributed sliding-window admission control. Many processes share one quota per
//! key by talking to the same key-value backend, and every decision is a single atomic
//! server-side script, so there is no check-then-act race and no distributed lock.
//!
//! ## Pieces
//!
//! - [`Store`]: the two-call backend surface (run a script atomically, delete keys).
//!   [`MemoryStore`] is in-process; `windowgate-redis` talks to Redis.
//! - [`SlidingWindowLimiter`]: `allow`, `allow_n`, `wait`, `reset`.
//! - [`AdmissionLayer`]: tower/axum middleware with key derivation, reject or wait
//!   mode, a bounded retry loop for backend failures, and a failure policy.
//! - [`Metrics`]: injected observation hook (`windowgate-prometheus` exports to Prometheus).
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{MemoryStore, RateLimiter, RequestContext, SlidingWindowLimiter};
//!
//! #[tokio::main]
//! async fn main() {
//!     let limiter = SlidingWindowLimiter::new(MemoryStore::new());
//!     let ctx = RequestContext::background();
//!
//!     let allowed = limiter.allow(&ctx, "user:123", 10, Duration::from_secs(1)).await;
//!     assert_eq!(allowed, Ok(true));
//! }
//! ```

pub mod admission;
pub mod backoff;
pub mod clock;
pub mod context;
pub mod error;
pub mod jitter;
pub mod limiter;
pub mod metrics;
pub mod retry;
pub mod settings;
pub mod sleeper;
pub mod store;

// Re-exports
pub use admission::{AdmissionError, AdmissionLayer, AdmissionLayerBuilder, AdmissionService, FailurePolicy, Rejection};
pub use backoff::{Backoff, BackoffError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use context::RequestContext;
pub use error::{ConfigError, ContextError, LimiterError, Operation, StoreError};
pub use jitter::Jitter;
pub use limiter::{RateLimiter, SlidingWindowLimiter, SlidingWindowLimiterBuilder, DEFAULT_POLL_INTERVAL};
pub use metrics::{LogMetrics, MemoryMetrics, MetricEvent, Metrics, MetricsHook, NullMetrics};
pub use retry::{RetryPolicy, RetryPolicyBuilder, RetryStrategy};
pub use settings::{AdmissionSettings, RetrySettings};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{MemoryStore, Script, ScriptArg, ScriptValue, Store};
