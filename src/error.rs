//! Error types for stores, limiters and admission configuration.
//!
//! The taxonomy keeps three things apart that callers must never conflate:
//! - a backend/transport failure ([`StoreError`], wrapped in [`LimiterError::Store`]),
//! - a cancelled or expired request context ([`ContextError`]),
//! - a quota denial, which is not an error at all (`Ok(false)` from `allow`).
use std::fmt;
use thiserror::Error;

/// Why a [`RequestContext`](crate::RequestContext) stopped an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    /// The context (or one of its parents) was cancelled explicitly.
    #[error("context cancelled")]
    Cancelled,
    /// The context deadline passed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Failure reported by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The backend could not be reached or the connection broke mid-call.
    #[error("connection error: {0}")]
    Connection(String),
    /// The script failed while executing on the backend.
    #[error("script error: {0}")]
    Script(String),
    /// The backend has no script registered under this name.
    #[error("unknown script `{0}`")]
    UnknownScript(String),
    /// An operation hit a key holding a value of the wrong type.
    #[error("WRONGTYPE operation against key `{key}` holding the wrong kind of value")]
    WrongType { key: String },
    /// The call was abandoned because the request context ended.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// Anything else the backend reported.
    #[error("{0}")]
    Other(String),
}

/// Limiter operation names, used in error context and latency observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AllowN,
    Wait,
    Reset,
}

impl Operation {
    /// Stable label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::AllowN => "allow_n",
            Operation::Wait => "wait",
            Operation::Reset => "reset",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by limiter operations.
///
/// A denied request is `Ok(false)`, never an `Err`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    /// The backend call failed.
    #[error("{op} failed for key `{key}`: {source}")]
    Store {
        op: Operation,
        key: String,
        #[source]
        source: StoreError,
    },
    /// The script returned something other than an integer.
    #[error("{op} for key `{key}` returned an unexpected reply: {reply}")]
    UnexpectedReply { op: Operation, key: String, reply: String },
    /// The request context was cancelled or its deadline passed.
    #[error(transparent)]
    Context(#[from] ContextError),
    /// The caller passed arguments the algorithm cannot honor.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl LimiterError {
    /// Wrap a store failure with the operation and key it belongs to.
    ///
    /// A store call abandoned because of the context surfaces as the context's own error.
    pub fn store(op: Operation, key: &str, source: StoreError) -> Self {
        match source {
            StoreError::Context(ctx) => LimiterError::Context(ctx),
            source => LimiterError::Store { op, key: key.to_string(), source },
        }
    }

    /// True for infrastructure failures (backend errors and malformed replies).
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::UnexpectedReply { .. })
    }

    /// True if the request context ended the operation.
    pub fn is_context(&self) -> bool {
        matches!(self, Self::Context(_))
    }

    /// Borrow the context error if present.
    pub fn as_context(&self) -> Option<ContextError> {
        match self {
            Self::Context(e) => Some(*e),
            _ => None,
        }
    }

    /// Whether a retry layer should try again after this error.
    ///
    /// Only transient infrastructure failures qualify; a finished context or a
    /// bad argument fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        self.is_backend()
    }
}

/// Invalid limiter or admission configuration, reported by `build()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("a limiter is required")]
    MissingLimiter,
    #[error("limit must be greater than zero")]
    ZeroLimit,
    #[error("window must be at least one millisecond")]
    ZeroWindow,
    #[error("wait mode requires a non-zero wait timeout")]
    MissingWaitTimeout,
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
    #[error("invalid retry backoff: {0}")]
    InvalidBackoff(#[from] crate::backoff::BackoffError),
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,
    #[error("cost must be greater than zero")]
    ZeroCost,
    #[error("invalid HTTP status code {0}")]
    InvalidStatus(u16),
}
