//! Request-scoped cancellation and deadlines.
//!
//! Every public limiter operation takes a [`RequestContext`]. A context is a
//! cancellation token plus an optional deadline; children inherit both and can only
//! tighten the deadline. Suspension points check the context before doing work and
//! race every sleep against [`RequestContext::done`].
//!
//! ```rust
//! use std::time::Duration;
//! use windowgate::{ContextError, RequestContext};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));
//! assert!(ctx.check().is_ok());
//! ctx.cancel();
//! assert_eq!(ctx.check(), Err(ContextError::Cancelled));
//! # });
//! ```

use crate::error::ContextError;
use crate::sleeper::Sleeper;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline, cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Wrap an existing token, e.g. a server-wide shutdown token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token, deadline: None }
    }

    /// Child context: cancelled with the parent, deadline inherited.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token(), deadline: self.deadline }
    }

    /// Child context whose deadline is `timeout` from now, or the parent's if earlier.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let at = Instant::now().checked_add(timeout);
        match at {
            Some(at) => self.with_deadline(at),
            None => self.child(),
        }
    }

    /// Child context with the earlier of `at` and the parent's deadline.
    pub fn with_deadline(&self, at: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing <= at => existing,
            _ => at,
        };
        Self { token: self.token.child_token(), deadline: Some(deadline) }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Why the context is finished, or `None` while it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(at) if Instant::now() >= at => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// `Ok(())` while the context is live.
    pub fn check(&self) -> Result<(), ContextError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(at) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(at) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Sleep through `sleeper`, returning early with the context error if it finishes.
    ///
    /// The context is checked both before and after the sleep.
    pub async fn sleep(&self, sleeper: &dyn Sleeper, duration: Duration) -> Result<(), ContextError> {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            _ = sleeper.sleep(duration) => self.check(),
        }
    }

    /// Run `fut` to completion unless the context finishes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        self.check()?;
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
