//! What the admission layer hands to its response hooks, and the default responses.

use crate::error::LimiterError;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// A request denied because its key is over quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub key: String,
    pub limit: u64,
    pub window: Duration,
    /// Configured rejection status.
    pub status: StatusCode,
    /// Configured rejection message.
    pub message: String,
}

impl Rejection {
    /// Seconds a client should wait before trying again: the window, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.window.as_secs();
        if self.window.subsec_nanos() > 0 {
            secs.saturating_add(1)
        } else {
            secs.max(1)
        }
    }
}

/// A request that could not be admitted because the limiter call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("admission failed for key `{key}`: {source}")]
pub struct AdmissionError {
    pub key: String,
    #[source]
    pub source: LimiterError,
    /// Configured error status.
    pub status: StatusCode,
    /// Configured error message.
    pub message: String,
}

#[derive(Serialize)]
struct RejectionBody<'a> {
    error: &'static str,
    message: &'a str,
    limit: u64,
    window: String,
    window_ms: u64,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'static str,
    message: &'a str,
}

/// `status` + `Retry-After` + `{"error":"rate_limit_exceeded", message, limit, window, window_ms}`.
pub fn default_rejection_response(rejection: &Rejection) -> Response {
    let body = RejectionBody {
        error: "rate_limit_exceeded",
        message: &rejection.message,
        limit: rejection.limit,
        window: format!("{:?}", rejection.window),
        window_ms: u64::try_from(rejection.window.as_millis()).unwrap_or(u64::MAX),
    };
    let mut response = (rejection.status, axum::Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(rejection.retry_after_secs()));
    response
}

/// `status` + `{"error":"internal_error", message}`. The underlying error is not exposed.
pub fn default_error_response(error: &AdmissionError) -> Response {
    let body = ErrorBody { error: "internal_error", message: &error.message };
    (error.status, axum::Json(body)).into_response()
}
