//! Plain, deserializable admission settings.
//!
//! Durations are whole milliseconds so the same settings can come from JSON, env-derived
//! structs or any other `serde` source. Validation happens when the settings are applied
//! to an [`AdmissionLayerBuilder`](crate::admission::AdmissionLayerBuilder) and it is built.
//!
//! ```rust
//! use windowgate::AdmissionSettings;
//!
//! let settings = AdmissionSettings::from_json(r#"{
//!     "limit": 100,
//!     "window_ms": 60000,
//!     "retry": { "max_attempts": 3, "retry_interval_ms": 50, "use_exponential_backoff": true }
//! }"#).unwrap();
//! assert_eq!(settings.limit, 100);
//! assert_eq!(settings.wait_mode, None);
//! ```

use crate::admission::FailurePolicy;
use crate::jitter::Jitter;
use crate::retry::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Admission layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionSettings {
    pub limit: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub wait_mode: Option<bool>,
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    #[serde(default)]
    pub cost: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetrySettings>,
    #[serde(default)]
    pub failure_policy: Option<FailurePolicy>,
    #[serde(default)]
    pub rejected_status: Option<u16>,
    #[serde(default)]
    pub rejected_message: Option<String>,
    #[serde(default)]
    pub error_status: Option<u16>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl AdmissionSettings {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }
}

/// Middleware retry settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub retry_interval_ms: u64,
    #[serde(default)]
    pub use_exponential_backoff: bool,
    /// Zero (the default) leaves exponential backoff uncapped.
    #[serde(default)]
    pub max_retry_interval_ms: u64,
    #[serde(default)]
    pub jitter: Jitter,
}

impl RetrySettings {
    pub fn strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_attempts: self.max_attempts,
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            use_exponential_backoff: self.use_exponential_backoff,
            max_retry_interval: Duration::from_millis(self.max_retry_interval_ms),
        }
    }
}
