//! Metrics hook for limiter and admission observations.
//!
//! The limiter and the admission layer report through a [`Metrics`] handle that is
//! created once at process start and passed to their builders. There is no global
//! registry. Hooks are best-effort: they return nothing, must not block, and cannot
//! influence a limiter decision.
//!
//! Provided hooks:
//! - [`NullMetrics`]: discards everything (the default).
//! - [`LogMetrics`]: emits `tracing` events.
//! - [`MemoryMetrics`]: records observations for assertions in tests.
//!
//! `windowgate-prometheus` provides a Prometheus-backed hook.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Operation label used for the admission layer's own latency.
pub const ADMISSION_OPERATION: &str = "admission";

/// Receiver of metric observations.
pub trait MetricsHook: Send + Sync + fmt::Debug {
    /// One admission decision for `key`.
    fn observe_request(&self, key: &str, allowed: bool);

    /// Duration of `operation` on `key`, in seconds.
    fn observe_latency(&self, key: &str, operation: &str, seconds: f64);

    /// Current waiting-queue depth for `key`.
    fn set_waiting_queue_size(&self, key: &str, size: f64);

    /// Number of live limiters of `kind`.
    fn set_active_limiters(&self, kind: &str, count: f64);
}

/// Hook that discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetrics;

impl MetricsHook for NullMetrics {
    fn observe_request(&self, _key: &str, _allowed: bool) {}
    fn observe_latency(&self, _key: &str, _operation: &str, _seconds: f64) {}
    fn set_waiting_queue_size(&self, _key: &str, _size: f64) {}
    fn set_active_limiters(&self, _kind: &str, _count: f64) {}
}

/// Hook that logs observations using the `tracing` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl MetricsHook for LogMetrics {
    fn observe_request(&self, key: &str, allowed: bool) {
        tracing::debug!(target: "windowgate::metrics", key, allowed, "request");
    }

    fn observe_latency(&self, key: &str, operation: &str, seconds: f64) {
        tracing::trace!(target: "windowgate::metrics", key, operation, seconds, "latency");
    }

    fn set_waiting_queue_size(&self, key: &str, size: f64) {
        tracing::trace!(target: "windowgate::metrics", key, size, "waiting_queue_size");
    }

    fn set_active_limiters(&self, kind: &str, count: f64) {
        tracing::debug!(target: "windowgate::metrics", kind, count, "active_limiters");
    }
}

/// A single recorded observation.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricEvent {
    Request { key: String, allowed: bool },
    Latency { key: String, operation: String, seconds: f64 },
    WaitingQueueSize { key: String, size: f64 },
    ActiveLimiters { kind: String, count: f64 },
}

/// Hook that stores observations in memory, bounded by `capacity` (oldest dropped first).
#[derive(Debug, Clone)]
pub struct MemoryMetrics {
    events: Arc<Mutex<Vec<MetricEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl Default for MemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// `(allowed, rejected)` request counts for `key`.
    pub fn requests(&self, key: &str) -> (usize, usize) {
        self.events().iter().fold((0, 0), |(yes, no), event| match event {
            MetricEvent::Request { key: k, allowed: true } if k == key => (yes + 1, no),
            MetricEvent::Request { key: k, allowed: false } if k == key => (yes, no + 1),
            _ => (yes, no),
        })
    }

    /// Operations with a latency observation for `key`, in order.
    pub fn latency_operations(&self, key: &str) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::Latency { key: k, operation, .. } if k == key => Some(operation),
                _ => None,
            })
            .collect()
    }

    /// Waiting-queue sizes reported for `key`, in order.
    pub fn waiting_sizes(&self, key: &str) -> Vec<f64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                MetricEvent::WaitingQueueSize { key: k, size } if k == key => Some(size),
                _ => None,
            })
            .collect()
    }

    /// Last active-limiter count reported for `kind`.
    pub fn active_limiters(&self, kind: &str) -> Option<f64> {
        self.events().into_iter().rev().find_map(|event| match event {
            MetricEvent::ActiveLimiters { kind: k, count } if k == kind => Some(count),
            _ => None,
        })
    }

    fn push(&self, event: MetricEvent) {
        let mut events = self.events.lock().unwrap_or_else(|p| p.into_inner());
        if events.len() >= self.capacity {
            events.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        events.push(event);
    }
}

impl MetricsHook for MemoryMetrics {
    fn observe_request(&self, key: &str, allowed: bool) {
        self.push(MetricEvent::Request { key: key.to_string(), allowed });
    }

    fn observe_latency(&self, key: &str, operation: &str, seconds: f64) {
        self.push(MetricEvent::Latency {
            key: key.to_string(),
            operation: operation.to_string(),
            seconds,
        });
    }

    fn set_waiting_queue_size(&self, key: &str, size: f64) {
        self.push(MetricEvent::WaitingQueueSize { key: key.to_string(), size });
    }

    fn set_active_limiters(&self, kind: &str, count: f64) {
        self.push(MetricEvent::ActiveLimiters { kind: kind.to_string(), count });
    }
}

/// Shared handle to a [`MetricsHook`], plus the live-limiter bookkeeping behind
/// `set_active_limiters`. Clones report to the same hook.
#[derive(Clone)]
pub struct Metrics {
    hook: Arc<dyn MetricsHook>,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").field("hook", &self.hook).finish()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}

impl Metrics {
    pub fn new<H>(hook: H) -> Self
    where
        H: MetricsHook + 'static,
    {
        Self::from_arc(Arc::new(hook))
    }

    pub fn from_arc(hook: Arc<dyn MetricsHook>) -> Self {
        Self { hook, active: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn noop() -> Self {
        Self::new(NullMetrics)
    }

    pub fn observe_request(&self, key: &str, allowed: bool) {
        self.hook.observe_request(key, allowed);
    }

    pub fn observe_latency(&self, key: &str, operation: &str, seconds: f64) {
        self.hook.observe_latency(key, operation, seconds);
    }

    pub fn set_waiting_queue_size(&self, key: &str, size: f64) {
        self.hook.set_waiting_queue_size(key, size);
    }

    /// Count a new limiter of `kind` until the returned guard is dropped.
    pub fn limiter_started(&self, kind: &'static str) -> ActiveLimiterGuard {
        self.adjust_active(kind, true);
        ActiveLimiterGuard { metrics: self.clone(), kind }
    }

    fn adjust_active(&self, kind: &str, up: bool) {
        let count = {
            let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
            let slot = active.entry(kind.to_string()).or_insert(0);
            *slot = if up { slot.saturating_add(1) } else { slot.saturating_sub(1) };
            *slot
        };
        self.hook.set_active_limiters(kind, count as f64);
    }
}

/// Keeps one limiter counted in the active-limiter gauge while alive.
#[derive(Debug)]
pub struct ActiveLimiterGuard {
    metrics: Metrics,
    kind: &'static str,
}

impl Drop for ActiveLimiterGuard {
    fn drop(&mut self) {
        self.metrics.adjust_active(self.kind, false);
    }
}
