//! Process-local [`Store`] with Redis-like key semantics.
//!
//! Values are integers or sorted sets, each key may carry a TTL measured against an
//! injectable [`Clock`], and scripts are native functions registered by name. A script
//! runs with exclusive access to the whole keyspace, which gives the same atomicity
//! the limiter relies on from a real backend.

use super::{Script, ScriptArg, ScriptValue, Store};
use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::StoreError;
use crate::limiter::script::{sliding_window_native, SLIDING_WINDOW};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Native stand-in for a server-side script.
pub type NativeScript =
    fn(&mut Keyspace, &[String], &[ScriptArg]) -> Result<ScriptValue, StoreError>;

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Int(i64),
    SortedSet(HashMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

/// The data a native script operates on.
///
/// Expired keys are dropped lazily on access, relative to the time captured when the
/// script started.
#[derive(Debug, Default)]
pub struct Keyspace {
    entries: HashMap<String, Entry>,
    now: u64,
}

impl Keyspace {
    /// Time (ms since epoch) at which the current script started.
    pub fn now_millis(&self) -> u64 {
        self.now
    }

    fn purge_if_expired(&mut self, key: &str) {
        let expired = matches!(
            self.entries.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= self.now
        );
        if expired {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Integer value of `key`, `None` if absent.
    pub fn get_int(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Int(v), .. }) => Ok(Some(*v)),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    /// `INCRBY`: absent keys start at zero; an existing TTL is kept.
    pub fn incr_by(&mut self, key: &str, by: i64) -> Result<i64, StoreError> {
        match self.live(key) {
            Some(Entry { value: Value::Int(v), .. }) => {
                *v = v
                    .checked_add(by)
                    .ok_or_else(|| StoreError::Script("increment or decrement would overflow".into()))?;
                Ok(*v)
            }
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
            None => {
                self.entries
                    .insert(key.to_string(), Entry { value: Value::Int(by), expires_at: None });
                Ok(by)
            }
        }
    }

    /// `ZADD`: returns true if `member` was new.
    pub fn zadd(&mut self, key: &str, score: i64, member: String) -> Result<bool, StoreError> {
        match self.live(key) {
            Some(Entry { value: Value::SortedSet(set), .. }) => Ok(set.insert(member, score).is_none()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
            None => {
                let mut set = HashMap::new();
                set.insert(member, score);
                self.entries
                    .insert(key.to_string(), Entry { value: Value::SortedSet(set), expires_at: None });
                Ok(true)
            }
        }
    }

    /// `ZREMRANGEBYSCORE key min max` (inclusive). Empty sets are removed.
    pub fn zrem_range_by_score(&mut self, key: &str, min: i64, max: i64) -> Result<usize, StoreError> {
        let removed = match self.live(key) {
            None => return Ok(0),
            Some(Entry { value: Value::SortedSet(set), .. }) => {
                let before = set.len();
                set.retain(|_, score| *score < min || *score > max);
                before - set.len()
            }
            Some(_) => return Err(StoreError::WrongType { key: key.to_string() }),
        };
        if matches!(self.entries.get(key), Some(Entry { value: Value::SortedSet(set), .. }) if set.is_empty())
        {
            self.entries.remove(key);
        }
        Ok(removed)
    }

    /// `ZCARD`.
    pub fn zcard(&mut self, key: &str) -> Result<usize, StoreError> {
        match self.live(key) {
            None => Ok(0),
            Some(Entry { value: Value::SortedSet(set), .. }) => Ok(set.len()),
            Some(_) => Err(StoreError::WrongType { key: key.to_string() }),
        }
    }

    /// `EXPIRE`: returns false if the key does not exist.
    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        let now = self.now;
        match self.live(key) {
            Some(entry) => {
                let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
                entry.expires_at = Some(now.saturating_add(ttl_ms));
                true
            }
            None => false,
        }
    }

    /// Remaining time to live; `None` for absent keys or keys without expiry.
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        let now = self.now;
        self.live(key)
            .and_then(|e| e.expires_at)
            .map(|at| Duration::from_millis(at.saturating_sub(now)))
    }

    /// `DEL`: returns true if the key existed.
    pub fn del(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.remove(key).is_some()
    }
}

/// In-memory store. Clones share the same keyspace.
#[derive(Clone)]
pub struct MemoryStore {
    keyspace: Arc<Mutex<Keyspace>>,
    scripts: Arc<HashMap<&'static str, NativeScript>>,
    clock: Arc<dyn Clock>,
    faults: Arc<Mutex<VecDeque<StoreError>>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("scripts", &self.scripts.keys().collect::<Vec<_>>())
            .field("clock", &self.clock)
            .finish()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Store with the built-in sliding-window script, timed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    /// Store with the built-in scripts, timed by `clock`.
    pub fn with_clock<C>(clock: C) -> Self
    where
        C: Clock + 'static,
    {
        Self {
            keyspace: Arc::new(Mutex::new(Keyspace::default())),
            scripts: Arc::new(HashMap::new()),
            clock: Arc::new(clock),
            faults: Arc::new(Mutex::new(VecDeque::new())),
        }
        .with_script(&SLIDING_WINDOW, sliding_window_native)
    }

    /// Register a native implementation for `script`.
    ///
    /// Call before the store is cloned; clones made earlier keep the old registry.
    pub fn with_script(mut self, script: &Script, native: NativeScript) -> Self {
        Arc::make_mut(&mut self.scripts).insert(script.name(), native);
        self
    }

    /// Make the next call (eval or del) fail with `error`. Queued faults apply in order.
    pub fn fail_next(&self, error: StoreError) {
        self.faults.lock().unwrap_or_else(|p| p.into_inner()).push_back(error);
    }

    fn take_fault(&self) -> Option<StoreError> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner()).pop_front()
    }

    fn lock(&self) -> MutexGuard<'_, Keyspace> {
        let mut guard = self.keyspace.lock().unwrap_or_else(|p| p.into_inner());
        guard.now = self.clock.now_millis();
        guard
    }

    /// Integer stored at `key`, if any.
    pub fn int_value(&self, key: &str) -> Option<i64> {
        self.lock().get_int(key).ok().flatten()
    }

    /// Cardinality of the sorted set at `key` (0 when absent).
    pub fn set_len(&self, key: &str) -> usize {
        self.lock().zcard(key).unwrap_or(0)
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        self.lock().ttl(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lock().exists(key)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn eval(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptValue, StoreError> {
        ctx.check()?;
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let native = self
            .scripts
            .get(script.name())
            .copied()
            .ok_or_else(|| StoreError::UnknownScript(script.name().to_string()))?;
        let mut keyspace = self.lock();
        native(&mut keyspace, keys, args)
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<(), StoreError> {
        ctx.check()?;
        if let Some(fault) = self.take_fault() {
            return Err(fault);
        }
        let mut keyspace = self.lock();
        for key in keys {
            keyspace.del(key);
        }
        Ok(())
    }
}
