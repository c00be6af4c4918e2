//! The narrow backend surface the limiter is allowed to touch.
//!
//! A [`Store`] can do exactly two things: run a named server-side [`Script`] atomically
//! over an ordered key list, and delete keys. Everything else about the backend
//! (pooling, TLS, cluster routing, serialization) belongs to the implementation.
//!
//! - `windowgate-redis` implements it with Lua `EVAL` and `DEL`.
//! - [`MemoryStore`](memory::MemoryStore) executes registered native scripts under a
//!   single lock, for tests and single-process deployments.

use crate::context::RequestContext;
use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

pub mod memory;

pub use memory::{Keyspace, MemoryStore, NativeScript};

/// A server-side script: a stable name plus its Lua source.
///
/// Backends that speak Lua run `source`; the in-memory store looks up a native
/// implementation registered under `name`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Script {
    name: &'static str,
    source: &'static str,
}

impl Script {
    pub const fn new(name: &'static str, source: &'static str) -> Self {
        Self { name, source }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }
}

/// One `ARGV` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptArg {
    Int(i64),
    Str(String),
}

impl ScriptArg {
    /// Integer view of the argument; strings are parsed the way `tonumber` would.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptArg::Int(v) => Some(*v),
            ScriptArg::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl From<i64> for ScriptArg {
    fn from(v: i64) -> Self {
        ScriptArg::Int(v)
    }
}

impl From<u64> for ScriptArg {
    fn from(v: u64) -> Self {
        ScriptArg::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for ScriptArg {
    fn from(v: &str) -> Self {
        ScriptArg::Str(v.to_string())
    }
}

impl From<String> for ScriptArg {
    fn from(v: String) -> Self {
        ScriptArg::Str(v)
    }
}

impl fmt::Display for ScriptArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptArg::Int(v) => write!(f, "{}", v),
            ScriptArg::Str(s) => f.write_str(s),
        }
    }
}

/// Reply of a script invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Str(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Nil => f.write_str("nil"),
            ScriptValue::Int(v) => write!(f, "(integer) {}", v),
            ScriptValue::Str(s) => write!(f, "{:?}", s),
            ScriptValue::Array(items) => write!(f, "(array of {})", items.len()),
        }
    }
}

/// Shared key-value backend seen by the limiter.
#[async_trait]
pub trait Store: Send + Sync {
    /// Execute `script` atomically against `keys` with `args`.
    ///
    /// Implementations must guarantee the script runs as one indivisible unit relative
    /// to any other script or command touching the same keys, across processes.
    async fn eval(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptValue, StoreError>;

    /// Delete `keys`. Absent keys are not an error.
    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> Store for Arc<S>
where
    S: Store + ?Sized,
{
    async fn eval(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptValue, StoreError> {
        (**self).eval(ctx, script, keys, args).await
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<(), StoreError> {
        (**self).del(ctx, keys).await
    }
}
