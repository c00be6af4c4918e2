//! Redis store for `windowgate`.
//!
//! Scripts run with `EVALSHA` (falling back to `EVAL` on first use), so each limiter
//! decision is one atomic server-side step. Every call races the request context; a
//! cancelled or expired context abandons the in-flight command.
//!
//! A multiplexed connection is shared between calls. When a command fails at the
//! connection level the cached connection is discarded and the next call reconnects.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use windowgate::{RateLimiter, RequestContext, SlidingWindowLimiter};
//! use windowgate_redis::RedisStore;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = RedisStore::open("redis://127.0.0.1/")?;
//! let limiter = SlidingWindowLimiter::new(store);
//! let allowed = limiter
//!     .allow(&RequestContext::background(), "user:123", 10, Duration::from_secs(1))
//!     .await?;
//! # let _ = allowed;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use windowgate::{RequestContext, Script, ScriptArg, ScriptValue, Store, StoreError};

/// Lazily filled connection cache that can be emptied after a failure.
struct ConnectionSlot<C> {
    conn: tokio::sync::Mutex<Option<C>>,
}

impl<C: Clone> ConnectionSlot<C> {
    fn new() -> Self {
        Self { conn: tokio::sync::Mutex::new(None) }
    }

    async fn get_or_connect<F, Fut, E>(&self, connect: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = connect().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn invalidate(&self) {
        self.conn.lock().await.take();
    }

    /// `true` while a connection is cached (or the slot is busy connecting).
    fn is_connected(&self) -> bool {
        self.conn.try_lock().map(|slot| slot.is_some()).unwrap_or(true)
    }
}

/// [`Store`] backed by a Redis server.
///
/// Clones share one lazily established multiplexed connection, replaced after
/// connection-level errors.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<ConnectionSlot<MultiplexedConnection>>,
    scripts: Arc<Mutex<HashMap<&'static str, redis::Script>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("server", &self.client.get_connection_info().addr)
            .field("connected", &self.conn.is_connected())
            .finish()
    }
}

impl RedisStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(ConnectionSlot::new()),
            scripts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Client for `url` (e.g. `redis://127.0.0.1/`). No connection is made yet.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(map_redis_error)?;
        Ok(Self::new(client))
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        self.conn
            .get_or_connect(|| async {
                tracing::debug!(target: "windowgate::redis", "opening multiplexed connection");
                self.client.get_multiplexed_async_connection().await
            })
            .await
            .map_err(|e| {
                tracing::warn!(target: "windowgate::redis", error = %e, "connection failed");
                map_redis_error(e)
            })
    }

    /// Map a command error, dropping the cached connection if it is no longer usable.
    async fn command_failed(&self, e: redis::RedisError) -> StoreError {
        let err = map_redis_error(e);
        if matches!(err, StoreError::Connection(_)) {
            tracing::debug!(target: "windowgate::redis", error = %err, "discarding connection");
            self.conn.invalidate().await;
        }
        err
    }

    fn prepared(&self, script: &Script) -> redis::Script {
        let mut scripts = self.scripts.lock().unwrap_or_else(|p| p.into_inner());
        scripts
            .entry(script.name())
            .or_insert_with(|| redis::Script::new(script.source()))
            .clone()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn eval(
        &self,
        ctx: &RequestContext,
        script: &Script,
        keys: &[String],
        args: &[ScriptArg],
    ) -> Result<ScriptValue, StoreError> {
        let mut conn = ctx.run(self.connection()).await??;
        let prepared = self.prepared(script);

        let mut invocation = prepared.prepare_invoke();
        for key in keys {
            invocation.key(key.as_str());
        }
        for arg in args {
            match arg {
                ScriptArg::Int(v) => invocation.arg(*v),
                ScriptArg::Str(s) => invocation.arg(s.as_str()),
            };
        }

        let reply: Result<redis::Value, _> = ctx.run(invocation.invoke_async(&mut conn)).await?;
        match reply {
            Ok(reply) => Ok(to_script_value(reply)),
            Err(e) => {
                tracing::warn!(target: "windowgate::redis", script = script.name(), error = %e, "script failed");
                Err(self.command_failed(e).await)
            }
        }
    }

    async fn del(&self, ctx: &RequestContext, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = ctx.run(self.connection()).await??;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key.as_str());
        }
        match ctx.run(cmd.query_async::<_, i64>(&mut conn)).await? {
            Ok(_) => Ok(()),
            Err(e) => Err(self.command_failed(e).await),
        }
    }
}

/// Map a client error to the store error taxonomy.
pub fn map_redis_error(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StoreError::Connection(e.to_string())
    } else if e.kind() == redis::ErrorKind::ResponseError || e.kind() == redis::ErrorKind::NoScriptError {
        StoreError::Script(e.to_string())
    } else {
        StoreError::Other(e.to_string())
    }
}

/// Convert a raw reply into a [`ScriptValue`].
pub fn to_script_value(value: redis::Value) -> ScriptValue {
    match value {
        redis::Value::Nil => ScriptValue::Nil,
        redis::Value::Int(v) => ScriptValue::Int(v),
        redis::Value::Data(bytes) => ScriptValue::Str(String::from_utf8_lossy(&bytes).into_owned()),
        redis::Value::Bulk(items) => ScriptValue::Array(items.into_iter().map(to_script_value).collect()),
        redis::Value::Status(s) => ScriptValue::Str(s),
        redis::Value::Okay => ScriptValue::Str("OK".to_string()),
    }
}
