//! The sliding-window admission script.
//!
//! `KEYS = [event_key, counter_key]`, `ARGV = [now_ms, window_ms, limit, n]`.
//! Returns `1` when the `n` events are admitted and `0` when they are denied. A
//! denial rolls the counter back but keeps the eviction of stale event markers.

use crate::error::StoreError;
use crate::store::{Keyspace, Script, ScriptArg, ScriptValue};
use std::time::Duration;

pub(crate) const SLIDING_WINDOW_SOURCE: &str = r#"
local event_key = KEYS[1]
local counter_key = KEYS[2]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local n = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', event_key, '-inf', now - window)

local count = redis.call('INCRBY', counter_key, n)
if count > limit then
    redis.call('DECRBY', counter_key, n)
    return 0
end

for i = 1, n do
    redis.call('ZADD', event_key, now, now .. ':' .. i)
end

local ttl = math.ceil(window / 1000) + 1
redis.call('EXPIRE', event_key, ttl)
redis.call('EXPIRE', counter_key, ttl)
return 1
"#;

/// Check, increment, evict and expire in one atomic step.
pub const SLIDING_WINDOW: Script = Script::new("windowgate.sliding_window.v1", SLIDING_WINDOW_SOURCE);

/// Suffix of the counter key paired with every limiter key.
pub const COUNTER_SUFFIX: &str = ":counter";

/// Physical `[event_key, counter_key]` pair for a limiter key.
pub fn script_keys(key: &str) -> Vec<String> {
    vec![key.to_string(), format!("{}{}", key, COUNTER_SUFFIX)]
}

/// TTL applied to both keys after an admitted call: `ceil(window / 1s) + 1s`.
pub fn key_ttl(window_ms: i64) -> Duration {
    let secs = (window_ms.max(0) as u64).div_ceil(1000);
    Duration::from_secs(secs.saturating_add(1))
}

fn arg(args: &[ScriptArg], index: usize, name: &str) -> Result<i64, StoreError> {
    args.get(index)
        .and_then(ScriptArg::as_i64)
        .ok_or_else(|| StoreError::Script(format!("ERR argument `{}` is missing or not an integer", name)))
}

/// Native equivalent of [`SLIDING_WINDOW`] for the in-memory store.
pub(crate) fn sliding_window_native(
    ks: &mut Keyspace,
    keys: &[String],
    args: &[ScriptArg],
) -> Result<ScriptValue, StoreError> {
    let (event_key, counter_key) = match keys {
        [event, counter, ..] => (event.as_str(), counter.as_str()),
        _ => return Err(StoreError::Script("ERR sliding window script needs two keys".into())),
    };
    let now = arg(args, 0, "now")?;
    let window = arg(args, 1, "window")?;
    let limit = arg(args, 2, "limit")?;
    let n = arg(args, 3, "n")?;

    ks.zrem_range_by_score(event_key, i64::MIN, now.saturating_sub(window))?;

    let count = ks.incr_by(counter_key, n)?;
    if count > limit {
        ks.incr_by(counter_key, -n)?;
        return Ok(ScriptValue::Int(0));
    }

    for i in 1..=n {
        ks.zadd(event_key, now, format!("{}:{}", now, i))?;
    }

    let ttl = key_ttl(window);
    ks.expire(event_key, ttl);
    ks.expire(counter_key, ttl);
    Ok(ScriptValue::Int(1))
}
