//! Server-side scripts for the rate-limit strategies.
//!
//! Every strategy's full read-modify-write runs as one atomic script on the
//! shared cache; a read-then-write from application code would under-limit
//! under concurrent load. Scripts read the clock via `TIME` on the cache
//! server so all gateway instances observe one clock.
//!
//! Each check script returns `{allowed, remaining, retry_after_ms, reset_ms}`
//! (floats are floored to integers before returning; Redis truncates Lua
//! numbers on the way out).

/// Token bucket: refill by elapsed time up to capacity, spend one per
/// request. State is a hash `{tokens, ts}`; both allow and deny persist the
/// refilled state and refresh the TTL.
/// KEYS[1] state key; ARGV: capacity, refill_rate (tokens/sec), ttl_secs.
pub const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local state = redis.call('HMGET', KEYS[1], 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
    tokens = capacity
    ts = now
end
tokens = tokens + (now - ts) * rate
if tokens > capacity then
    tokens = capacity
end
local allowed = 0
local retry_ms = 0
if tokens >= 1 then
    tokens = tokens - 1
    allowed = 1
elseif rate > 0 then
    retry_ms = math.ceil((1 - tokens) * 1000 / rate)
else
    retry_ms = ttl * 1000
end
redis.call('HSET', KEYS[1], 'tokens', tokens, 'ts', now)
redis.call('EXPIRE', KEYS[1], ttl)
local reset_ms = 0
if rate > 0 then
    reset_ms = math.ceil((capacity - tokens) * 1000 / rate)
end
return {allowed, math.floor(tokens), retry_ms, reset_ms}
"#;

/// Leaky bucket: drain by elapsed time, enqueue one per request. Smooths
/// bursts to a fixed output rate instead of permitting them.
/// KEYS[1] state key; ARGV: capacity, leak_rate (per sec), ttl_secs.
pub const LEAKY_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local state = redis.call('HMGET', KEYS[1], 'q', 'ts')
local q = tonumber(state[1])
local ts = tonumber(state[2])
if q == nil or ts == nil then
    q = 0
    ts = now
end
q = q - (now - ts) * rate
if q < 0 then
    q = 0
end
local allowed = 0
local retry_ms = 0
if q < capacity then
    q = q + 1
    allowed = 1
elseif rate > 0 then
    retry_ms = math.ceil((q - capacity + 1) * 1000 / rate)
else
    retry_ms = ttl * 1000
end
redis.call('HSET', KEYS[1], 'q', q, 'ts', now)
redis.call('EXPIRE', KEYS[1], ttl)
local remaining = math.floor(capacity - q)
if remaining < 0 then
    remaining = 0
end
local reset_ms = 0
if rate > 0 then
    reset_ms = math.ceil(q * 1000 / rate)
end
return {allowed, remaining, retry_ms, reset_ms}
"#;

/// Fixed window: integer counter per window slot. The first increment sets
/// the TTL; a request landing exactly on a boundary belongs to the next
/// window because the slot is derived from the current clock. The
/// boundary-burst weakness is accepted.
/// KEYS[1] key prefix (slot appended); ARGV: capacity, window_secs.
pub const FIXED_WINDOW: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local slot = math.floor(now / window) * window
local key = KEYS[1] .. ':' .. slot
local count = tonumber(redis.call('GET', key) or '0')
local allowed = 0
local retry_ms = 0
local window_end = slot + window
if count < capacity then
    count = redis.call('INCR', key)
    if count == 1 then
        redis.call('EXPIRE', key, window)
    end
    allowed = 1
else
    retry_ms = math.ceil((window_end - now) * 1000)
end
local remaining = capacity - count
if remaining < 0 then
    remaining = 0
end
local reset_ms = math.ceil((window_end - now) * 1000)
return {allowed, remaining, retry_ms, reset_ms}
"#;

/// Sliding window: the previous window's count decays linearly as the
/// current window progresses. At progress 0 the effective count equals the
/// previous count exactly (integer math, floored carry).
/// KEYS[1] key prefix (slot appended); ARGV: capacity, window_secs.
pub const SLIDING_WINDOW: &str = r#"
local capacity = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local t = redis.call('TIME')
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000
local slot = math.floor(now / window) * window
local curr_key = KEYS[1] .. ':' .. slot
local prev_key = KEYS[1] .. ':' .. (slot - window)
local curr = tonumber(redis.call('GET', curr_key) or '0')
local prev = tonumber(redis.call('GET', prev_key) or '0')
local elapsed = now - slot
local carried = math.floor(prev * (window - elapsed) / window)
local effective = carried + curr
local allowed = 0
local retry_ms = 0
if effective < capacity then
    redis.call('INCR', curr_key)
    redis.call('EXPIRE', curr_key, window * 2)
    allowed = 1
    effective = effective + 1
else
    retry_ms = math.ceil((slot + window - now) * 1000)
end
local remaining = capacity - effective
if remaining < 0 then
    remaining = 0
end
local reset_ms = math.ceil((slot + window - now) * 1000)
return {allowed, remaining, retry_ms, reset_ms}
"#;

/// Concurrency acquire: admit while the in-flight counter is below capacity.
/// The TTL self-heals leaked acquisitions from crashed requests.
/// KEYS[1] counter key; ARGV: capacity, ttl_secs.
pub const CONCURRENCY_ACQUIRE: &str = r#"
local capacity = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
local allowed = 0
if count < capacity then
    count = redis.call('INCR', KEYS[1])
    allowed = 1
end
redis.call('EXPIRE', KEYS[1], ttl)
local remaining = capacity - count
if remaining < 0 then
    remaining = 0
end
return {allowed, remaining, 0, 0}
"#;

/// Concurrency release: decrement, never below zero.
/// KEYS[1] counter key.
pub const CONCURRENCY_RELEASE: &str = r#"
local count = tonumber(redis.call('GET', KEYS[1]) or '0')
if count > 0 then
    return redis.call('DECR', KEYS[1])
end
return 0
"#;
