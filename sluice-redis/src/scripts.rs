//! Lua scripts executed atomically on the Redis server.
//!
//! Every script reads the clock via `TIME` and re-arms the key's TTL, and
//! every mutating script writes the full record back (including capacity
//! and refill rate) so parameter changes take effect on the next access.
//! Fractional results are returned as strings: Redis converts Lua numbers
//! to integer replies, truncating toward zero.

/// Consume tokens from a bucket, refilling lazily first.
///
/// KEYS: bucket key. ARGV: requested tokens, capacity, refill rate
/// (tokens/s), ttl (seconds). Returns `{allowed, tokens, retry_after}`.
pub const TAKE_TOKENS: &str = r#"
local key = KEYS[1]
local requested = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1]) or capacity
local last_refill = tonumber(state[2]) or now

local elapsed = math.max(0, now - last_refill)
local pool = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
local retry_after = 0
if pool >= requested then
    pool = pool - requested
    allowed = 1
else
    retry_after = (requested - pool) / refill_rate
end

redis.call('HMSET', key,
    'tokens', pool,
    'last_refill', now,
    'capacity', capacity,
    'refill_rate', refill_rate)
redis.call('EXPIRE', key, math.ceil(ttl))

return {allowed, tostring(pool), tostring(retry_after)}
"#;

/// Observe a bucket without consuming. Still refills lazily (writing back
/// when tokens were added) and re-arms the TTL.
///
/// KEYS: bucket key. ARGV: capacity, refill rate, ttl. Returns
/// `{tokens, now, ttl_remaining}`.
pub const BUCKET_STATE: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = tonumber(state[1]) or capacity
local last_refill = tonumber(state[2]) or now

local elapsed = math.max(0, now - last_refill)
local pool = math.min(capacity, tokens + elapsed * refill_rate)

if pool > tokens then
    redis.call('HMSET', key,
        'tokens', pool,
        'last_refill', now,
        'capacity', capacity,
        'refill_rate', refill_rate)
end
redis.call('EXPIRE', key, math.ceil(ttl))

local remaining = redis.call('TTL', key)
if remaining < 0 then
    remaining = math.ceil(ttl)
end

return {tostring(pool), tostring(now), remaining}
"#;

/// Restore a bucket to full capacity.
///
/// KEYS: bucket key. ARGV: capacity, refill rate, ttl.
pub const RESET_BUCKET: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000

redis.call('HMSET', key,
    'tokens', capacity,
    'last_refill', now,
    'capacity', capacity,
    'refill_rate', refill_rate)
redis.call('EXPIRE', key, math.ceil(ttl))

return redis.status_reply('OK')
"#;

/// Admit one request into a rolling window if the count permits.
///
/// Members score and value are the admission time in milliseconds;
/// eviction drops everything at or before `now - window`. KEYS: window
/// key. ARGV: max requests, window (ms), ttl (seconds). Returns
/// `{allowed, count, retry_after_ms, now_ms}`.
pub const WINDOW_ALLOW: &str = r#"
local key = KEYS[1]
local max_requests = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local window_start = now_ms - window_ms

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
local count = redis.call('ZCARD', key)

local allowed = 0
local retry_after_ms = 0
if count < max_requests then
    redis.call('ZADD', key, now_ms, now_ms)
    allowed = 1
    count = count + 1
else
    local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
    if #oldest > 0 then
        retry_after_ms = tonumber(oldest[2]) + window_ms - now_ms
        if retry_after_ms < 0 then
            retry_after_ms = 0
        elseif retry_after_ms > window_ms then
            retry_after_ms = window_ms
        end
    end
end

redis.call('EXPIRE', key, math.ceil(ttl))

return {allowed, count, tostring(retry_after_ms), now_ms}
"#;

/// Count the window without admitting. KEYS: window key. ARGV: window
/// (ms), ttl (seconds). Returns `{count, now_ms}`.
pub const WINDOW_STATE: &str = r#"
local key = KEYS[1]
local window_ms = tonumber(ARGV[1])
local ttl = tonumber(ARGV[2])

local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local window_start = now_ms - window_ms

redis.call('ZREMRANGEBYSCORE', key, '-inf', window_start)
local count = redis.call('ZCARD', key)
redis.call('EXPIRE', key, math.ceil(ttl))

return {count, now_ms}
"#;
