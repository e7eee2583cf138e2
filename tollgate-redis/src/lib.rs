//! Redis bucket store for `tollgate` (companion crate).
//!
//! Each bucket is a hash with `tokens` and `last` fields. Refill, admission, decrement
//! and write-back run inside one Lua script, which Redis executes without interleaving
//! other commands, so every instance sharing the server sees a single linear history
//! per key. A caller that gives up mid-request either never sent the script or has
//! already had it applied in full.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, RedisError, Script};
use std::sync::Arc;
use std::time::Duration;
use tollgate::bucket::{BucketState, Verdict};
use tollgate::config::{LimiterConfig, DEFAULT_KEY_PREFIX};
use tollgate::{BucketStore, ClientKey, RateLimitPolicy, StoreError};

/// KEYS[1] bucket hash; ARGV capacity, refill per ms, now ms, idle TTL ms (0 = none).
///
/// Returns `{allowed, tokens, last}` with the floats rendered as strings, since Lua
/// numbers are truncated to integers on the way back to the client. A record whose
/// fields do not parse is left untouched and reported as a `MALFORMED` error, matching
/// [`RedisBucketStore::load`]. The TTL is raised to the tier's full-refill time.
const APPLY_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local function non_finite(raw)
  local word = string.match(string.lower(raw), '^%s*[+-]?(%a+)%s*$')
  return word == 'inf' or word == 'infinity' or word == 'nan'
end

local stored = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = nil
local last = nil
if stored[1] and stored[2] then
  tokens = tonumber(stored[1])
  if tokens == nil and not non_finite(stored[1]) then
    return redis.error_reply('MALFORMED tokens `' .. stored[1] .. '`')
  end
  last = tonumber(stored[2])
  if last == nil or last < 0 or last ~= math.floor(last) then
    return redis.error_reply('MALFORMED last `' .. stored[2] .. '`')
  end
end
if tokens == nil or last == nil or tokens ~= tokens or tokens == math.huge or tokens == -math.huge then
  tokens = capacity
  last = now
end
tokens = math.max(0, math.min(capacity, tokens))

local elapsed = math.max(0, now - last)
tokens = math.min(capacity, tokens + elapsed * rate)
if now > last then
  last = now
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

local tokens_out = string.format('%.17g', tokens)
local last_out = string.format('%.0f', last)
redis.call('HSET', KEYS[1], 'tokens', tokens_out, 'last', last_out)
if ttl > 0 then
  redis.call('PEXPIRE', KEYS[1], math.max(ttl, math.ceil(capacity / rate)))
end
return {allowed, tokens_out, last_out}
"#;

/// Key layout and expiry for [`RedisBucketStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisStoreConfig {
    /// Prepended to every client key (default `tollgate:`).
    pub key_prefix: String,
    /// Expire buckets idle this long. Never shorter than the bucket's full refill, so
    /// expiry cannot change a decision.
    pub idle_ttl: Option<Duration>,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self { key_prefix: DEFAULT_KEY_PREFIX.to_string(), idle_ttl: None }
    }
}

impl From<&LimiterConfig> for RedisStoreConfig {
    fn from(config: &LimiterConfig) -> Self {
        Self { key_prefix: config.key_prefix.clone(), idle_ttl: config.idle_ttl() }
    }
}

/// [`BucketStore`] shared by every instance connected to the same Redis.
#[derive(Clone)]
pub struct RedisBucketStore {
    conn: ConnectionManager,
    script: Arc<Script>,
    config: RedisStoreConfig,
}

impl std::fmt::Debug for RedisBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBucketStore")
            .field("config", &self.config)
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisBucketStore {
    /// Connect with default key layout.
    ///
    /// # Errors
    /// Returns the client error if the URL is invalid or the first connection fails.
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
    ) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::debug!(target: "tollgate::redis", prefix = %config.key_prefix, "connected bucket store");
        Ok(Self::from_connection(conn, config))
    }

    /// Connect using `store_url`, `key_prefix` and `idle_ttl_ms` from limiter configuration.
    pub async fn from_config(config: &LimiterConfig) -> Result<Self, RedisError> {
        Self::connect_with_config(&config.store_url, RedisStoreConfig::from(config)).await
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager, config: RedisStoreConfig) -> Self {
        Self { conn, script: Arc::new(Script::new(APPLY_SCRIPT)), config }
    }

    pub fn config(&self) -> &RedisStoreConfig {
        &self.config
    }

    fn redis_key(&self, key: &ClientKey) -> String {
        bucket_key(&self.config.key_prefix, key)
    }

    fn ttl_millis(&self) -> u64 {
        self.config
            .idle_ttl
            .map(|ttl| u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

#[async_trait]
impl BucketStore for RedisBucketStore {
    async fn load(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<BucketState, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let (tokens, last): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(&redis_key)
            .arg("tokens")
            .arg("last")
            .query_async(&mut conn)
            .await
            .map_err(|e| store_error(&redis_key, e))?;

        let restored = match (tokens, last) {
            (Some(tokens), Some(last)) => {
                let (tokens, last) = parse_fields(&redis_key, &tokens, &last)?;
                BucketState::restore(tokens, last, policy)
            }
            _ => None,
        };
        Ok(restored.unwrap_or_else(|| BucketState::fresh(policy, now)))
    }

    async fn apply_and_persist(
        &self,
        key: &ClientKey,
        policy: &RateLimitPolicy,
        now: u64,
    ) -> Result<Verdict, StoreError> {
        let redis_key = self.redis_key(key);
        let mut conn = self.conn.clone();
        let (allowed, tokens, last): (i64, String, String) = self
            .script
            .key(&redis_key)
            .arg(policy.capacity())
            .arg(policy.refill_per_milli())
            .arg(now)
            .arg(self.ttl_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| store_error(&redis_key, e))?;

        let (tokens, last_refill_millis) = parse_fields(&redis_key, &tokens, &last)?;
        Ok(Verdict { allowed: allowed == 1, state: BucketState { tokens, last_refill_millis } })
    }
}

fn bucket_key(prefix: &str, key: &ClientKey) -> String {
    format!("{}{}", prefix, key)
}

fn parse_fields(key: &str, tokens: &str, last: &str) -> Result<(f64, u64), StoreError> {
    let malformed = |reason: String| StoreError::Malformed { key: key.to_string(), reason };
    let tokens = tokens
        .trim()
        .parse::<f64>()
        .map_err(|e| malformed(format!("tokens `{}`: {}", tokens, e)))?;
    let last =
        last.trim().parse::<u64>().map_err(|e| malformed(format!("last `{}`: {}", last, e)))?;
    Ok((tokens, last))
}

fn store_error(key: &str, err: RedisError) -> StoreError {
    let malformed = matches!(err.code(), Some("WRONGTYPE") | Some("MALFORMED"));
    if err.kind() == ErrorKind::TypeError || malformed {
        StoreError::Malformed { key: key.to_string(), reason: err.to_string() }
    } else {
        StoreError::Unavailable(err.to_string())
    }
}
