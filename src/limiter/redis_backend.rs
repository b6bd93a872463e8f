use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use redis::{Script, aio::ConnectionManager};
use uuid::Uuid;

use crate::{
    error::{LimiterError, LimiterResult},
    limiter::{Algorithm, Decision, EngineConfig, Limiter, LimiterStatus, unix_now},
};

/// Decision applied when the remote store is unreachable or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    FailOpen,
    FailClosed,
}

impl FromStr for FallbackPolicy {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Ok(Self::FailOpen),
            "fail_closed" | "closed" => Ok(Self::FailClosed),
            other => Err(LimiterError::Config(format!(
                "unknown fallback policy: {other}"
            ))),
        }
    }
}

// Each script performs the whole read-modify-write for one key server-side,
// so concurrent checks from independent processes are linearized by Redis.
// All scripts return {allowed, remaining, retry_after_ms}.

const TOKEN_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[1])
local refill = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'tokens', 'ts')
local tokens = tonumber(state[1])
local ts = tonumber(state[2])

if tokens == nil or ts == nil then
  tokens = burst
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
tokens = math.min(burst, tokens + elapsed * refill)

local allowed = 0
local remaining = 0
local retry_ms = 0

if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
  remaining = math.floor(tokens)
else
  retry_ms = math.ceil(((1 - tokens) / refill) * 1000)
end

redis.call('HMSET', key, 'tokens', tokens, 'ts', now_ms)
redis.call('EXPIRE', key, ttl)

return {allowed, remaining, retry_ms}
"#;

const SLIDING_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local now_ms = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]
local ttl = tonumber(ARGV[5])

redis.call('ZREMRANGEBYSCORE', key, 0, now_ms - window_ms)
local count = redis.call('ZCARD', key)

if count < limit then
  redis.call('ZADD', key, now_ms, member)
  redis.call('EXPIRE', key, ttl)
  return {1, limit - (count + 1), 0}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry_ms = 0
if oldest[2] then
  retry_ms = math.max(0, math.ceil(tonumber(oldest[2]) + window_ms - now_ms))
end
return {0, 0, retry_ms}
"#;

const LEAKY_BUCKET_LUA: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local leak_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local state = redis.call('HMGET', key, 'depth', 'ts')
local depth = tonumber(state[1])
local ts = tonumber(state[2])

if depth == nil or ts == nil then
  depth = 0
  ts = now_ms
end

local elapsed = math.max(0, now_ms - ts) / 1000.0
local leaked = math.floor(elapsed * leak_rate)

if leaked >= depth then
  depth = 0
  ts = now_ms
elseif leaked > 0 then
  depth = depth - leaked
  ts = ts + math.floor((leaked / leak_rate) * 1000)
end

local allowed = 0
local remaining = 0
local retry_ms = 0

if depth < capacity then
  depth = depth + 1
  allowed = 1
  remaining = capacity - depth
else
  retry_ms = math.ceil(((depth - capacity + 1) / leak_rate) * 1000)
end

redis.call('HMSET', key, 'depth', depth, 'ts', ts)
redis.call('EXPIRE', key, ttl)

return {allowed, remaining, retry_ms}
"#;

const FIXED_WINDOW_LUA: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

local aligned = math.floor(now_ms / window_ms) * window_ms
local state = redis.call('HMGET', key, 'count', 'win')
local count = tonumber(state[1])
local win = tonumber(state[2])

if count == nil or win == nil or aligned > win then
  count = 0
  win = aligned
end

local allowed = 0
local retry_ms = 0

if count < limit then
  count = count + 1
  allowed = 1
else
  retry_ms = math.max(0, win + window_ms - now_ms)
end

redis.call('HMSET', key, 'count', count, 'win', win)
redis.call('EXPIRE', key, ttl)

return {allowed, math.max(0, limit - count), retry_ms}
"#;

/// Limiter whose per-client state lives in Redis. Every check is one Lua
/// invocation, bounded by `call_timeout`; unavailability resolves through
/// the fallback policy so callers always get a prompt decision.
pub struct RedisLimiter {
    manager: ConnectionManager,
    key_prefix: String,
    config: EngineConfig,
    fallback: FallbackPolicy,
    call_timeout: Duration,
}

impl RedisLimiter {
    pub async fn connect(
        url: String,
        key_prefix: String,
        config: EngineConfig,
        fallback: FallbackPolicy,
        call_timeout: Duration,
    ) -> LimiterResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            config,
            fallback,
            call_timeout,
        })
    }

    fn key(&self, client_id: &str) -> String {
        format!(
            "{}:{}:{}",
            self.key_prefix,
            self.config.algorithm.as_str(),
            client_id
        )
    }

    async fn run_check(&self, key: &str, now_ms: i64) -> LimiterResult<(i64, i64, i64)> {
        let mut conn = self.manager.clone();
        let window_ms = ((self.config.window_seconds * 1000.0) as i64).max(1);

        let raw: (i64, i64, i64) = match self.config.algorithm {
            Algorithm::TokenBucket => {
                let drain_secs = self.config.burst() as f64 / self.config.refill_per_sec();
                let ttl = (drain_secs.ceil() as i64).max(1) * 2;
                Script::new(TOKEN_BUCKET_LUA)
                    .key(key)
                    .arg(self.config.burst() as i64)
                    .arg(self.config.refill_per_sec())
                    .arg(now_ms)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await?
            }
            Algorithm::SlidingWindow => {
                let ttl = (self.config.window_seconds.ceil() as i64 + 1).max(1);
                let member = format!("{}-{}", now_ms, Uuid::new_v4());
                Script::new(SLIDING_WINDOW_LUA)
                    .key(key)
                    .arg(now_ms)
                    .arg(window_ms)
                    .arg(self.config.limit as i64)
                    .arg(member)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await?
            }
            Algorithm::LeakyBucket => {
                let drain_secs = self.config.capacity() as f64 / self.config.leak_per_sec();
                let ttl = (drain_secs.ceil() as i64).max(1) * 2;
                Script::new(LEAKY_BUCKET_LUA)
                    .key(key)
                    .arg(self.config.capacity() as i64)
                    .arg(self.config.leak_per_sec())
                    .arg(now_ms)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await?
            }
            Algorithm::FixedWindow => {
                let ttl = (self.config.window_seconds.ceil() as i64).max(1) * 2;
                Script::new(FIXED_WINDOW_LUA)
                    .key(key)
                    .arg(self.config.limit as i64)
                    .arg(window_ms)
                    .arg(now_ms)
                    .arg(ttl)
                    .invoke_async(&mut conn)
                    .await?
            }
        };

        Ok(raw)
    }

    async fn utilization(&self, key: &str, now: f64) -> LimiterResult<f64> {
        let mut conn = self.manager.clone();

        match self.config.algorithm {
            Algorithm::TokenBucket => {
                let (tokens, ts_ms): (Option<f64>, Option<i64>) = redis::cmd("HMGET")
                    .arg(key)
                    .arg("tokens")
                    .arg("ts")
                    .query_async(&mut conn)
                    .await?;

                let burst = self.config.burst() as f64;
                let tokens = match (tokens, ts_ms) {
                    (Some(tokens), Some(ts_ms)) => {
                        let elapsed = (now - ts_ms as f64 / 1000.0).max(0.0);
                        (tokens + elapsed * self.config.refill_per_sec()).min(burst)
                    }
                    _ => burst,
                };
                Ok(((burst - tokens) / burst).clamp(0.0, 1.0))
            }
            Algorithm::SlidingWindow => {
                let cutoff_ms = ((now - self.config.window_seconds) * 1000.0) as i64;
                let count: i64 = redis::cmd("ZCOUNT")
                    .arg(key)
                    .arg(format!("({cutoff_ms}"))
                    .arg("+inf")
                    .query_async(&mut conn)
                    .await?;
                Ok((count as f64 / self.config.limit as f64).clamp(0.0, 1.0))
            }
            Algorithm::LeakyBucket => {
                let (depth, ts_ms): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
                    .arg(key)
                    .arg("depth")
                    .arg("ts")
                    .query_async(&mut conn)
                    .await?;

                let depth = match (depth, ts_ms) {
                    (Some(depth), Some(ts_ms)) => {
                        let elapsed = (now - ts_ms as f64 / 1000.0).max(0.0);
                        let leaked = (elapsed * self.config.leak_per_sec()).floor() as i64;
                        (depth - leaked).max(0)
                    }
                    _ => 0,
                };
                Ok((depth as f64 / self.config.capacity() as f64).clamp(0.0, 1.0))
            }
            Algorithm::FixedWindow => {
                let (count, win_ms): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
                    .arg(key)
                    .arg("count")
                    .arg("win")
                    .query_async(&mut conn)
                    .await?;

                let window_ms = ((self.config.window_seconds * 1000.0) as i64).max(1);
                let aligned = (now * 1000.0) as i64 / window_ms * window_ms;
                let count = match (count, win_ms) {
                    (Some(count), Some(win_ms)) if aligned <= win_ms => count,
                    _ => 0,
                };
                Ok((count as f64 / self.config.limit as f64).clamp(0.0, 1.0))
            }
        }
    }
}

#[async_trait]
impl Limiter for RedisLimiter {
    fn algorithm(&self) -> Algorithm {
        self.config.algorithm
    }

    async fn check(&self, client_id: &str) -> Decision {
        let now = unix_now();
        let key = self.key(client_id);
        let call = self.run_check(&key, (now * 1000.0) as i64);

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok((allowed, remaining, retry_ms))) => {
                decision_from(&self.config, allowed, remaining, retry_ms, now)
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    client = %client_id,
                    error = %err,
                    "redis rate limit check failed; applying fallback policy"
                );
                fallback_decision(self.fallback, &self.config, now)
            }
            Err(_) => {
                tracing::warn!(
                    client = %client_id,
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "redis rate limit check timed out; applying fallback policy"
                );
                fallback_decision(self.fallback, &self.config, now)
            }
        }
    }

    async fn reset(&self, client_id: &str) {
        let key = self.key(client_id);
        let mut conn = self.manager.clone();
        let call = async move {
            let deleted: i64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
            Ok::<_, LimiterError>(deleted)
        };

        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(_)) => tracing::debug!(client = %client_id, "rate limit reset"),
            Ok(Err(err)) => {
                tracing::warn!(client = %client_id, error = %err, "redis rate limit reset failed")
            }
            Err(_) => {
                tracing::warn!(client = %client_id, "redis rate limit reset timed out")
            }
        }
    }

    async fn status(&self, client_id: &str) -> LimiterStatus {
        let now = unix_now();
        let key = self.key(client_id);

        let utilization = match tokio::time::timeout(self.call_timeout, self.utilization(&key, now))
            .await
        {
            Ok(Ok(utilization)) => utilization,
            Ok(Err(err)) => {
                tracing::warn!(client = %client_id, error = %err, "redis status read failed");
                0.0
            }
            Err(_) => {
                tracing::warn!(client = %client_id, "redis status read timed out");
                0.0
            }
        };

        LimiterStatus {
            algorithm: self.config.algorithm,
            limit: self.config.limit,
            window_seconds: self.config.window_seconds,
            utilization,
        }
    }
}

fn decision_from(
    config: &EngineConfig,
    allowed: i64,
    remaining: i64,
    retry_ms: i64,
    now: f64,
) -> Decision {
    if allowed == 1 {
        Decision {
            allowed: true,
            remaining: remaining.max(0) as u64,
            limit: config.limit,
            reset_at: (now + config.window_seconds) as u64,
            retry_after: None,
        }
    } else {
        let retry_after = retry_ms.max(0) as f64 / 1000.0;
        Decision {
            allowed: false,
            remaining: 0,
            limit: config.limit,
            reset_at: (now + retry_after) as u64,
            retry_after: Some(retry_after),
        }
    }
}

fn fallback_decision(policy: FallbackPolicy, config: &EngineConfig, now: f64) -> Decision {
    match policy {
        FallbackPolicy::FailOpen => Decision {
            allowed: true,
            remaining: config.limit.saturating_sub(1) as u64,
            limit: config.limit,
            reset_at: (now + config.window_seconds) as u64,
            retry_after: None,
        },
        FallbackPolicy::FailClosed => Decision {
            allowed: false,
            remaining: 0,
            limit: config.limit,
            reset_at: (now + config.window_seconds) as u64,
            retry_after: Some(config.window_seconds),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::{FallbackPolicy, decision_from, fallback_decision};
    use crate::limiter::{Algorithm, EngineConfig};

    fn config() -> EngineConfig {
        EngineConfig::new(Algorithm::SlidingWindow, 10, 60.0)
    }

    #[test]
    fn parses_fallback_policies() {
        assert_eq!(
            "fail_open".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::FailOpen
        );
        assert_eq!(
            "FAIL_CLOSED".parse::<FallbackPolicy>().unwrap(),
            FallbackPolicy::FailClosed
        );
        assert!("panic".parse::<FallbackPolicy>().is_err());
    }

    #[test]
    fn fail_open_admits_with_a_fresh_window() {
        let decision = fallback_decision(FallbackPolicy::FailOpen, &config(), 1000.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert!(decision.retry_after.is_none());
        assert_eq!(decision.reset_at, 1060);
    }

    #[test]
    fn fail_closed_denies_with_a_retry_hint() {
        let decision = fallback_decision(FallbackPolicy::FailClosed, &config(), 1000.0);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after, Some(60.0));
    }

    #[test]
    fn script_replies_map_onto_decisions() {
        let allowed = decision_from(&config(), 1, 4, 0, 1000.0);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 4);
        assert!(allowed.retry_after.is_none());

        let denied = decision_from(&config(), 0, 0, 2500, 1000.0);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(2.5));
        assert_eq!(denied.reset_at, 1002);
    }
}
