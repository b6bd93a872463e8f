use std::{env, net::SocketAddr, time::Duration};

use anyhow::{Context, Result, anyhow};

use crate::limiter::{Algorithm, EngineConfig, redis_backend::FallbackPolicy};

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub engine: EngineConfig,
    /// Upper bound on clients tracked in memory; the stalest records are
    /// evicted past it.
    pub max_clients: usize,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    InMemory,
    Redis {
        url: String,
        key_prefix: String,
        timeout: Duration,
        fallback: FallbackPolicy,
    },
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let algorithm = env::var("RATE_LIMIT_ALGORITHM")
            .unwrap_or_else(|_| "token_bucket".to_string())
            .parse::<Algorithm>()?;

        let engine = EngineConfig {
            limit: parse_env("RATE_LIMIT_MAX_REQUESTS", 100u32),
            window_seconds: parse_env("RATE_LIMIT_WINDOW_SECONDS", 60.0f64),
            algorithm,
            burst_size: parse_opt_env("RATE_LIMIT_BURST_SIZE"),
            refill_rate: parse_opt_env("RATE_LIMIT_REFILL_RATE"),
            queue_capacity: parse_opt_env("RATE_LIMIT_QUEUE_CAPACITY"),
        };
        engine.validate()?;

        let backend = match env::var("RATE_LIMIT_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "memory" | "in_memory" => BackendConfig::InMemory,
            "redis" => BackendConfig::Redis {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
                key_prefix: env::var("REDIS_KEY_PREFIX")
                    .unwrap_or_else(|_| "ratelimit".to_string()),
                timeout: Duration::from_millis(parse_env("REDIS_TIMEOUT_MS", 250u64)),
                fallback: env::var("RATE_LIMIT_FALLBACK")
                    .unwrap_or_else(|_| "fail_open".to_string())
                    .parse::<FallbackPolicy>()?,
            },
            other => return Err(anyhow!("unsupported RATE_LIMIT_BACKEND: {other}")),
        };

        Ok(Self {
            bind_addr,
            engine,
            max_clients: parse_env("RATE_LIMIT_MAX_CLIENTS", 100_000usize),
            backend,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

fn parse_opt_env<T>(key: &str) -> Option<T>
where
    T: std::str::FromStr,
{
    env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}
