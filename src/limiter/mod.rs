pub mod factory;
pub mod fixed_window;
pub mod leaky_bucket;
pub mod redis_backend;
pub mod sliding_window;
pub mod store;
pub mod token_bucket;

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LimiterError;

/// Available admission-control algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    LeakyBucket,
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
            Self::LeakyBucket => "leaky_bucket",
            Self::FixedWindow => "fixed_window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            "leaky_bucket" => Ok(Self::LeakyBucket),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(LimiterError::Config(format!(
                "unknown rate limit algorithm: {other}"
            ))),
        }
    }
}

/// Parameters for one limiter instance. `burst_size`, `refill_rate` and
/// `queue_capacity` default from `limit`/`window_seconds` when unset; the
/// effective values are exposed through [`EngineConfig::burst`],
/// [`EngineConfig::refill_per_sec`] and [`EngineConfig::capacity`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub limit: u32,
    pub window_seconds: f64,
    pub algorithm: Algorithm,
    pub burst_size: Option<u32>,
    pub refill_rate: Option<f64>,
    pub queue_capacity: Option<u32>,
}

impl EngineConfig {
    pub fn new(algorithm: Algorithm, limit: u32, window_seconds: f64) -> Self {
        Self {
            limit,
            window_seconds,
            algorithm,
            burst_size: None,
            refill_rate: None,
            queue_capacity: None,
        }
    }

    /// Rejects parameter combinations that could never enforce a quota.
    /// Runs once at construction; request-time code assumes a valid config.
    pub fn validate(&self) -> Result<(), LimiterError> {
        if self.limit == 0 {
            return Err(LimiterError::Config("limit must be positive".into()));
        }
        if !self.window_seconds.is_finite() || self.window_seconds <= 0.0 {
            return Err(LimiterError::Config(
                "window_seconds must be positive".into(),
            ));
        }
        if let Some(burst) = self.burst_size
            && burst < self.limit
        {
            return Err(LimiterError::Config(format!(
                "burst_size {} must be >= limit {}",
                burst, self.limit
            )));
        }
        if let Some(rate) = self.refill_rate
            && (!rate.is_finite() || rate <= 0.0)
        {
            return Err(LimiterError::Config("refill_rate must be > 0".into()));
        }
        if let Some(capacity) = self.queue_capacity
            && capacity < self.limit
        {
            return Err(LimiterError::Config(format!(
                "queue_capacity {} must be >= limit {}",
                capacity, self.limit
            )));
        }
        Ok(())
    }

    /// Maximum instantaneous token-bucket burst.
    pub fn burst(&self) -> u32 {
        self.burst_size.unwrap_or(self.limit)
    }

    /// Token-bucket refill rate in tokens per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_rate
            .unwrap_or(self.limit as f64 / self.window_seconds)
    }

    /// Leaky-bucket queue capacity.
    pub fn capacity(&self) -> u32 {
        self.queue_capacity.unwrap_or(self.limit)
    }

    /// Leaky-bucket drain rate in requests per second.
    pub fn leak_per_sec(&self) -> f64 {
        self.limit as f64 / self.window_seconds
    }
}

/// Outcome of one admission check. `retry_after` is populated exactly when
/// the request was denied.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u32,
    /// Unix timestamp (seconds) at which the client's quota fully recovers.
    pub reset_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<f64>,
}

/// Read-only view of one client's quota, returned by [`Limiter::status`].
#[derive(Debug, Clone, Serialize)]
pub struct LimiterStatus {
    pub algorithm: Algorithm,
    pub limit: u32,
    pub window_seconds: f64,
    /// Fraction of the quota currently consumed, in `[0, 1]`.
    pub utilization: f64,
}

/// The admission API. `check` always resolves to a valid [`Decision`]:
/// backend failures are absorbed by the configured fallback policy rather
/// than surfaced to callers.
#[async_trait]
pub trait Limiter: Send + Sync {
    fn algorithm(&self) -> Algorithm;

    async fn check(&self, client_id: &str) -> Decision;

    async fn reset(&self, client_id: &str);

    async fn status(&self, client_id: &str) -> LimiterStatus;
}

/// Wall-clock time as fractional unix seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
