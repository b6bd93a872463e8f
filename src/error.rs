use thiserror::Error;

pub type LimiterResult<T> = Result<T, LimiterError>;

/// Failures the engine can surface. Only `Config` ever reaches an
/// integrator, and only at construction time; `StoreUnavailable` is
/// resolved internally by the backend's fallback policy before a decision
/// is returned.
#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("state store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<redis::RedisError> for LimiterError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<anyhow::Error> for LimiterError {
    fn from(err: anyhow::Error) -> Self {
        Self::Config(err.to_string())
    }
}
