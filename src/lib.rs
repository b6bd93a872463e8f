pub mod api;
pub mod config;
pub mod error;
pub mod limiter;

pub use error::{LimiterError, LimiterResult};
pub use limiter::{Algorithm, Decision, EngineConfig, Limiter, LimiterStatus};
