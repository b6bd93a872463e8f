use std::{collections::HashMap, sync::Arc};

use crate::{
    config::{BackendConfig, ServiceConfig},
    error::{LimiterError, LimiterResult},
    limiter::{
        Algorithm, EngineConfig, Limiter, fixed_window::FixedWindowLimiter,
        leaky_bucket::LeakyBucketLimiter, redis_backend::RedisLimiter,
        sliding_window::SlidingWindowLimiter, token_bucket::TokenBucketLimiter,
    },
};

pub type EngineCtor = fn(EngineConfig, usize) -> Arc<dyn Limiter>;

/// Lookup table from algorithm tag to engine constructor. New algorithms
/// register a constructor; existing entries are never touched.
pub struct Registry {
    ctors: HashMap<Algorithm, EngineCtor>,
}

impl Registry {
    pub fn with_defaults() -> Self {
        let mut registry = Self {
            ctors: HashMap::new(),
        };
        registry.register(Algorithm::TokenBucket, |config, max_clients| {
            Arc::new(TokenBucketLimiter::new(config, max_clients))
        });
        registry.register(Algorithm::SlidingWindow, |config, max_clients| {
            Arc::new(SlidingWindowLimiter::new(config, max_clients))
        });
        registry.register(Algorithm::LeakyBucket, |config, max_clients| {
            Arc::new(LeakyBucketLimiter::new(config, max_clients))
        });
        registry.register(Algorithm::FixedWindow, |config, max_clients| {
            Arc::new(FixedWindowLimiter::new(config, max_clients))
        });
        registry
    }

    pub fn register(&mut self, algorithm: Algorithm, ctor: EngineCtor) {
        self.ctors.insert(algorithm, ctor);
    }

    /// Validates the config and constructs the matching engine. Fails fast
    /// here so request-time code never sees an invalid quota.
    pub fn create(
        &self,
        config: EngineConfig,
        max_clients: usize,
    ) -> LimiterResult<Arc<dyn Limiter>> {
        config.validate()?;
        let ctor = self.ctors.get(&config.algorithm).ok_or_else(|| {
            LimiterError::Config(format!(
                "no engine registered for algorithm {}",
                config.algorithm
            ))
        })?;
        Ok(ctor(config, max_clients))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Builds the limiter described by the service config: registry-selected
/// in-memory engine, or the Redis-coordinated variant for multi-process
/// deployments.
pub async fn build_limiter(config: &ServiceConfig) -> LimiterResult<Arc<dyn Limiter>> {
    match &config.backend {
        BackendConfig::InMemory => {
            Registry::with_defaults().create(config.engine.clone(), config.max_clients)
        }
        BackendConfig::Redis {
            url,
            key_prefix,
            timeout,
            fallback,
        } => {
            config.engine.validate()?;
            let limiter = RedisLimiter::connect(
                url.clone(),
                key_prefix.clone(),
                config.engine.clone(),
                *fallback,
                *timeout,
            )
            .await?;
            Ok(Arc::new(limiter))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Registry;
    use crate::limiter::{Algorithm, EngineConfig, Limiter};

    #[test]
    fn builds_every_registered_algorithm() {
        let registry = Registry::with_defaults();
        for algorithm in [
            Algorithm::TokenBucket,
            Algorithm::SlidingWindow,
            Algorithm::LeakyBucket,
            Algorithm::FixedWindow,
        ] {
            let limiter = registry
                .create(EngineConfig::new(algorithm, 10, 60.0), 1024)
                .unwrap();
            assert_eq!(limiter.algorithm(), algorithm);
        }
    }

    #[test]
    fn rejects_invalid_configs_at_construction() {
        let registry = Registry::with_defaults();
        let config = EngineConfig::new(Algorithm::TokenBucket, 0, 60.0);
        assert!(registry.create(config, 1024).is_err());

        let config = EngineConfig {
            burst_size: Some(1),
            ..EngineConfig::new(Algorithm::TokenBucket, 10, 60.0)
        };
        assert!(registry.create(config, 1024).is_err());
    }
}
