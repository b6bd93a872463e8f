use async_trait::async_trait;

use crate::limiter::{
    Algorithm, Decision, EngineConfig, Limiter, LimiterStatus, store::ClientStore, unix_now,
};

#[derive(Debug, Clone)]
struct TokenBucketState {
    tokens: f64,
    last_refill: f64,
}

impl TokenBucketState {
    fn fresh(burst: u32, now: f64) -> Self {
        Self {
            tokens: burst as f64,
            last_refill: now,
        }
    }

    fn is_sane(&self, burst: u32) -> bool {
        self.tokens.is_finite()
            && self.last_refill.is_finite()
            && (0.0..=burst as f64).contains(&self.tokens)
    }
}

/// Continuous-refill token bucket. Tokens accrue at `refill_per_sec` up to
/// `burst`, and each admitted request consumes one, so refill is smooth
/// across window boundaries while instantaneous bursts stay capped.
pub struct TokenBucketLimiter {
    config: EngineConfig,
    store: ClientStore<TokenBucketState>,
}

impl TokenBucketLimiter {
    pub fn new(config: EngineConfig, max_clients: usize) -> Self {
        Self {
            config,
            store: ClientStore::new(max_clients),
        }
    }

    fn check_at(&self, state: &mut TokenBucketState, now: f64) -> Decision {
        let burst = self.config.burst() as f64;
        let rate = self.config.refill_per_sec();

        let elapsed = (now - state.last_refill).max(0.0);
        state.tokens = (state.tokens + elapsed * rate).min(burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Decision {
                allowed: true,
                remaining: state.tokens.floor() as u64,
                limit: self.config.limit,
                reset_at: (now + self.config.window_seconds) as u64,
                retry_after: None,
            }
        } else {
            let retry_after = (1.0 - state.tokens) / rate;
            Decision {
                allowed: false,
                remaining: 0,
                limit: self.config.limit,
                reset_at: (now + retry_after) as u64,
                retry_after: Some(retry_after),
            }
        }
    }

    fn tokens_at(&self, state: &TokenBucketState, now: f64) -> f64 {
        let elapsed = (now - state.last_refill).max(0.0);
        (state.tokens + elapsed * self.config.refill_per_sec()).min(self.config.burst() as f64)
    }
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    async fn check(&self, client_id: &str) -> Decision {
        let now = unix_now();
        let burst = self.config.burst();
        self.store
            .update(
                client_id,
                now,
                || TokenBucketState::fresh(burst, now),
                |state| {
                    if !state.is_sane(burst) {
                        tracing::warn!(
                            client = %client_id,
                            "token bucket state out of bounds; resetting record"
                        );
                        *state = TokenBucketState::fresh(burst, now);
                    }
                    self.check_at(state, now)
                },
            )
            .await
    }

    async fn reset(&self, client_id: &str) {
        self.store.remove(client_id);
        tracing::debug!(client = %client_id, "rate limit reset");
    }

    async fn status(&self, client_id: &str) -> LimiterStatus {
        let now = unix_now();
        let burst = self.config.burst() as f64;
        let tokens = match self.store.peek(client_id).await {
            Some(state) => self.tokens_at(&state, now),
            None => burst,
        };

        LimiterStatus {
            algorithm: Algorithm::TokenBucket,
            limit: self.config.limit,
            window_seconds: self.config.window_seconds,
            utilization: ((burst - tokens) / burst).clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{TokenBucketLimiter, TokenBucketState};
    use crate::limiter::{Algorithm, EngineConfig, Limiter};

    fn limiter(limit: u32, window: f64) -> TokenBucketLimiter {
        TokenBucketLimiter::new(
            EngineConfig::new(Algorithm::TokenBucket, limit, window),
            1024,
        )
    }

    #[test]
    fn consumes_one_token_per_allowed_request() {
        let limiter = limiter(10, 60.0);
        let mut state = TokenBucketState::fresh(10, 0.0);

        let decision = limiter.check_at(&mut state, 0.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
        assert!(decision.retry_after.is_none());
    }

    #[test]
    fn denies_when_empty_with_time_to_next_token() {
        let limiter = limiter(10, 60.0);
        let mut state = TokenBucketState::fresh(10, 0.0);

        for _ in 0..10 {
            assert!(limiter.check_at(&mut state, 0.0).allowed);
        }

        let denied = limiter.check_at(&mut state, 0.0);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        // One token at 10 tokens / 60 s takes 6 s to accrue.
        let retry = denied.retry_after.unwrap();
        assert!((retry - 6.0).abs() < 1e-9);
    }

    #[test]
    fn refills_to_burst_and_never_past_it() {
        let limiter = limiter(10, 60.0);
        let mut state = TokenBucketState {
            tokens: 0.0,
            last_refill: 100.0,
        };

        // Exactly burst / refill_rate seconds later the bucket is full again.
        let decision = limiter.check_at(&mut state, 160.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);

        // Idling far longer does not overfill.
        let mut state = TokenBucketState {
            tokens: 0.0,
            last_refill: 100.0,
        };
        let decision = limiter.check_at(&mut state, 10_000.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn partial_refill_grants_partial_tokens() {
        let limiter = limiter(10, 60.0);
        let mut state = TokenBucketState {
            tokens: 0.0,
            last_refill: 0.0,
        };

        // 6 s at 1/6 token per second is exactly one token.
        let decision = limiter.check_at(&mut state, 6.0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);

        let denied = limiter.check_at(&mut state, 6.0);
        assert!(!denied.allowed);
    }

    #[test]
    fn burst_override_caps_the_bucket() {
        let config = EngineConfig {
            burst_size: Some(20),
            ..EngineConfig::new(Algorithm::TokenBucket, 10, 60.0)
        };
        let limiter = TokenBucketLimiter::new(config, 1024);
        let mut state = TokenBucketState::fresh(20, 0.0);

        for expected in (0..20).rev() {
            let decision = limiter.check_at(&mut state, 0.0);
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }
        assert!(!limiter.check_at(&mut state, 0.0).allowed);
    }

    #[tokio::test]
    async fn corrupt_state_self_heals() {
        let limiter = limiter(10, 60.0);
        limiter
            .store
            .update(
                "c",
                0.0,
                || TokenBucketState {
                    tokens: f64::NAN,
                    last_refill: 0.0,
                },
                |_| (),
            )
            .await;

        let decision = limiter.check("c").await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }
}
