use async_trait::async_trait;

use crate::limiter::{
    Algorithm, Decision, EngineConfig, Limiter, LimiterStatus, store::ClientStore, unix_now,
};

#[derive(Debug, Clone)]
struct LeakyBucketState {
    depth: u32,
    last_leak: f64,
}

impl LeakyBucketState {
    fn fresh(now: f64) -> Self {
        Self {
            depth: 0,
            last_leak: now,
        }
    }

    fn is_sane(&self, capacity: u32) -> bool {
        self.depth <= capacity && self.last_leak.is_finite()
    }
}

/// Fixed-drain queue. Admitted requests occupy a slot until they leak out at
/// `limit / window_seconds` per second, so downstream traffic is smoothed
/// regardless of the arrival pattern.
pub struct LeakyBucketLimiter {
    config: EngineConfig,
    store: ClientStore<LeakyBucketState>,
}

impl LeakyBucketLimiter {
    pub fn new(config: EngineConfig, max_clients: usize) -> Self {
        Self {
            config,
            store: ClientStore::new(max_clients),
        }
    }

    /// Drains whole leaked slots since `last_leak`. The clock advances by
    /// the drained amount rather than to `now`, so truncated fractions of a
    /// slot are not lost; once the queue is empty the clock snaps to `now`
    /// to stop idle spans from accruing.
    fn leak(&self, state: &mut LeakyBucketState, now: f64) {
        let rate = self.config.leak_per_sec();
        let elapsed = (now - state.last_leak).max(0.0);
        let leaked = (elapsed * rate).floor();

        if leaked as u64 >= state.depth as u64 {
            state.depth = 0;
            state.last_leak = now;
        } else if leaked > 0.0 {
            state.depth -= leaked as u32;
            state.last_leak += leaked / rate;
        }
    }

    fn check_at(&self, state: &mut LeakyBucketState, now: f64) -> Decision {
        self.leak(state, now);
        let capacity = self.config.capacity();
        let rate = self.config.leak_per_sec();

        if state.depth < capacity {
            state.depth += 1;
            Decision {
                allowed: true,
                remaining: (capacity - state.depth) as u64,
                limit: self.config.limit,
                reset_at: (now + state.depth as f64 / rate) as u64,
                retry_after: None,
            }
        } else {
            let retry_after = (state.depth - capacity + 1) as f64 / rate;
            Decision {
                allowed: false,
                remaining: 0,
                limit: self.config.limit,
                reset_at: (now + retry_after) as u64,
                retry_after: Some(retry_after),
            }
        }
    }

    fn depth_at(&self, state: &LeakyBucketState, now: f64) -> u32 {
        let mut probe = state.clone();
        self.leak(&mut probe, now);
        probe.depth
    }
}

#[async_trait]
impl Limiter for LeakyBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::LeakyBucket
    }

    async fn check(&self, client_id: &str) -> Decision {
        let now = unix_now();
        let capacity = self.config.capacity();
        self.store
            .update(
                client_id,
                now,
                || LeakyBucketState::fresh(now),
                |state| {
                    if !state.is_sane(capacity) {
                        tracing::warn!(
                            client = %client_id,
                            "leaky bucket state out of bounds; resetting record"
                        );
                        *state = LeakyBucketState::fresh(now);
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
        let depth = match self.store.peek(client_id).await {
            Some(state) => self.depth_at(&state, now),
            None => 0,
        };

        LimiterStatus {
            algorithm: Algorithm::LeakyBucket,
            limit: self.config.limit,
            window_seconds: self.config.window_seconds,
            utilization: (depth as f64 / self.config.capacity() as f64).clamp(0.0, 1.0),
        }
    }
}
