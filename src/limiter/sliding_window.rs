use std::collections::VecDeque;

use async_trait::async_trait;

use crate::limiter::{
    Algorithm, Decision, EngineConfig, Limiter, LimiterStatus, store::ClientStore, unix_now,
};

#[derive(Debug, Clone, Default)]
struct SlidingWindowState {
    /// Timestamps of admitted requests, ascending, all within the window.
    /// Denied requests are never recorded, so the deque holds at most
    /// `limit` entries per client.
    hits: VecDeque<f64>,
}

impl SlidingWindowState {
    fn is_sane(&self, limit: u32) -> bool {
        self.hits.len() <= limit as usize && self.hits.iter().all(|t| t.is_finite())
    }
}

/// Rolling request log. Exact over any interval of `window_seconds`, at the
/// cost of remembering one timestamp per admitted request.
pub struct SlidingWindowLimiter {
    config: EngineConfig,
    store: ClientStore<SlidingWindowState>,
}

impl SlidingWindowLimiter {
    pub fn new(config: EngineConfig, max_clients: usize) -> Self {
        Self {
            config,
            store: ClientStore::new(max_clients),
        }
    }

    fn check_at(&self, state: &mut SlidingWindowState, now: f64) -> Decision {
        let window = self.config.window_seconds;
        let cutoff = now - window;
        while state.hits.front().is_some_and(|&t| t <= cutoff) {
            state.hits.pop_front();
        }

        let count = state.hits.len() as u32;
        if count < self.config.limit {
            state.hits.push_back(now);
            let oldest = state.hits.front().copied().unwrap_or(now);
            Decision {
                allowed: true,
                remaining: (self.config.limit - count - 1) as u64,
                limit: self.config.limit,
                reset_at: (oldest + window) as u64,
                retry_after: None,
            }
        } else {
            let oldest = state.hits.front().copied().unwrap_or(now);
            let retry_after = (window - (now - oldest)).max(0.0);
            Decision {
                allowed: false,
                remaining: 0,
                limit: self.config.limit,
                reset_at: (oldest + window) as u64,
                retry_after: Some(retry_after),
            }
        }
    }

    fn count_at(&self, state: &SlidingWindowState, now: f64) -> usize {
        let cutoff = now - self.config.window_seconds;
        state.hits.iter().filter(|&&t| t > cutoff).count()
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    async fn check(&self, client_id: &str) -> Decision {
        let now = unix_now();
        let limit = self.config.limit;
        self.store
            .update(client_id, now, SlidingWindowState::default, |state| {
                if !state.is_sane(limit) {
                    tracing::warn!(
                        client = %client_id,
                        "sliding window state out of bounds; resetting record"
                    );
                    *state = SlidingWindowState::default();
                }
                self.check_at(state, now)
            })
            .await
    }

    async fn reset(&self, client_id: &str) {
        self.store.remove(client_id);
        tracing::debug!(client = %client_id, "rate limit reset");
    }

    async fn status(&self, client_id: &str) -> LimiterStatus {
        let now = unix_now();
        let count = match self.store.peek(client_id).await {
            Some(state) => self.count_at(&state, now),
            None => 0,
        };

        LimiterStatus {
            algorithm: Algorithm::SlidingWindow,
            limit: self.config.limit,
            window_seconds: self.config.window_seconds,
            utilization: (count as f64 / self.config.limit as f64).clamp(0.0, 1.0),
        }
    }
}
