use async_trait::async_trait;

use crate::limiter::{
    Algorithm, Decision, EngineConfig, Limiter, LimiterStatus, store::ClientStore, unix_now,
};

#[derive(Debug, Clone)]
struct FixedWindowState {
    count: u32,
    window_start: f64,
}

impl FixedWindowState {
    fn is_sane(&self) -> bool {
        self.window_start.is_finite()
    }
}

/// Epoch-aligned window counter. Window boundaries fall on multiples of
/// `window_seconds` since the unix epoch, so independent processes agree on
/// them without coordination.
pub struct FixedWindowLimiter {
    config: EngineConfig,
    store: ClientStore<FixedWindowState>,
}

impl FixedWindowLimiter {
    pub fn new(config: EngineConfig, max_clients: usize) -> Self {
        Self {
            config,
            store: ClientStore::new(max_clients),
        }
    }

    fn aligned_start(&self, now: f64) -> f64 {
        let window = self.config.window_seconds;
        (now / window).floor() * window
    }

    fn check_at(&self, state: &mut FixedWindowState, now: f64) -> Decision {
        let window = self.config.window_seconds;
        let aligned = self.aligned_start(now);
        if aligned > state.window_start {
            state.window_start = aligned;
            state.count = 0;
        }

        let reset_at = (state.window_start + window) as u64;
        if state.count < self.config.limit {
            state.count += 1;
            Decision {
                allowed: true,
                remaining: (self.config.limit - state.count) as u64,
                limit: self.config.limit,
                reset_at,
                retry_after: None,
            }
        } else {
            Decision {
                allowed: false,
                remaining: 0,
                limit: self.config.limit,
                reset_at,
                retry_after: Some((state.window_start + window - now).max(0.0)),
            }
        }
    }

    fn count_at(&self, state: &FixedWindowState, now: f64) -> u32 {
        if self.aligned_start(now) > state.window_start {
            0
        } else {
            state.count
        }
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    async fn check(&self, client_id: &str) -> Decision {
        let now = unix_now();
        let aligned = self.aligned_start(now);
        self.store
            .update(
                client_id,
                now,
                || FixedWindowState {
                    count: 0,
                    window_start: aligned,
                },
                |state| {
                    if !state.is_sane() {
                        tracing::warn!(
                            client = %client_id,
                            "fixed window state out of bounds; resetting record"
                        );
                        *state = FixedWindowState {
                            count: 0,
                            window_start: aligned,
                        };
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
        let count = match self.store.peek(client_id).await {
            Some(state) => self.count_at(&state, now),
            None => 0,
        };

        LimiterStatus {
            algorithm: Algorithm::FixedWindow,
            limit: self.config.limit,
            window_seconds: self.config.window_seconds,
            utilization: (count as f64 / self.config.limit as f64).clamp(0.0, 1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FixedWindowLimiter, FixedWindowState};
    use crate::limiter::{Algorithm, EngineConfig, Limiter};

    fn limiter(limit: u32, window: f64) -> FixedWindowLimiter {
        FixedWindowLimiter::new(EngineConfig::new(Algorithm::FixedWindow, limit, window), 1024)
    }

    #[test]
    fn counts_reset_at_the_epoch_aligned_boundary() {
        let limiter = limiter(3, 60.0);
        let mut state = FixedWindowState {
            count: 0,
            window_start: 0.0,
        };

        for t in [0.0, 1.0, 2.0] {
            let decision = limiter.check_at(&mut state, t);
            assert!(decision.allowed);
        }

        let denied = limiter.check_at(&mut state, 3.0);
        assert!(!denied.allowed);
        assert!((denied.retry_after.unwrap() - 57.0).abs() < 1e-9);
        assert_eq!(denied.reset_at, 60);

        // The next aligned window opens at t=60.
        let decision = limiter.check_at(&mut state, 61.0);
        assert!(decision.allowed);
        assert_eq!(state.count, 1);
        assert_eq!(state.window_start, 60.0);
    }

    #[test]
    fn alignment_ignores_the_first_request_time() {
        let limiter = limiter(3, 60.0);
        let mut state = FixedWindowState {
            count: 0,
            window_start: 0.0,
        };

        // First request late in the window still rolls over at the epoch
        // multiple, not 60 s after the first request.
        assert!(limiter.check_at(&mut state, 59.0).allowed);
        assert_eq!(state.window_start, 0.0);
        assert!(limiter.check_at(&mut state, 60.0).allowed);
        assert_eq!(state.window_start, 60.0);
        assert_eq!(state.count, 1);
    }

    #[test]
    fn remaining_decrements_within_one_window() {
        let limiter = limiter(3, 60.0);
        let mut state = FixedWindowState {
            count: 0,
            window_start: 0.0,
        };

        assert_eq!(limiter.check_at(&mut state, 10.0).remaining, 2);
        assert_eq!(limiter.check_at(&mut state, 11.0).remaining, 1);
        assert_eq!(limiter.check_at(&mut state, 12.0).remaining, 0);
        assert_eq!(limiter.check_at(&mut state, 13.0).remaining, 0);
    }

    #[tokio::test]
    async fn status_reports_zero_after_the_window_lapses() {
        let limiter = limiter(3, 0.05);
        limiter.check("a").await;

        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        let status = limiter.status("a").await;
        assert_eq!(status.utilization, 0.0);
    }
}
