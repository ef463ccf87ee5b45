use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    ratelimit::{LimiterDeps, RateLimitCheck, RateLimitStrategy, RateLimiter, window_millis},
    store::StoreResult,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixedWindowState {
    pub count: u32,
    pub window_start: i64,
    pub window_size_ms: i64,
    pub max_requests: u32,
}

pub fn aligned_window_start(now_ms: i64, window_size_ms: i64) -> i64 {
    now_ms.div_euclid(window_size_ms) * window_size_ms
}

/// Counter per aligned interval. A client can spend `limit` at the end of one
/// window and `limit` again at the start of the next.
pub struct FixedWindowLimiter {
    deps: LimiterDeps,
}

impl FixedWindowLimiter {
    pub fn new(deps: LimiterDeps) -> Self {
        Self { deps }
    }

    async fn load(&self, state_key: &str) -> StoreResult<Option<FixedWindowState>> {
        let Some(raw) = self.deps.store.get(state_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                tracing::warn!(key = %state_key, error = %err, "discarding undecodable fixed window state");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::FixedWindow
    }

    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
        weight: u32,
    ) -> StoreResult<RateLimitCheck> {
        let state_key = self.strategy().state_key(key);
        let window_size_ms = window_millis(window_seconds);
        let now = self.deps.clock.now_ms();
        let current_start = aligned_window_start(now, window_size_ms);
        let window_end = current_start + window_size_ms;

        let mut state = self
            .load(&state_key)
            .await?
            .unwrap_or(FixedWindowState {
                count: 0,
                window_start: current_start,
                window_size_ms,
                max_requests: limit,
            });

        if state.window_start < current_start || state.window_size_ms != window_size_ms {
            state.count = 0;
            state.window_start = current_start;
        }
        state.window_size_ms = window_size_ms;
        state.max_requests = limit;

        if state.count as u64 + weight as u64 <= limit as u64 {
            state.count += weight;
            let raw = serde_json::to_string(&state)?;
            self.deps
                .store
                .put(&state_key, &raw, self.deps.cache_ttl_secs)
                .await?;

            Ok(RateLimitCheck::allowed(
                limit,
                limit - state.count,
                window_end,
            ))
        } else {
            Ok(RateLimitCheck::denied(
                limit,
                limit.saturating_sub(state.count),
                window_end,
                (window_end - now) as u64,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ratelimit::testing::deps_at, store::KvStore};

    async fn stored(store: &dyn KvStore) -> FixedWindowState {
        let raw = store.get("k:fixed_window").await.unwrap().unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn aligns_to_interval_boundaries() {
        assert_eq!(aligned_window_start(0, 1_000), 0);
        assert_eq!(aligned_window_start(999, 1_000), 0);
        assert_eq!(aligned_window_start(1_000, 1_000), 1_000);
        assert_eq!(aligned_window_start(61_234, 60_000), 60_000);
    }

    #[tokio::test]
    async fn resets_when_crossing_into_next_window() {
        let (deps, clock, store) = deps_at(500);
        let limiter = FixedWindowLimiter::new(deps);

        let first = limiter.check("k", 2, 1, 1).await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        clock.set(600);
        assert_eq!(limiter.check("k", 2, 1, 1).await.unwrap().remaining, 0);

        clock.set(700);
        let denied = limiter.check("k", 2, 1, 1).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_time_ms, 1_000);
        assert_eq!(denied.retry_after_ms, Some(300));

        clock.set(1_001);
        let check = limiter.check("k", 2, 1, 1).await.unwrap();
        assert!(check.allowed);
        let state = stored(store.as_ref()).await;
        assert_eq!(state.window_start, 1_000);
        assert_eq!(state.count, 1);
    }

    #[tokio::test]
    async fn allows_double_burst_across_boundary() {
        let (deps, clock, _store) = deps_at(0);
        let limiter = FixedWindowLimiter::new(deps);

        clock.set(9_990);
        for _ in 0..5 {
            assert!(limiter.check("k", 5, 10, 1).await.unwrap().allowed);
        }
        assert!(!limiter.check("k", 5, 10, 1).await.unwrap().allowed);

        clock.set(10_000);
        for _ in 0..5 {
            assert!(limiter.check("k", 5, 10, 1).await.unwrap().allowed);
        }
        assert!(!limiter.check("k", 5, 10, 1).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn count_never_exceeds_limit_within_a_window() {
        let (deps, clock, store) = deps_at(0);
        let limiter = FixedWindowLimiter::new(deps);

        for step in 0..50 {
            clock.set(step * 100);
            limiter.check("k", 4, 2, (step % 2 + 1) as u32).await.unwrap();
            assert!(stored(store.as_ref()).await.count <= 4);
        }
    }

    #[tokio::test]
    async fn denial_leaves_counter_untouched() {
        let (deps, _clock, store) = deps_at(0);
        let limiter = FixedWindowLimiter::new(deps);

        limiter.check("k", 3, 60, 2).await.unwrap();
        let before = stored(store.as_ref()).await;
        assert!(!limiter.check("k", 3, 60, 2).await.unwrap().allowed);
        assert_eq!(stored(store.as_ref()).await, before);
    }
}
