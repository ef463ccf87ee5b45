use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    ratelimit::{LimiterDeps, RateLimitCheck, RateLimitStrategy, RateLimiter, window_millis},
    store::StoreResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub timestamp: i64,
    pub weight: u32,
}

/// Request log, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlidingWindowState {
    pub requests: Vec<WindowEntry>,
    pub window_size_ms: i64,
    pub max_requests: u32,
}

impl SlidingWindowState {
    fn empty(window_size_ms: i64, max_requests: u32) -> Self {
        Self {
            requests: Vec::new(),
            window_size_ms,
            max_requests,
        }
    }

    /// Keeps only entries with `timestamp > now - window_size_ms`.
    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_size_ms;
        self.requests.retain(|entry| entry.timestamp > cutoff);
    }

    fn usage(&self) -> u64 {
        self.requests.iter().map(|entry| entry.weight as u64).sum()
    }

    fn oldest_expiry(&self) -> Option<i64> {
        self.requests
            .iter()
            .map(|entry| entry.timestamp)
            .min()
            .map(|oldest| oldest + self.window_size_ms)
    }
}

/// Exact trailing-window log of weighted requests.
pub struct SlidingWindowLimiter {
    deps: LimiterDeps,
}

impl SlidingWindowLimiter {
    pub fn new(deps: LimiterDeps) -> Self {
        Self { deps }
    }

    async fn load(&self, state_key: &str) -> StoreResult<Option<SlidingWindowState>> {
        let Some(raw) = self.deps.store.get(state_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                tracing::warn!(key = %state_key, error = %err, "discarding undecodable sliding window state");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::SlidingWindow
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

        let mut state = self
            .load(&state_key)
            .await?
            .unwrap_or_else(|| SlidingWindowState::empty(window_size_ms, limit));
        state.window_size_ms = window_size_ms;
        state.max_requests = limit;
        state.prune(now);

        let usage = state.usage();
        if usage + weight as u64 <= limit as u64 {
            state.requests.push(WindowEntry {
                timestamp: now,
                weight,
            });
            let raw = serde_json::to_string(&state)?;
            self.deps
                .store
                .put(&state_key, &raw, self.deps.cache_ttl_secs)
                .await?;

            let remaining = limit as u64 - usage - weight as u64;
            let reset = state.oldest_expiry().unwrap_or(now + window_size_ms);
            Ok(RateLimitCheck::allowed(limit, remaining as u32, reset))
        } else {
            let reset = state.oldest_expiry().unwrap_or(now + window_size_ms);
            let retry_after = (reset - now).max(0) as u64;
            let remaining = (limit as u64).saturating_sub(usage) as u32;
            Ok(RateLimitCheck::denied(limit, remaining, reset, retry_after))
        }
    }
}
