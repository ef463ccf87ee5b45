use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    ratelimit::{LimiterDeps, RateLimitCheck, RateLimitStrategy, RateLimiter},
    store::StoreResult,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenBucketState {
    pub tokens: f64,
    pub last_refill: i64,
    pub refill_rate: f64,
    pub max_tokens: u32,
}

impl TokenBucketState {
    fn full(limit: u32, refill_rate: f64, now_ms: i64) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: now_ms,
            refill_rate,
            max_tokens: limit,
        }
    }

    /// Adds the tokens accrued since `last_refill`, capped at `max_tokens`.
    fn refill(&mut self, now_ms: i64) {
        let elapsed_secs = now_ms.saturating_sub(self.last_refill).max(0) as f64 / 1_000.0;
        self.tokens =
            (self.tokens + elapsed_secs * self.refill_rate).clamp(0.0, self.max_tokens as f64);
        self.last_refill = self.last_refill.max(now_ms);
    }

    fn millis_until(&self, tokens: f64) -> u64 {
        let deficit = (tokens - self.tokens).max(0.0);
        (deficit / self.refill_rate * 1_000.0).ceil() as u64
    }
}

/// Continuously refilling bucket: `limit` tokens per `window_seconds`.
pub struct TokenBucketLimiter {
    deps: LimiterDeps,
}

impl TokenBucketLimiter {
    pub fn new(deps: LimiterDeps) -> Self {
        Self { deps }
    }

    async fn load(&self, state_key: &str) -> StoreResult<Option<TokenBucketState>> {
        let Some(raw) = self.deps.store.get(state_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(state) => Ok(Some(state)),
            Err(err) => {
                tracing::warn!(key = %state_key, error = %err, "discarding undecodable token bucket state");
                Ok(None)
            }
        }
    }

    async fn save(&self, state_key: &str, state: &TokenBucketState) -> StoreResult<()> {
        let raw = serde_json::to_string(state)?;
        self.deps
            .store
            .put(state_key, &raw, self.deps.cache_ttl_secs)
            .await
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn strategy(&self) -> RateLimitStrategy {
        RateLimitStrategy::TokenBucket
    }

    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
        weight: u32,
    ) -> StoreResult<RateLimitCheck> {
        let state_key = self.strategy().state_key(key);
        let refill_rate = limit as f64 / window_seconds.max(1) as f64;
        let now = self.deps.clock.now_ms();

        let mut state = self
            .load(&state_key)
            .await?
            .unwrap_or_else(|| TokenBucketState::full(limit, refill_rate, now));

        // Configuration may have changed since the state was written.
        state.max_tokens = limit;
        state.refill_rate = refill_rate;
        state.refill(now);

        let weight = weight as f64;
        if state.tokens >= weight {
            state.tokens -= weight;
            self.save(&state_key, &state).await?;

            let until_full = state.millis_until(limit as f64) as i64;
            Ok(RateLimitCheck::allowed(
                limit,
                state.tokens.floor() as u32,
                now + until_full,
            ))
        } else {
            self.save(&state_key, &state).await?;

            let wait = state.millis_until(weight);
            Ok(RateLimitCheck::denied(
                limit,
                state.tokens.floor() as u32,
                now + wait as i64,
                wait,
            ))
        }
    }
}
