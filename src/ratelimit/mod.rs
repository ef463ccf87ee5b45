pub mod fixed_window;
pub mod key;
pub mod quota;
pub mod response;
pub mod service;
pub mod sliding_window;
pub mod token_bucket;

use std::{
    fmt,
    str::FromStr,
    sync::Arc,
};

use async_trait::async_trait;
use serde::Serialize;

use crate::{
    clock::Clock,
    config::MAX_WINDOW_SECONDS,
    store::{KvStore, StoreResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
            Self::FixedWindow => "fixed_window",
        }
    }

    /// Store key for this strategy's state. Each strategy owns its own entry.
    pub fn state_key(&self, key: &str) -> String {
        format!("{}:{}", key, self.as_str())
    }
}

impl fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            "fixed_window" => Ok(Self::FixedWindow),
            other => Err(format!("unsupported rate limit strategy: {other}")),
        }
    }
}

/// Window length in milliseconds, clamped to `1..=MAX_WINDOW_SECONDS` seconds.
pub fn window_millis(window_seconds: u64) -> i64 {
    window_seconds.clamp(1, MAX_WINDOW_SECONDS) as i64 * 1_000
}

/// Outcome of one limiter check. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitCheck {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    /// Epoch milliseconds.
    pub reset_time_ms: i64,
    pub retry_after_ms: Option<u64>,
}

impl RateLimitCheck {
    pub fn allowed(limit: u32, remaining: u32, reset_time_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining,
            limit,
            reset_time_ms,
            retry_after_ms: None,
        }
    }

    pub fn denied(limit: u32, remaining: u32, reset_time_ms: i64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            limit,
            reset_time_ms,
            retry_after_ms: Some(retry_after_ms),
        }
    }
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    fn strategy(&self) -> RateLimitStrategy;

    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
        weight: u32,
    ) -> StoreResult<RateLimitCheck>;
}

/// Dependencies shared by every limiter.
#[derive(Clone)]
pub struct LimiterDeps {
    pub store: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub cache_ttl_secs: u64,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_known_names() {
        assert_eq!(
            "token_bucket".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::TokenBucket
        );
        assert_eq!(
            "Sliding-Window".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::SlidingWindow
        );
        assert_eq!(
            " fixed_window ".parse::<RateLimitStrategy>().unwrap(),
            RateLimitStrategy::FixedWindow
        );
    }

    #[test]
    fn window_millis_is_clamped() {
        assert_eq!(window_millis(0), 1_000);
        assert_eq!(window_millis(60), 60_000);
        assert_eq!(window_millis(u64::MAX / 2), MAX_WINDOW_SECONDS as i64 * 1_000);
        assert_eq!(window_millis(u64::MAX), MAX_WINDOW_SECONDS as i64 * 1_000);
    }

    #[test]
    fn strategy_rejects_unknown_names() {
        let err = "leaky_bucket".parse::<RateLimitStrategy>().unwrap_err();
        assert!(err.contains("leaky_bucket"));
    }
}
