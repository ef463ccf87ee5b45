use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;

use crate::{
    clock::Clock,
    ratelimit::{RateLimitCheck, fixed_window::aligned_window_start, window_millis},
};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota service unavailable: {0}")]
    Unavailable(String),
    #[error("no fallback quota configured")]
    NotConfigured,
}

/// Secondary check consulted when the primary store cannot be reached.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
        weight: u32,
    ) -> Result<RateLimitCheck, QuotaError>;
}

struct QuotaWindow {
    start_ms: i64,
    end_ms: i64,
    used: u64,
}

/// Per-process aligned-window quota. Approximate in a multi-node deployment,
/// but it has no dependency on the shared store.
pub struct LocalQuota {
    windows: DashMap<String, QuotaWindow>,
    clock: Arc<dyn Clock>,
}

impl LocalQuota {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: DashMap::new(),
            clock,
        }
    }

    /// Drops windows that have already ended.
    pub fn evict_stale(&self) {
        let now = self.clock.now_ms();
        self.windows.retain(|_, window| window.end_ms > now);
    }
}

#[async_trait]
impl QuotaService for LocalQuota {
    async fn check(
        &self,
        key: &str,
        limit: u32,
        window_seconds: u64,
        weight: u32,
    ) -> Result<RateLimitCheck, QuotaError> {
        let window_ms = window_millis(window_seconds);
        let now = self.clock.now_ms();
        let start = aligned_window_start(now, window_ms);
        let end = start + window_ms;

        let mut window = self
            .windows
            .entry(key.to_string())
            .or_insert(QuotaWindow {
                start_ms: start,
                end_ms: end,
                used: 0,
            });
        if window.start_ms < start {
            window.start_ms = start;
            window.end_ms = end;
            window.used = 0;
        }

        if window.used + weight as u64 <= limit as u64 {
            window.used += weight as u64;
            Ok(RateLimitCheck::allowed(
                limit,
                (limit as u64 - window.used) as u32,
                end,
            ))
        } else {
            Ok(RateLimitCheck::denied(
                limit,
                (limit as u64).saturating_sub(window.used) as u32,
                end,
                (end - now) as u64,
            ))
        }
    }
}
