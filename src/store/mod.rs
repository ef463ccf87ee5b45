pub mod in_memory;
pub mod redis_backend;

use async_trait::async_trait;
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation failed: {0}")]
    Operation(String),
    #[error("store timed out")]
    Timeout,
    #[error("state encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else {
            Self::Operation(err.to_string())
        }
    }
}

/// Keyed string storage with per-entry expiry.
///
/// Limiters treat every entry as one mutable value: read, mutate locally,
/// overwrite. Writes are unconditional.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;
}
