use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    clock::Clock,
    store::{KvStore, StoreResult},
};

struct Entry {
    value: String,
    expires_at_ms: i64,
}

/// Process-local store. Limits are per instance, not shared across replicas.
pub struct InMemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drops every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.now_ms();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at_ms > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.expires_at_ms <= now);
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let ttl_ms = i64::try_from(ttl_secs.max(1).saturating_mul(1_000)).unwrap_or(i64::MAX);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: self.clock.now_ms().saturating_add(ttl_ms),
            },
        );
        Ok(())
    }
}
