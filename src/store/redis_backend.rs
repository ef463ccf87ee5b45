use async_trait::async_trait;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
};

use crate::store::{KvStore, StoreError, StoreResult};

pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisStore {
    pub async fn new(url: String, key_prefix: String) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            manager,
            key_prefix,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(self.key(key), value, ttl_secs.max(1))
            .await?;
        Ok(())
    }
}
