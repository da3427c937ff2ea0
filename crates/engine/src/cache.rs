//! Redis-backed status cache with a fixed TTL.
//!
//! The cache is never authoritative: callers treat misses, errors and
//! unparseable values alike and fall back to the store.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use herald_common::error::AppError;

#[async_trait]
pub trait StatusCache: Send + Sync {
    /// `Ok(None)` on a miss.
    async fn get(&self, key: &str) -> Result<Option<String>, AppError>;

    /// Store `value` under `key` with the deployment's TTL.
    async fn set(&self, key: &str, value: &str) -> Result<(), AppError>;

    /// Like `set`, but leaves an existing value untouched. Returns whether the
    /// value was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AppError>;
}

/// Cache key for a notification's status.
pub fn status_key(id: i64) -> String {
    format!("notification:status:{}", id)
}

/// Redis-backed status cache.
#[derive(Clone)]
pub struct RedisStatusCache {
    redis: ConnectionManager,
    ttl_secs: u64,
}

impl RedisStatusCache {
    pub fn new(redis: ConnectionManager, ttl: Duration) -> Self {
        Self {
            redis,
            // SET EX rejects a zero TTL
            ttl_secs: ttl.as_secs().max(1),
        }
    }
}

#[async_trait]
impl StatusCache for RedisStatusCache {
    async fn get(&self, key: &str) -> Result<Option<String>, AppError> {
        let mut redis = self.redis.clone();
        let value: Option<String> = redis.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), AppError> {
        let mut redis = self.redis.clone();
        redis.set_ex::<_, _, ()>(key, value, self.ttl_secs).await?;
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, AppError> {
        let mut redis = self.redis.clone();
        // SET key value NX EX ttl; nil when the key already exists
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_secs)
            .query_async(&mut redis)
            .await?;
        Ok(result.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_key_format() {
        assert_eq!(status_key(42), "notification:status:42");
    }
}
