// Redis connection and health check

use crate::config::RedisConfig;
use crate::errors::StorageError;
use redis::aio::ConnectionManager;
use redis::Client;
use tracing::{info, instrument};

/// Redis connection wrapper
///
/// A single multiplexed `ConnectionManager` is shared by every store so
/// reads observe the process's own writes.
#[derive(Clone)]
pub struct RedisPool {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisPool {
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        info!("Initializing Redis connection");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection initialized successfully");

        Ok(Self {
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Namespaced key: `<prefix>:<part>:<part>...`
    pub fn key(&self, parts: &[&str]) -> String {
        let mut key = self.key_prefix.clone();
        for part in parts {
            key.push(':');
            key.push_str(part);
        }
        key
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StorageError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
            key_prefix: "test".to_string(),
        }
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_health_check() {
        let pool = RedisPool::new(&config("redis://localhost:6379"))
            .await
            .unwrap();
        assert!(pool.health_check().await.is_ok());
        assert_eq!(pool.key(&["webhook", "abc"]), "test:webhook:abc");
    }

    #[tokio::test]
    async fn test_redis_pool_invalid_url() {
        let result = RedisPool::new(&config("not-a-url")).await;
        assert!(matches!(result, Err(StorageError::ConnectionFailed(_))));
    }
}
