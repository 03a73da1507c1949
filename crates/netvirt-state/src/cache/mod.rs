//! Expiring key-value cache shared by agents.
//!
//! Keys are plain strings that every agent derives the same way, values are
//! opaque bytes, and every write carries a TTL after which the entry
//! vanishes on its own. Only single-key operations are atomic.

mod local;
#[cfg(feature = "redis")]
mod redis_backend;

pub use local::LocalCache;
#[cfg(feature = "redis")]
pub use redis_backend::{RedisCache, RedisCacheConfig};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[async_trait]
pub trait Cache: Send + Sync {
    /// Returns the live value under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Stores `value`, replacing any existing entry and its TTL.
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Stores `value` only when no live entry exists. Returns whether the
    /// write happened.
    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Removes `key`. Missing keys are not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes `key` only while its value still equals `expected`.
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Stores `value` with a fresh TTL only while the live value equals
    /// `expected`. A missing key is never recreated.
    async fn replace_if_eq(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool>;
}

/// Opens the backend selected by `config`.
pub async fn open_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>> {
    match config.backend {
        CacheBackend::Local => {
            info!("Using in-process NAT cache");
            Ok(Arc::new(LocalCache::new()))
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            let cache = RedisCache::connect(&RedisCacheConfig::from(config)).await?;
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => Err(crate::error::StateError::invalid_config(
            "cache.backend",
            "built without redis support",
        )),
    }
}
