//! Redis-backed [`Cache`].
//!
//! All agents point at the same Redis instance. Conditional writes map to
//! `SET .. NX PX`, and compare-and-delete and compare-and-replace run as Lua
//! scripts so they stay atomic on the server.

use super::Cache;
use crate::config::CacheConfig;
use crate::error::{Result, StateError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

const DELETE_IF_EQ: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const REPLACE_IF_EQ: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    redis.call('set', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
else
    return 0
end
"#;

/// Connection parameters for [`RedisCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisCacheConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub connection_timeout: Duration,
}

impl RedisCacheConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            db: 0,
            connection_timeout: Duration::from_secs(5),
        }
    }

    pub fn uri(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl From<&CacheConfig> for RedisCacheConfig {
    fn from(config: &CacheConfig) -> Self {
        Self {
            host: config.redis_host.clone(),
            port: config.redis_port,
            db: config.redis_db,
            connection_timeout: config.connection_timeout(),
        }
    }
}

/// Shared cache on a multiplexed Redis connection.
#[derive(Clone)]
pub struct RedisCache {
    connection: ConnectionManager,
}

impl RedisCache {
    #[instrument(skip_all, fields(host = %config.host, port = config.port, db = config.db))]
    pub async fn connect(config: &RedisCacheConfig) -> Result<Self> {
        let client = Client::open(config.uri())?;
        let connection = tokio::time::timeout(
            config.connection_timeout,
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| {
            StateError::state_access(
                "redis connect",
                format!("{} not reachable within {:?}", config.uri(), config.connection_timeout),
            )
        })??;

        info!("Connected to Redis NAT cache");
        Ok(Self { connection })
    }

    fn ttl_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    #[instrument(skip(self, value))]
    async fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, value))]
    async fn put_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let written: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;

        debug!(key, written, "SET NX");
        Ok(written)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    #[instrument(skip(self, expected))]
    async fn delete_if_eq(&self, key: &str, expected: &[u8]) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = redis::Script::new(DELETE_IF_EQ)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        debug!(key, removed, "DELETE IF EQUAL");
        Ok(removed > 0)
    }

    #[instrument(skip(self, expected, value))]
    async fn replace_if_eq(
        &self,
        key: &str,
        expected: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection.clone();
        let replaced: i64 = redis::Script::new(REPLACE_IF_EQ)
            .key(key)
            .arg(expected)
            .arg(value)
            .arg(Self::ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        debug!(key, replaced, "REPLACE IF EQUAL");
        Ok(replaced > 0)
    }
}
