//! Shared cache client.
//!
//! All cross-instance coordination state lives here: rate-limit counters,
//! circuit state, violation counters, the token blacklist, and the blocked-IP
//! fast path. Atomic read-modify-write operations go through `redis::Script`;
//! this wrapper only carries the plain commands.

use anyhow::Result;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Shared cache handle with automatic reconnection. Cloning is cheap; the
/// underlying connection is multiplexed.
#[derive(Clone)]
pub struct SharedCache {
    conn: ConnectionManager,
}

impl SharedCache {
    /// Connect to the shared cache. Supports redis:// and rediss:// URLs.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Raw connection, for `redis::Script` invocations.
    pub fn connection_mut(&mut self) -> &mut ConnectionManager {
        &mut self.conn
    }

    pub async fn ping(&mut self) -> Result<(), redis::RedisError> {
        redis::cmd("PING").query_async::<()>(&mut self.conn).await
    }

    pub async fn get<T: redis::FromRedisValue>(
        &mut self,
        key: &str,
    ) -> Result<Option<T>, redis::RedisError> {
        self.conn.get(key).await
    }

    pub async fn set_ex(
        &mut self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> Result<(), redis::RedisError> {
        self.conn.set_ex(key, value, seconds).await
    }

    /// SET key value NX EX seconds. Returns true when this caller created the
    /// key; this is the compare-and-set used for refresh-token rotation.
    pub async fn set_nx_ex(
        &mut self,
        key: &str,
        value: &str,
        seconds: u64,
    ) -> Result<bool, redis::RedisError> {
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(seconds)
            .query_async(&mut self.conn)
            .await?;
        Ok(outcome.is_some())
    }

    pub async fn del(&mut self, keys: &[String]) -> Result<i64, redis::RedisError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.conn.del(keys).await
    }

    pub async fn exists(&mut self, key: &str) -> Result<bool, redis::RedisError> {
        self.conn.exists(key).await
    }

    pub async fn ttl(&mut self, key: &str) -> Result<i64, redis::RedisError> {
        self.conn.ttl(key).await
    }
}
