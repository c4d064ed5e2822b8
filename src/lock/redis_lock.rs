//! Lock service backed by a shared Redis server, for replicas running as
//! separate processes.

use super::LockService;
use crate::core::{FeedError, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use std::time::Duration;
use tracing::{Level, event};

const RENEW_IF_HOLDER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_IF_HOLDER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// `SET NX PX` acquisition with holder-checked renew and release scripts.
///
/// The connection manager reconnects on its own; a call made while the
/// server is unreachable fails with [`FeedError::LockService`], which the
/// coordinator treats as a lost lease.
pub struct RedisLockService {
    conn: ConnectionManager,
    renew: Script,
    release: Script,
}

impl RedisLockService {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(lock_error)?;
        let conn = ConnectionManager::new(client).await.map_err(lock_error)?;
        event!(Level::INFO, "connected to redis lock service");
        Ok(Self {
            conn,
            renew: Script::new(RENEW_IF_HOLDER),
            release: Script::new(RELEASE_IF_HOLDER),
        })
    }
}

fn lock_error(err: RedisError) -> FeedError {
    FeedError::LockService(err.to_string())
}

/// Millisecond TTL for `PX`/`PEXPIRE`; Redis rejects zero.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl LockService for RedisLockService {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(lock_error)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(updated == 1)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(removed > 0)
    }

    async fn renew_if_holder(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .renew
            .key(key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(renewed == 1)
    }

    async fn release_if_holder(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await
            .map_err(lock_error)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(30)), 30_000);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }

    #[tokio::test]
    async fn test_malformed_url_is_a_lock_error() {
        let err = RedisLockService::connect("not a redis url").await.err().unwrap();
        assert!(matches!(err, FeedError::LockService(_)));
    }
}
