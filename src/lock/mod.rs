//! Distributed lock primitives used for leader election.

mod redis_lock;

pub use redis_lock::RedisLockService;

use crate::core::{FeedError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Level, event};

/// Picks the lock backend for a deployment of `replicas` processes.
///
/// With a Redis URL every replica shares one lease. Without one the lease
/// only exists inside this process, which is refused for more than one
/// replica.
pub async fn connect(redis_url: Option<&str>, replicas: usize) -> Result<Arc<dyn LockService>> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisLockService::connect(url).await?)),
        None if replicas > 1 => Err(FeedError::Config(format!(
            "{replicas} replicas need a shared lock service; set a redis url"
        ))),
        None => {
            event!(
                Level::WARN,
                "no shared lock service configured; leader election covers this process only"
            );
            Ok(Arc::new(MemoryLockService::new()))
        }
    }
}

/// Key/value store with expiring keys. Every method is atomic on its own.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Stores `value` under `key` unless a live entry exists. Returns whether
    /// the value was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Resets the time to live of an existing key. Returns false if absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Refreshes `key` only while it still holds `value`.
    ///
    /// The default is a get followed by an expire and is not atomic across
    /// the two calls; implementations that can should override it.
    async fn renew_if_holder(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if current == value => self.expire(key, ttl).await,
            _ => Ok(false),
        }
    }

    /// Deletes `key` only while it still holds `value`.
    async fn release_if_holder(&self, key: &str, value: &str) -> Result<bool> {
        match self.get(key).await? {
            Some(current) if current == value => self.delete(key).await,
            _ => Ok(false),
        }
    }
}

#[derive(Debug, Clone)]
struct LockEntry {
    value: String,
    expires_at: Instant,
}

/// Process-local lock service. One mutex guards every key.
#[derive(Debug, Default)]
pub struct MemoryLockService {
    entries: Mutex<HashMap<String, LockEntry>>,
    unavailable: AtomicBool,
}

impl MemoryLockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`FeedError::LockService`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, LockEntry>) -> T) -> Result<T> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError::LockService("lock service unreachable".into()));
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                LockEntry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            true
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| entries.get(key).map(|entry| entry.value.clone()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            None => false,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_entries(|entries| entries.remove(key).is_some())
    }

    async fn renew_if_holder(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if entry.value == value => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        })
    }

    async fn release_if_holder(&self, key: &str, value: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.get(key).is_some_and(|entry| entry.value == value) {
                entries.remove(key);
                true
            } else {
                false
            }
        })
    }
}
