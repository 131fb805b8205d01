//! Shared key-value store used for idempotency caching, advisory locks,
//! and velocity counters.
//!
//! The in-memory backend serves tests and single-node runs; the Redis
//! backend is what deployments wire in.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("kv operation failed: {0}")]
    Operation(String),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;
    /// Atomic set-if-absent with a TTL. Returns whether the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;
    /// Increments an integer counter, creating it at 1.
    async fn incr(&self, key: &str) -> Result<i64, KvError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
}

#[derive(Debug, Clone)]
struct KvEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl KvEntry {
    fn new(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() > at)
    }
}

/// In-memory key-value store with per-entry TTLs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryKv {
    store: Arc<RwLock<HashMap<String, KvEntry>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let expired = {
            let store = self.store.read().unwrap();
            match store.get(key) {
                Some(entry) if entry.is_expired() => true,
                Some(entry) => return Some(entry.value.clone()),
                None => return None,
            }
        };
        if expired {
            self.store.write().unwrap().remove(key);
        }
        None
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.store
            .write()
            .unwrap()
            .insert(key.to_string(), KvEntry::new(value.to_string(), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        let mut store = self.store.write().unwrap();
        match store.get(key) {
            Some(entry) if !entry.is_expired() => Ok(false),
            _ => {
                store.insert(key.to_string(), KvEntry::new(value.to_string(), Some(ttl)));
                Ok(true)
            }
        }
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut store = self.store.write().unwrap();
        let next = match store.get(key) {
            Some(entry) if !entry.is_expired() => entry
                .value
                .parse::<i64>()
                .map_err(|e| KvError::Operation(format!("counter {key} is not numeric: {e}")))?
                + 1,
            _ => 1,
        };
        let ttl_carryover = store.get(key).filter(|e| !e.is_expired()).and_then(|e| {
            e.expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))
        });
        store.insert(
            key.to_string(),
            KvEntry::new(next.to_string(), ttl_carryover),
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut store = self.store.write().unwrap();
        if let Some(entry) = store.get_mut(key) {
            if !entry.is_expired() {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.store.write().unwrap().remove(key);
        Ok(())
    }
}

/// Redis-backed key-value store.
#[derive(Debug, Clone)]
pub struct RedisKv {
    client: Arc<redis::Client>,
}

impl RedisKv {
    pub fn connect(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Connection(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KvError::Connection(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.get(key)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(|e| KvError::Operation(e.to_string())),
            None => conn
                .set(key, value)
                .await
                .map_err(|e| KvError::Operation(e.to_string())),
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))?;
        Ok(reply.is_some())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut conn = self.conn().await?;
        conn.incr(key, 1)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.del(key)
            .await
            .map_err(|e| KvError::Operation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        let kv = InMemoryKv::new();
        assert!(kv
            .set_nx("lock:a", "1", Duration::from_millis(40))
            .await
            .unwrap());
        assert!(!kv
            .set_nx("lock:a", "1", Duration::from_millis(40))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(kv
            .set_nx("lock:a", "1", Duration::from_millis(40))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn incr_counts_and_preserves_ttl() {
        let kv = InMemoryKv::new();
        assert_eq!(kv.incr("velocity:c1").await.unwrap(), 1);
        kv.expire("velocity:c1", Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(kv.incr("velocity:c1").await.unwrap(), 2);
        assert_eq!(kv.incr("velocity:c1").await.unwrap(), 3);

        tokio::time::sleep(Duration::from_millis(70)).await;
        // Window elapsed: counter restarts.
        assert_eq!(kv.incr("velocity:c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn get_honors_expiry() {
        let kv = InMemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(30)))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_releases_lock() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx("lock:b", "1", Duration::from_secs(30)).await.unwrap());
        kv.delete("lock:b").await.unwrap();
        assert!(kv.set_nx("lock:b", "1", Duration::from_secs(30)).await.unwrap());
    }
}
