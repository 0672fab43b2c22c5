//! Fast key-value store seam for sessions and OAuth state.
//!
//! Production runs against Redis through a `ConnectionManager`; unit tests use
//! the in-memory implementation. Every operation is single-key atomic and
//! carries a 100 ms deadline so a wedged store cannot stall request handling.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::time::Duration;
use thiserror::Error;

const KV_DEADLINE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv operation timed out")]
    Timeout,
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    /// Atomic read-and-delete. The single-use guarantee for OAuth state
    /// tokens rests on this being one round-trip.
    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn del(&self, key: &str) -> Result<(), KvError>;
    /// Refreshes a key's TTL (sliding session expiry).
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError>;
}

pub struct RedisKv {
    manager: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub fn new(manager: redis::aio::ConnectionManager) -> Self {
        Self { manager }
    }
}

async fn bounded<T>(
    fut: impl std::future::Future<Output = redis::RedisResult<T>>,
) -> Result<T, KvError> {
    match tokio::time::timeout(KV_DEADLINE, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(KvError::Unavailable(e.to_string())),
        Err(_) => Err(KvError::Timeout),
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        bounded(conn.get(key)).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        bounded(conn.set_ex(key, value, ttl_secs)).await
    }

    async fn get_del(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        bounded(conn.get_del(key)).await
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        bounded(conn.del(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        bounded(conn.expire(key, ttl_secs as i64)).await
    }
}
