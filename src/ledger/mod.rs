//! Shared cross-node ledger
//!
//! Bans, per-IP connection counts, redirect proofs and infraction counters live in a
//! key-value store shared by every node of the fleet. Nodes never lock it: every
//! update is an idempotent, TTL-bounded counter operation.
//!
//! - **Ledger**: trait for ledger backends
//! - **MemoryLedger**: in-process backend with TTL support (single-process fleets, tests)
//! - **RedisLedger**: networked backend shared by separate master and worker processes

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{LedgerBackend, LedgerConfig};

pub use memory::MemoryLedger;
pub use self::redis::RedisLedger;

pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors returned by ledger backends
#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Key '{0}' holds a value of the wrong type")]
    WrongType(String),
    #[error("Value at '{0}' is not an integer")]
    NotAnInteger(String),
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Key-value store with TTL and atomic counter primitives
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value, replacing any previous value and TTL
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set a string value only if the key is absent, returning whether it was written
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Delete a key, returning whether it existed
    async fn del(&self, key: &str) -> Result<bool>;

    /// Increment an integer value (missing keys start at 0)
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Decrement an integer value (missing keys start at 0)
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Set a TTL on an existing key, returning whether the key existed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hmset(&self, key: &str, fields: &[(&str, String)]) -> Result<()>;

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// All fields of a hash; empty when the key does not exist
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Keys starting with `prefix`
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Drop every key
    async fn flush(&self) -> Result<()>;

    /// Backend name for logging
    fn name(&self) -> &str;
}

/// Open the backend selected by `config`
pub async fn open(config: &LedgerConfig) -> Result<Arc<dyn Ledger>> {
    let ledger: Arc<dyn Ledger> = match config.backend {
        LedgerBackend::Memory => Arc::new(MemoryLedger::new()),
        LedgerBackend::Redis => Arc::new(RedisLedger::connect(config).await?),
    };
    info!("Using {} ledger", ledger.name());
    Ok(ledger)
}

/// Delete every key in `keys`, returning how many existed
pub async fn del_many(ledger: &dyn Ledger, keys: &[String]) -> Result<usize> {
    let mut removed = 0;
    for key in keys {
        if ledger.del(key).await? {
            removed += 1;
        }
    }
    Ok(removed)
}

/// Key builders shared by every node kind
pub mod keys {
    use std::net::IpAddr;

    pub fn ban(ip: IpAddr) -> String {
        format!("ban.{}", ip)
    }

    pub fn connections(ip: IpAddr) -> String {
        format!("connections.{}", ip)
    }

    pub fn redirect(ip: IpAddr, username: &str) -> String {
        format!("redirected.{}.{}", ip, username)
    }

    pub fn infraction(node: &str, client_id: u32, check: &str) -> String {
        format!("infractions.{}.{}.{}", node, client_id, check)
    }

    pub fn infraction_prefix(node: &str, client_id: u32) -> String {
        format!("infractions.{}.{}.", node, client_id)
    }

    pub fn room(code: &str) -> String {
        format!("room.{}", code)
    }
}
