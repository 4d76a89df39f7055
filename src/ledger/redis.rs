//! Redis-backed ledger
//!
//! Every node of a multi-process fleet points at the same server. Counters map
//! onto native `INCR`/`HINCRBY`, TTLs onto `PEXPIRE`, so updates stay atomic
//! without any client-side locking.

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Cmd, ConnectionAddr, ConnectionInfo, ErrorKind, FromRedisValue, RedisConnectionInfo, RedisError};
use async_trait::async_trait;

use super::{Ledger, LedgerError, Result};
use crate::config::LedgerConfig;

/// Keys fetched per `SCAN` round trip
const SCAN_BATCH: usize = 256;

pub struct RedisLedger {
    conn: ConnectionManager,
    name: String,
}

impl RedisLedger {
    /// Connect to the server in `config`; the manager reconnects on its own afterwards
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let client = ::redis::Client::open(connection_info(config)).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
        Ok(Self {
            conn,
            name: format!("redis://{}:{}", config.host, config.port),
        })
    }

    async fn query<T: FromRedisValue>(&self, key: &str, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(|e| classify(key, e))
    }
}

fn connection_info(config: &LedgerConfig) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
        redis: RedisConnectionInfo {
            password: config.password.clone(),
            ..Default::default()
        },
    }
}

fn unavailable(e: RedisError) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

fn classify(key: &str, e: RedisError) -> LedgerError {
    if e.code() == Some("WRONGTYPE") {
        return LedgerError::WrongType(key.to_string());
    }
    match e.kind() {
        ErrorKind::TypeError => LedgerError::NotAnInteger(key.to_string()),
        ErrorKind::ResponseError if e.to_string().contains("not an integer") => {
            LedgerError::NotAnInteger(key.to_string())
        }
        _ => unavailable(e),
    }
}

/// TTL in milliseconds, clamped to what the server accepts
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).clamp(1, i64::MAX / 2)
}

/// `SCAN MATCH` pattern for keys beginning with `prefix`
fn prefix_pattern(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('*');
    pattern
}

fn set_cmd(key: &str, value: &str, ttl: Option<Duration>) -> Cmd {
    let mut cmd = ::redis::cmd("SET");
    cmd.arg(key).arg(value);
    if let Some(ttl) = ttl {
        cmd.arg("PX").arg(ttl_millis(ttl));
    }
    cmd
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(key, ::redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.query(key, &set_cmd(key, value, ttl)).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut cmd = set_cmd(key, value, ttl);
        cmd.arg("NX");
        let reply: Option<String> = self.query(key, &cmd).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let removed: i64 = self.query(key, ::redis::cmd("DEL").arg(key)).await?;
        Ok(removed > 0)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(key, ::redis::cmd("INCR").arg(key)).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        self.query(key, ::redis::cmd("DECR").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let set: i64 = self
            .query(key, ::redis::cmd("PEXPIRE").arg(key).arg(ttl_millis(ttl)))
            .await?;
        Ok(set == 1)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.query(key, ::redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let _: i64 = self
            .query(key, ::redis::cmd("HSET").arg(key).arg(field).arg(value))
            .await?;
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value);
        }
        let _: i64 = self.query(key, &cmd).await?;
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.query(key, ::redis::cmd("HINCRBY").arg(key).arg(field).arg(delta))
            .await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.query(key, ::redis::cmd("HGETALL").arg(key)).await
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = prefix_pattern(prefix);
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    prefix,
                    ::redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            found.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn flush(&self) -> Result<()> {
        self.query("*", &::redis::cmd("FLUSHDB")).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
