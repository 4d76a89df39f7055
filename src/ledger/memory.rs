use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{Ledger, LedgerError, Result};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// In-process ledger
///
/// Expiry is evaluated lazily against the tokio clock, so paused-time tests observe
/// TTLs deterministically. Only nodes inside one process can share it.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    data: Mutex<HashMap<String, Entry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL of a key, if it has one
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut data = self.data.lock();
        let entry = live(&mut data, key)?;
        entry
            .expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let mut data = self.data.lock();
        data.retain(|_, entry| !entry.is_expired(now));
        data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expiry instant for `ttl`; a TTL past the clock's range never expires
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

/// Look up a key, dropping it first if its TTL has passed
fn live<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if data.get(key).is_some_and(|entry| entry.is_expired(now)) {
        data.remove(key);
    }
    data.get_mut(key)
}

fn parse_int(key: &str, raw: &str) -> Result<i64> {
    raw.parse()
        .map_err(|_| LedgerError::NotAnInteger(key.to_string()))
}

fn add_to_string(data: &mut HashMap<String, Entry>, key: &str, delta: i64) -> Result<i64> {
    match live(data, key) {
        Some(entry) => match &mut entry.value {
            Value::Str(raw) => {
                let next = parse_int(key, raw)? + delta;
                *raw = next.to_string();
                Ok(next)
            }
            Value::Hash(_) => Err(LedgerError::WrongType(key.to_string())),
        },
        None => {
            data.insert(key.to_string(), Entry::new(Value::Str(delta.to_string())));
            Ok(delta)
        }
    }
}

fn hash_mut<'a>(
    data: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    if live(data, key).is_none() {
        data.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
    }
    match data.get_mut(key).map(|entry| &mut entry.value) {
        Some(Value::Hash(fields)) => Ok(fields),
        _ => Err(LedgerError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|entry| &entry.value) {
            Some(Value::Str(raw)) => Ok(Some(raw.clone())),
            Some(Value::Hash(_)) => Err(LedgerError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut data = self.data.lock();
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.and_then(deadline),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut data = self.data.lock();
        if live(&mut data, key).is_some() {
            return Ok(false);
        }
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.and_then(deadline),
            },
        );
        Ok(true)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut data = self.data.lock();
        let existed = live(&mut data, key).is_some();
        data.remove(key);
        Ok(existed)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        add_to_string(&mut self.data.lock(), key, 1)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        add_to_string(&mut self.data.lock(), key, -1)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut data = self.data.lock();
        match live(&mut data, key) {
            Some(entry) => {
                entry.expires_at = deadline(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|entry| &entry.value) {
            Some(Value::Hash(fields)) => Ok(fields.get(field).cloned()),
            Some(Value::Str(_)) => Err(LedgerError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock();
        hash_mut(&mut data, key)?.insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(&str, String)]) -> Result<()> {
        let mut data = self.data.lock();
        let hash = hash_mut(&mut data, key)?;
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut data = self.data.lock();
        let hash = hash_mut(&mut data, key)?;
        let current = match hash.get(field) {
            Some(raw) => parse_int(key, raw)?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut data = self.data.lock();
        match live(&mut data, key).map(|entry| &entry.value) {
            Some(Value::Hash(fields)) => Ok(fields.clone()),
            Some(Value::Str(_)) => Err(LedgerError::WrongType(key.to_string())),
            None => Ok(HashMap::new()),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut data = self.data.lock();
        data.retain(|_, entry| !entry.is_expired(now));
        Ok(data
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
