//! Fleet-wide admission control
//!
//! IP bans and per-IP connection counts live in the shared ledger, so every node
//! enforces the same limits. Counters are atomic increments with delete-at-zero
//! and a TTL refreshed on every new slot, so a crashed node's slots lapse on their
//! own. No node ever locks a key.

use std::net::IpAddr;
use std::time::Duration;

use crate::anticheat::sanctions::{self, BanRecord};
use crate::config::AnticheatConfig;
use crate::ledger::{keys, Ledger, LedgerError};
use crate::net::protocol::DisconnectReason;

/// Lifetime of an IP's slot counter after its most recent registration
pub const CONNECTION_TTL: Duration = Duration::from_secs(10 * 60);

/// Why a connection was refused at admission
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("{message}")]
    Banned { record: BanRecord, message: String },
    #[error("Too many connections coming from your IP.")]
    TooManyConnections { count: i64, max: u32 },
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

impl AdmissionError {
    /// Reason code sent with the refusal
    pub fn reason(&self) -> DisconnectReason {
        match self {
            AdmissionError::Banned { .. } => DisconnectReason::Banned,
            AdmissionError::TooManyConnections { .. } => DisconnectReason::Custom,
            AdmissionError::Ledger(_) => DisconnectReason::ServerRequest,
        }
    }

    /// User-facing text sent with the refusal
    pub fn message(&self) -> Option<String> {
        match self {
            AdmissionError::Ledger(_) => None,
            other => Some(other.to_string()),
        }
    }
}

/// Admission checks against the shared ledger
pub struct Admission<'a> {
    ledger: &'a dyn Ledger,
    /// 0 disables the per-IP limit
    max_per_ip: u32,
    ban_message: &'a str,
}

impl<'a> Admission<'a> {
    pub fn new(ledger: &'a dyn Ledger, config: &'a AnticheatConfig) -> Self {
        Self {
            ledger,
            max_per_ip: config.max_connections_per_ip,
            ban_message: &config.ban_message,
        }
    }

    /// Refuse banned IPs
    pub async fn check_ban(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        match sanctions::active_ban(self.ledger, ip).await? {
            Some(record) => Err(AdmissionError::Banned {
                message: record.message(self.ban_message),
                record,
            }),
            None => Ok(()),
        }
    }

    /// Refuse an IP already at its limit, without taking a slot
    pub async fn check_capacity(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        if self.max_per_ip == 0 {
            return Ok(());
        }

        let count = self.connections_from(ip).await?;
        if count >= i64::from(self.max_per_ip) {
            return Err(AdmissionError::TooManyConnections {
                count,
                max: self.max_per_ip,
            });
        }
        Ok(())
    }

    /// Take a connection slot for `ip`
    ///
    /// Over the limit the slot is given back before the error is returned.
    pub async fn register(&self, ip: IpAddr) -> Result<i64, AdmissionError> {
        let key = keys::connections(ip);
        let count = self.ledger.incr(&key).await?;
        self.ledger.expire(&key, CONNECTION_TTL).await?;
        if self.max_per_ip > 0 && count > i64::from(self.max_per_ip) {
            self.unregister(ip).await?;
            return Err(AdmissionError::TooManyConnections {
                count: count - 1,
                max: self.max_per_ip,
            });
        }
        Ok(count)
    }

    /// Give a slot back; the key is deleted instead of reaching zero
    pub async fn unregister(&self, ip: IpAddr) -> Result<(), AdmissionError> {
        let key = keys::connections(ip);
        if self.ledger.decr(&key).await? <= 0 {
            self.ledger.del(&key).await?;
        }
        Ok(())
    }

    pub async fn connections_from(&self, ip: IpAddr) -> Result<i64, AdmissionError> {
        let raw = self.ledger.get(&keys::connections(ip)).await?;
        Ok(raw.and_then(|value| value.parse().ok()).unwrap_or(0))
    }
}
