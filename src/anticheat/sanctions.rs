use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ledger::{keys, Ledger, Result};

/// Milliseconds since the Unix epoch, the timestamp format stored in the ledger
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An active IP ban read back from the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanRecord {
    pub ip: IpAddr,
    /// Unix milliseconds at which the ban lifts
    pub expires_at_ms: u64,
}

impl BanRecord {
    /// Remaining ban duration relative to `now`
    pub fn remaining_at(&self, now: SystemTime) -> Duration {
        Duration::from_millis(self.expires_at_ms.saturating_sub(unix_millis(now)))
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(SystemTime::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Render the configured refusal text, `%s` becomes the remaining time
    pub fn message(&self, template: &str) -> String {
        template.replace("%s", &remaining_text(self.remaining()))
    }
}

/// Whole seconds in humantime notation, e.g. `1h 2m 5s`
fn remaining_text(remaining: Duration) -> String {
    humantime::format_duration(Duration::from_secs(remaining.as_secs())).to_string()
}

/// Record a ban for `ip`; the ledger key expires together with the ban
///
/// A duration past the clock's range bans until the end of time.
pub async fn ban_ip(ledger: &dyn Ledger, ip: IpAddr, duration: Duration) -> Result<BanRecord> {
    let expires_at_ms = SystemTime::now()
        .checked_add(duration)
        .map(unix_millis)
        .unwrap_or(u64::MAX);
    ledger
        .set(&keys::ban(ip), &expires_at_ms.to_string(), Some(duration))
        .await?;
    Ok(BanRecord { ip, expires_at_ms })
}

/// Look up a non-expired ban for `ip`
pub async fn active_ban(ledger: &dyn Ledger, ip: IpAddr) -> Result<Option<BanRecord>> {
    let Some(raw) = ledger.get(&keys::ban(ip)).await? else {
        return Ok(None);
    };

    let Ok(expires_at_ms) = raw.parse::<u64>() else {
        tracing::warn!("Ignoring unreadable ban record for {}: '{}'", ip, raw);
        return Ok(None);
    };

    let record = BanRecord { ip, expires_at_ms };
    if record.is_expired() {
        Ok(None)
    } else {
        Ok(Some(record))
    }
}

/// Lift a ban, returning whether one existed
pub async fn unban_ip(ledger: &dyn Ledger, ip: IpAddr) -> Result<bool> {
    ledger.del(&keys::ban(ip)).await
}
