//! Redirect proofs
//!
//! The load balancer writes a short-lived record per (ip, username) before
//! redirecting a client; the worker only admits handshakes that can consume one.
//! Counters are best-effort throttles and never go below zero.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use crate::anticheat::sanctions::unix_millis;
use crate::config::NodeEndpoint;
use crate::ledger::{keys, Ledger, Result};
use crate::metrics::NodeStats;
use crate::net::connection::Connection;
use crate::net::node::Node;
use crate::net::protocol::Payload;

/// Lifetime of a proof, and the throttle window per pending redirect
pub const REDIRECT_WINDOW: Duration = Duration::from_secs(6);

const DATE_FIELD: &str = "date";
const COUNT_FIELD: &str = "num";

/// Redirect proof as stored in the ledger hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRecord {
    pub recorded_at_ms: u64,
    pub count: i64,
}

impl RedirectRecord {
    fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let recorded_at_ms = fields.get(DATE_FIELD)?.parse().ok()?;
        let count = fields.get(COUNT_FIELD)?.parse().ok()?;
        Some(Self {
            recorded_at_ms,
            count,
        })
    }

    /// Time left before a new redirect may be issued, `None` once elapsed
    pub fn wait_at(&self, now_ms: u64) -> Option<Duration> {
        let window = REDIRECT_WINDOW.as_millis() as u64 * self.count.max(0) as u64;
        let release = self.recorded_at_ms.saturating_add(window);
        (now_ms < release).then(|| Duration::from_millis(release - now_ms))
    }
}

pub async fn read_record(ledger: &dyn Ledger, ip: IpAddr, username: &str) -> Result<Option<RedirectRecord>> {
    let fields = ledger.hgetall(&keys::redirect(ip, username)).await?;
    Ok(RedirectRecord::from_fields(&fields))
}

/// Wait owed by a client re-requesting while a previous redirect is pending
///
/// A pending record has its counter bumped so the worker tolerates the extra
/// handshakes.
pub async fn throttle_delay(ledger: &dyn Ledger, ip: IpAddr, username: &str) -> Result<Option<Duration>> {
    let Some(record) = read_record(ledger, ip, username).await? else {
        return Ok(None);
    };
    let Some(wait) = record.wait_at(unix_millis(SystemTime::now())) else {
        return Ok(None);
    };

    ledger
        .hincrby(&keys::redirect(ip, username), COUNT_FIELD, 1)
        .await?;
    Ok(Some(wait))
}

/// Write a fresh proof `{date: now, num: 1}` expiring after the window
pub async fn record_redirect(ledger: &dyn Ledger, ip: IpAddr, username: &str) -> Result<()> {
    let key = keys::redirect(ip, username);
    ledger
        .hmset(
            &key,
            &[
                (DATE_FIELD, unix_millis(SystemTime::now()).to_string()),
                (COUNT_FIELD, "1".to_string()),
            ],
        )
        .await?;
    ledger.expire(&key, REDIRECT_WINDOW).await?;
    Ok(())
}

/// Throttle, record the proof, then send the redirect
///
/// A throttled redirect completes on its own task after the wait, so the client's
/// later datagrams (acknowledgements included) are handled meanwhile.
pub async fn issue_redirect(
    node: &Arc<Node>,
    conn: &Arc<Connection>,
    username: &str,
    target: NodeEndpoint,
) -> anyhow::Result<()> {
    let Some(wait) = throttle_delay(node.ledger(), conn.ip(), username).await? else {
        send_redirect(node, conn, username, target).await?;
        return Ok(());
    };

    info!(
        "Client {} ({}) still connecting to a worker, waiting {}ms before redirecting",
        conn.id,
        conn.remote,
        wait.as_millis()
    );
    let (node, conn, username) = (node.clone(), conn.clone(), username.to_string());
    tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        if conn.is_disconnected() {
            return;
        }
        if let Err(e) = send_redirect(&node, &conn, &username, target).await {
            warn!("Delayed redirect of client {} ({}) failed: {:#}", conn.id, conn.remote, e);
        }
    });
    Ok(())
}

async fn send_redirect(
    node: &Arc<Node>,
    conn: &Arc<Connection>,
    username: &str,
    target: NodeEndpoint,
) -> anyhow::Result<()> {
    record_redirect(node.ledger(), conn.ip(), username).await?;

    let sent = node
        .send_reliable(
            conn,
            vec![Payload::Redirect {
                ip: target.ip,
                port: target.port,
            }],
        )
        .await;

    if sent {
        NodeStats::inc(&node.stats().redirects);
        info!("Redirected client {} ({}) to worker {}", conn.id, conn.remote, target);
    }
    Ok(())
}

/// Outcome of a worker looking for a client's proof
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consumed {
    /// No proof: the client did not come through the load balancer
    Missing,
    /// Last expected handshake, proof deleted
    Deleted,
    /// Proof still expects this many handshakes
    Remaining(i64),
}

impl Consumed {
    pub fn accepted(&self) -> bool {
        !matches!(self, Consumed::Missing)
    }
}

pub async fn consume_redirect(ledger: &dyn Ledger, ip: IpAddr, username: &str) -> Result<Consumed> {
    let key = keys::redirect(ip, username);
    let Some(raw) = ledger.hget(&key, COUNT_FIELD).await? else {
        return Ok(Consumed::Missing);
    };

    let count: i64 = raw.parse().unwrap_or(1);
    if count <= 1 {
        ledger.del(&key).await?;
        return Ok(Consumed::Deleted);
    }

    let remaining = ledger.hincrby(&key, COUNT_FIELD, -1).await?;
    if remaining <= 0 {
        ledger.del(&key).await?;
        return Ok(Consumed::Deleted);
    }
    Ok(Consumed::Remaining(remaining))
}
