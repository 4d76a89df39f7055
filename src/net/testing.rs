//! Test doubles shared by the node, cluster and lobby tests

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{NodeEndpoint, ServerConfig};
use crate::ledger::{Ledger, LedgerError, MemoryLedger, Result as LedgerResult};
use crate::net::dispatch::Dispatcher;
use crate::net::node::{Node, NodeRole};
use crate::net::protocol::{GameVersion, Packet, Payload};
use crate::net::transport::PacketSink;

/// Sink recording every datagram instead of sending it
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following send fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Decoded packets sent to `target`, oldest first
    pub fn packets_to(&self, target: SocketAddr) -> Vec<Packet> {
        self.sent
            .lock()
            .iter()
            .filter(|(to, _)| *to == target)
            .map(|(_, bytes)| decode_any(bytes))
            .collect()
    }

    /// Payloads of every reliable packet sent to `target`
    pub fn payloads_to(&self, target: SocketAddr) -> Vec<Payload> {
        self.packets_to(target)
            .into_iter()
            .flat_map(|packet| match packet {
                Packet::Reliable { messages, .. } => messages,
                _ => Vec::new(),
            })
            .collect()
    }
}

#[async_trait]
impl PacketSink for RecordingSink {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "sink failing",
            ));
        }
        self.sent.lock().push((target, data.to_vec()));
        Ok(data.len())
    }
}

/// Ledger that interferes with writes under one key prefix
///
/// Either every write there fails, or the first few set-if-absent claims find the
/// key already taken by someone else.
pub struct InterferingLedger {
    inner: Arc<MemoryLedger>,
    prefix: String,
    failing: bool,
    taken_claims: AtomicUsize,
}

impl InterferingLedger {
    pub fn failing_writes(inner: Arc<MemoryLedger>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
            failing: true,
            taken_claims: AtomicUsize::new(0),
        }
    }

    pub fn taken_claims(inner: Arc<MemoryLedger>, prefix: &str, count: usize) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
            failing: false,
            taken_claims: AtomicUsize::new(count),
        }
    }

    fn check(&self, key: &str) -> LedgerResult<()> {
        if self.failing && key.starts_with(&self.prefix) {
            return Err(LedgerError::Unavailable(format!("write to {} refused", key)));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InterferingLedger {
    async fn get(&self, key: &str) -> LedgerResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LedgerResult<()> {
        self.check(key)?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> LedgerResult<bool> {
        self.check(key)?;
        if key.starts_with(&self.prefix) {
            let taken = self
                .taken_claims
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if taken {
                return Ok(false);
            }
        }
        self.inner.set_nx(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> LedgerResult<bool> {
        self.inner.del(key).await
    }

    async fn incr(&self, key: &str) -> LedgerResult<i64> {
        self.check(key)?;
        self.inner.incr(key).await
    }

    async fn decr(&self, key: &str) -> LedgerResult<i64> {
        self.inner.decr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> LedgerResult<bool> {
        self.inner.expire(key, ttl).await
    }

    async fn hget(&self, key: &str, field: &str) -> LedgerResult<Option<String>> {
        self.inner.hget(key, field).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> LedgerResult<()> {
        self.inner.hset(key, field, value).await
    }

    async fn hmset(&self, key: &str, fields: &[(&str, String)]) -> LedgerResult<()> {
        self.inner.hmset(key, fields).await
    }

    async fn hincrby(&self, key: &str, field: &str, delta: i64) -> LedgerResult<i64> {
        self.inner.hincrby(key, field, delta).await
    }

    async fn hgetall(&self, key: &str) -> LedgerResult<HashMap<String, String>> {
        self.inner.hgetall(key).await
    }

    async fn keys(&self, prefix: &str) -> LedgerResult<Vec<String>> {
        self.inner.keys(prefix).await
    }

    async fn flush(&self) -> LedgerResult<()> {
        self.inner.flush().await
    }

    fn name(&self) -> &str {
        "interfering"
    }
}

/// Role with no behaviour beyond the built-in handlers
pub struct PlainRole;

#[async_trait]
impl NodeRole for PlainRole {
    fn name(&self) -> &'static str {
        "node"
    }

    fn register(self: Arc<Self>, _dispatcher: &mut Dispatcher) {}
}

/// Decode any packet, including clientbound kinds
pub fn decode_any(bytes: &[u8]) -> Packet {
    let (packet, _): (Packet, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy()).unwrap();
    packet
}

pub fn encode_any(packet: &Packet) -> Vec<u8> {
    bincode::serde::encode_to_vec(packet, bincode::config::legacy()).unwrap()
}

/// Distinct client IP per `host`
pub fn client_addr(host: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), 50_000)
}

/// Several endpoints behind one client IP
pub fn shared_ip_addr(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
}

pub fn hello(nonce: u32, username: &str) -> Packet {
    Packet::Hello {
        nonce,
        version: GameVersion::new(2020, 4, 2, 0),
        username: username.to_string(),
        mod_count: None,
    }
}

pub fn reliable(nonce: u32, messages: Vec<Payload>) -> Packet {
    Packet::Reliable { nonce, messages }
}

/// Config, ledger and sink shared by the nodes under test
pub struct TestFleet {
    pub config: Arc<ServerConfig>,
    pub ledger: Arc<MemoryLedger>,
    pub sink: Arc<RecordingSink>,
}

impl TestFleet {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            config: Arc::new(config),
            ledger: Arc::new(MemoryLedger::new()),
            sink: Arc::new(RecordingSink::new()),
        }
    }

    pub fn node_with_role(&self, endpoint: NodeEndpoint, role: Arc<dyn NodeRole>) -> Arc<Node> {
        self.node_with_ledger(endpoint, self.ledger.clone(), role)
    }

    /// Node reaching the ledger through `ledger` instead of the fleet's own
    pub fn node_with_ledger(
        &self,
        endpoint: NodeEndpoint,
        ledger: Arc<dyn Ledger>,
        role: Arc<dyn NodeRole>,
    ) -> Arc<Node> {
        Node::new(self.config.clone(), endpoint, ledger, self.sink.clone(), role)
    }

    pub fn plain_node(&self) -> Arc<Node> {
        self.node_with_role(self.config.node, Arc::new(PlainRole))
    }

    pub fn plain_node_with_sink(&self, sink: Arc<dyn PacketSink>) -> Arc<Node> {
        Node::new(
            self.config.clone(),
            self.config.node,
            self.ledger.clone(),
            sink,
            Arc::new(PlainRole),
        )
    }

    /// Encode and feed a packet as if it arrived from `remote`
    pub async fn deliver(&self, node: &Arc<Node>, remote: SocketAddr, packet: &Packet) {
        node.receive(remote, &encode_any(packet)).await;
    }
}
