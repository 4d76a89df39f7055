//! Node runtime shared by the load balancer and the workers
//!
//! A [`Node`] owns the connection table, the handler table and the outbound side of
//! the socket. Everything role-specific (admission, room handling, redirects) is
//! supplied by a [`NodeRole`] that registers its handlers at construction.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::anticheat::mods::ModViolation;
use crate::anticheat::penalty::{Check, Verdict};
use crate::anticheat::sanctions;
use crate::config::{NodeEndpoint, ServerConfig};
use crate::ledger::{self, keys, Ledger};
use crate::metrics::NodeStats;
use crate::net::connection::{Connection, ConnectionTable};
use crate::net::dispatch::Dispatcher;
use crate::net::handlers;
use crate::net::protocol::{Codec, DisconnectReason, MessageKind, Packet, Payload};
use crate::net::reliability::{RetryStep, RETRANSMIT_INTERVAL};
use crate::net::transport::PacketSink;

/// Datagrams above this size go through `massivePackets` before decoding
pub const MAX_DATAGRAM_SIZE: usize = 1024;
/// Connections created by non-handshake traffic are dropped if still unadmitted
pub const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

const SHUTDOWN_MESSAGE: &str = "Server is shutting down.";

/// Role-specific behaviour plugged into a node
#[async_trait]
pub trait NodeRole: Send + Sync {
    fn name(&self) -> &'static str;

    /// Register the role's message handlers
    fn register(self: Arc<Self>, dispatcher: &mut Dispatcher);

    /// Admission hook for the first handshake of a connection
    ///
    /// Returning `false` means the connection was refused (and already disconnected).
    async fn handle_initial(
        &self,
        _node: &Arc<Node>,
        _conn: &Arc<Connection>,
        _hello: &Packet,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }

    /// Cleanup after a connection is gone
    async fn on_disconnect(&self, _node: &Arc<Node>, _conn: &Arc<Connection>) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once at the start of a graceful shutdown
    async fn on_shutdown(&self, _node: &Arc<Node>) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct Node {
    config: Arc<ServerConfig>,
    endpoint: NodeEndpoint,
    label: String,
    ledger: Arc<dyn Ledger>,
    sink: Arc<dyn PacketSink>,
    codec: Codec,
    connections: ConnectionTable,
    dispatcher: Dispatcher,
    role: Arc<dyn NodeRole>,
    stats: Arc<NodeStats>,
    shutting_down: AtomicBool,
    closed: watch::Sender<bool>,
}

impl Node {
    pub fn new(
        config: Arc<ServerConfig>,
        endpoint: NodeEndpoint,
        ledger: Arc<dyn Ledger>,
        sink: Arc<dyn PacketSink>,
        role: Arc<dyn NodeRole>,
    ) -> Arc<Self> {
        let mut codec = Codec::new();
        if config.reactor.enabled() {
            for kind in MessageKind::REACTOR {
                codec.register(kind);
            }
        }

        let mut dispatcher = Dispatcher::new();
        handlers::install(&mut dispatcher, config.reactor.enabled());
        role.clone().register(&mut dispatcher);

        let label = endpoint.to_string();
        let stats = Arc::new(NodeStats::new(label.clone(), role.name()));
        let (closed, _) = watch::channel(false);

        Arc::new(Self {
            config,
            endpoint,
            label,
            ledger,
            sink,
            codec,
            connections: ConnectionTable::new(),
            dispatcher,
            role,
            stats,
            shutting_down: AtomicBool::new(false),
            closed,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn endpoint(&self) -> NodeEndpoint {
        self.endpoint
    }

    /// `ip:port` of this node, used in ledger keys and logs
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role_name(&self) -> &'static str {
        self.role.name()
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn stats(&self) -> Arc<NodeStats> {
        self.stats.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Resolves once the node has shut down
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Handle one datagram from `remote`
    pub async fn receive(self: &Arc<Self>, remote: SocketAddr, data: &[u8]) {
        self.stats.record_received(data.len());

        if data.len() > MAX_DATAGRAM_SIZE {
            let conn = self.connection_for_abuse(remote);
            trace!("Client {} ({}) sent a {} byte datagram", conn.id, remote, data.len());
            if self.penalize(&conn, Check::MassivePackets).await {
                return;
            }
        }

        let packet = match self.codec.decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                NodeStats::inc(&self.stats.decode_failures);
                debug!("Undecodable datagram from {}: {}", remote, e);
                if self.config.anticheat.malformed_packets.is_enabled() {
                    let conn = self.connection_for_abuse(remote);
                    self.penalize(&conn, Check::MalformedPackets).await;
                }
                return;
            }
        };

        let conn = match self.connections.get(&remote) {
            Some(conn) => conn,
            None if matches!(packet, Packet::Hello { .. }) => {
                if self.is_shutting_down() {
                    return;
                }
                let (conn, created) = self.connections.get_or_create(remote);
                if created {
                    self.on_created(&conn);
                }
                conn
            }
            None => {
                trace!("Dropping {:?} from unknown sender {}", packet.kind(), remote);
                return;
            }
        };

        if conn.is_disconnected() {
            return;
        }
        conn.state().record_received(data.len());

        if let Some(nonce) = packet.reliable_nonce() {
            let accepted = conn.state().reliability.accept_inbound(nonce);
            if !accepted {
                NodeStats::inc(&self.stats.duplicates_dropped);
                trace!("Client {} ({}) duplicate nonce {}", conn.id, remote, nonce);
                return;
            }
        }

        let initialized = conn.state().initialized;
        if !initialized {
            if !matches!(packet, Packet::Hello { .. }) {
                trace!("Client {} ({}) not admitted yet, dropping {:?}", conn.id, remote, packet.kind());
                return;
            }
            if !self.admit(&conn, &packet).await {
                return;
            }
        }

        self.dispatcher.dispatch(self, &conn, &packet).await;
    }

    /// Connection to charge a pre-decode violation to
    fn connection_for_abuse(self: &Arc<Self>, remote: SocketAddr) -> Arc<Connection> {
        let (conn, created) = self.connections.get_or_create(remote);
        if created {
            self.on_created(&conn);
            self.spawn_handshake_deadline(conn.clone());
        }
        conn
    }

    fn on_created(&self, conn: &Connection) {
        NodeStats::inc(&self.stats.connections_total);
        NodeStats::inc(&self.stats.connections_active);
        debug!("Client {} ({}) connected to {}", conn.id, conn.remote, self.label);
    }

    fn spawn_handshake_deadline(self: &Arc<Self>, conn: Arc<Connection>) {
        let node = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(HANDSHAKE_DEADLINE).await;
            let initialized = conn.state().initialized;
            if !initialized && !conn.is_disconnected() {
                debug!("Client {} ({}) never completed a handshake", conn.id, conn.remote);
                node.disconnect(&conn, DisconnectReason::None, None).await;
            }
        });
    }

    async fn admit(self: &Arc<Self>, conn: &Arc<Connection>, hello: &Packet) -> bool {
        conn.state().initialized = true;

        match self.role.handle_initial(self, conn, hello).await {
            Ok(true) => true,
            Ok(false) => {
                NodeStats::inc(&self.stats.connections_refused);
                false
            }
            Err(e) => {
                error!("Admission of client {} ({}) failed: {:#}", conn.id, conn.remote, e);
                NodeStats::inc(&self.stats.connections_refused);
                self.disconnect(conn, DisconnectReason::ServerRequest, None).await;
                false
            }
        }
    }

    async fn transmit(&self, conn: &Connection, bytes: &[u8]) -> std::io::Result<()> {
        self.sink.send_to(bytes, conn.remote).await?;
        self.stats.record_sent(bytes.len());
        conn.state().record_sent(bytes.len());
        Ok(())
    }

    /// Send a packet, tracking and retransmitting it if it carries a nonce
    ///
    /// Returns `false` when nothing was sent; a transport failure also schedules a
    /// disconnect.
    pub async fn send(self: &Arc<Self>, conn: &Arc<Connection>, packet: &Packet) -> bool {
        if conn.is_disconnected() {
            return false;
        }

        let bytes: Arc<[u8]> = match self.codec.encode(packet) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                error!("Client {} ({}): {}", conn.id, conn.remote, e);
                return false;
            }
        };

        let tracked = packet.reliable_nonce();
        if let Some(nonce) = tracked {
            let evicted = conn.state().reliability.track(nonce, bytes.clone());
            if let Some(evicted) = evicted {
                trace!("Client {} ({}) evicted in-flight nonce {}", conn.id, conn.remote, evicted);
            }
        }

        if let Err(e) = self.transmit(conn, &bytes).await {
            warn!("Failed to send to client {} ({}): {}", conn.id, conn.remote, e);
            self.spawn_disconnect(conn, DisconnectReason::None, None);
            return false;
        }

        if let Some(nonce) = tracked {
            let timer = self.spawn_retransmit(conn.clone(), nonce);
            conn.state().reliability.attach_timer(nonce, timer);
        }
        true
    }

    /// Send payloads in a fresh reliable packet
    pub async fn send_reliable(self: &Arc<Self>, conn: &Arc<Connection>, messages: Vec<Payload>) -> bool {
        let nonce = conn.state().next_nonce();
        self.send(conn, &Packet::Reliable { nonce, messages }).await
    }

    /// Refuse a join/host request without dropping the connection
    pub async fn join_error(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        message: Option<String>,
    ) -> bool {
        debug!("Client {} ({}) join error {:?}", conn.id, conn.remote, reason);
        self.send_reliable(conn, vec![Payload::JoinError { reason, message }])
            .await
    }

    fn spawn_retransmit(self: &Arc<Self>, conn: Arc<Connection>, nonce: u32) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + RETRANSMIT_INTERVAL, RETRANSMIT_INTERVAL);
            loop {
                ticker.tick().await;
                let step = conn.state().reliability.retry_step(nonce);
                match step {
                    RetryStep::Done => break,
                    RetryStep::Exhausted => {
                        warn!(
                            "Client {} ({}) never acknowledged nonce {}, disconnecting",
                            conn.id, conn.remote, nonce
                        );
                        node.spawn_disconnect(&conn, DisconnectReason::None, None);
                        break;
                    }
                    RetryStep::Resend { attempt, bytes } => {
                        NodeStats::inc(&node.stats.retransmits);
                        trace!("Client {} ({}) resend {} of nonce {}", conn.id, conn.remote, attempt, nonce);
                        if let Err(e) = node.transmit(&conn, &bytes).await {
                            warn!("Failed to resend to client {} ({}): {}", conn.id, conn.remote, e);
                            node.spawn_disconnect(&conn, DisconnectReason::None, None);
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Disconnect from a separate task, outside any timer being cancelled
    fn spawn_disconnect(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        message: Option<String>,
    ) {
        let node = self.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            node.disconnect(&conn, reason, message).await;
        });
    }

    /// Tear a connection down; later calls are no-ops
    pub async fn disconnect(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        reason: DisconnectReason,
        message: Option<String>,
    ) {
        if !conn.mark_disconnected() {
            return;
        }

        let cancelled = conn.state().reliability.cancel_all();

        let packet = Packet::Disconnect {
            reason: Some(reason),
            message: message.clone(),
        };
        match self.codec.encode(&packet) {
            Ok(bytes) => {
                if let Err(e) = self.transmit(conn, &bytes).await {
                    debug!("Could not notify client {} ({}) of disconnect: {}", conn.id, conn.remote, e);
                }
            }
            Err(e) => error!("Client {} ({}): {}", conn.id, conn.remote, e),
        }

        self.connections.remove(conn);
        NodeStats::dec(&self.stats.connections_active);

        self.clear_infractions(conn).await;
        if let Err(e) = self.role.on_disconnect(self, conn).await {
            warn!("Cleanup for client {} ({}) failed: {:#}", conn.id, conn.remote, e);
        }

        info!(
            "Client {} ({}) disconnected from {}: {:?}{}{}",
            conn.id,
            conn.remote,
            self.label,
            reason,
            message.map(|m| format!(" ({})", m)).unwrap_or_default(),
            if cancelled > 0 {
                format!(", {} pending resends cancelled", cancelled)
            } else {
                String::new()
            }
        );
    }

    async fn clear_infractions(&self, conn: &Connection) {
        let prefix = keys::infraction_prefix(&self.label, conn.id);
        let cleared = match self.ledger.keys(&prefix).await {
            Ok(found) => ledger::del_many(self.ledger.as_ref(), &found).await,
            Err(e) => Err(e),
        };
        if let Err(e) = cleared {
            debug!("Could not clear infractions of client {}: {}", conn.id, e);
        }
    }

    /// Apply the named check to a violation by `conn`
    ///
    /// Returns `true` when the current message must not be processed further.
    pub async fn penalize(self: &Arc<Self>, conn: &Arc<Connection>, check: Check) -> bool {
        let verdict = {
            let mut state = conn.state();
            state.strikes.evaluate(check, self.config.anticheat.policy(check))
        };

        match verdict {
            Verdict::Allow => false,
            Verdict::Warn { strikes, threshold } => {
                NodeStats::inc(&self.stats.strikes);
                warn!(
                    "Client {} ({}) failed {} ({}/{})",
                    conn.id, conn.remote, check, strikes, threshold
                );
                let key = keys::infraction(&self.label, conn.id, check.as_str());
                if let Err(e) = self.ledger.incr(&key).await {
                    debug!("Could not record infraction for client {}: {}", conn.id, e);
                }
                false
            }
            Verdict::Drop => {
                debug!("Client {} ({}) failed {}, message ignored", conn.id, conn.remote, check);
                true
            }
            Verdict::Disconnect => {
                NodeStats::inc(&self.stats.penalties);
                warn!("Client {} ({}) failed {}, disconnecting", conn.id, conn.remote, check);
                self.disconnect(conn, DisconnectReason::Hacking, None).await;
                true
            }
            Verdict::Ban(duration) => {
                NodeStats::inc(&self.stats.penalties);
                match sanctions::ban_ip(self.ledger.as_ref(), conn.ip(), duration).await {
                    Ok(record) => {
                        NodeStats::inc(&self.stats.bans);
                        warn!(
                            "Client {} ({}) failed {}, banned {} for {}s",
                            conn.id,
                            conn.remote,
                            check,
                            conn.ip(),
                            duration.as_secs()
                        );
                        let message = record.message(&self.config.anticheat.ban_message);
                        self.disconnect(conn, DisconnectReason::Banned, Some(message)).await;
                    }
                    Err(e) => {
                        error!("Could not ban {}: {}", conn.ip(), e);
                        self.disconnect(conn, DisconnectReason::Hacking, None).await;
                    }
                }
                true
            }
        }
    }

    /// Enforce the mod policy; `true` means the request was refused
    pub async fn check_mods(self: &Arc<Self>, conn: &Arc<Connection>) -> bool {
        let Some(policy) = self.config.reactor.policy() else {
            return false;
        };

        let mods = conn.state().mods.clone();
        match policy.check(mods.as_deref()) {
            Ok(()) => false,
            Err(violation @ ModViolation::NotDeclared) => {
                self.disconnect(conn, DisconnectReason::Custom, Some(violation.to_string()))
                    .await;
                true
            }
            Err(violation) => {
                info!("Client {} ({}) refused: {}", conn.id, conn.remote, violation);
                self.join_error(conn, DisconnectReason::Custom, Some(violation.to_string()))
                    .await;
                true
            }
        }
    }

    /// Stop the node: role teardown, then every connection, then the socket
    pub async fn shutdown(self: &Arc<Self>) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.role.on_shutdown(self).await {
            warn!("{} {} shutdown hook failed: {:#}", self.role.name(), self.label, e);
        }

        let connections = self.connections.all();
        for conn in &connections {
            self.disconnect(conn, DisconnectReason::Custom, Some(SHUTDOWN_MESSAGE.to_string()))
                .await;
        }

        self.closed.send_replace(true);
        info!(
            "{} {} shut down, {} connections closed",
            self.role.name(),
            self.label,
            connections.len()
        );
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("label", &self.label)
            .field("role", &self.role.name())
            .field("connections", &self.connections.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anticheat::penalty::{CheckPolicy, Penalty, PenaltyRule};
    use crate::net::reliability::MAX_RETRANSMITS;
    use crate::net::testing::{client_addr, hello, reliable, TestFleet};
    use crate::net::protocol::GameOptions;

    fn host_game() -> Payload {
        Payload::HostGame {
            options: GameOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_hello_creates_connection_and_is_acknowledged() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);

        fleet.deliver(&node, remote, &hello(1, "alice")).await;

        let conn = node.connections().get(&remote).unwrap();
        assert!(conn.is_identified());
        assert_eq!(conn.username().as_deref(), Some("alice"));
        assert_eq!(
            fleet.sink.packets_to(remote),
            vec![Packet::Acknowledge { nonce: 1, missing: 0b1 }]
        );
    }

    #[tokio::test]
    async fn test_unknown_sender_non_hello_is_dropped() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);

        fleet.deliver(&node, remote, &Packet::Ping { nonce: 1 }).await;
        fleet.deliver(&node, remote, &reliable(2, vec![host_game()])).await;

        assert_eq!(node.connections().count(), 0);
        assert!(fleet.sink.packets_to(remote).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_nonces_are_not_dispatched() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);

        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        for nonce in [2, 2, 5, 3, 6] {
            fleet.deliver(&node, remote, &Packet::Ping { nonce }).await;
        }

        let acked: Vec<u32> = fleet
            .sink
            .packets_to(remote)
            .into_iter()
            .filter_map(|packet| match packet {
                Packet::Acknowledge { nonce, .. } => Some(nonce),
                _ => None,
            })
            .collect();
        assert_eq!(acked, vec![1, 2, 5, 6]);
        assert_eq!(node.stats().duplicates_dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_send_is_retried_eight_times_then_disconnects() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();
        fleet.sink.clear();

        assert!(node.send_reliable(&conn, vec![host_game()]).await);

        tokio::time::sleep(Duration::from_millis(12_100)).await;
        let sent = fleet.sink.packets_to(remote);
        assert_eq!(sent.len(), 1 + MAX_RETRANSMITS as usize);
        assert!(sent.iter().all(|p| matches!(p, Packet::Reliable { nonce: 1, .. })));
        assert!(!conn.is_disconnected());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(conn.is_disconnected());
        assert_eq!(node.connections().count(), 0);
        assert!(matches!(
            fleet.sink.packets_to(remote).last(),
            Some(Packet::Disconnect { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledged_send_stops_retrying() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();
        fleet.sink.clear();

        node.send_reliable(&conn, vec![host_game()]).await;
        tokio::time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(fleet.sink.packets_to(remote).len(), 3);

        fleet
            .deliver(&node, remote, &Packet::Acknowledge { nonce: 1, missing: 0 })
            .await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fleet.sink.packets_to(remote).len(), 3);
        assert!(!conn.is_disconnected());
        assert_eq!(conn.state().reliability.is_acked(1), Some(true));
    }

    #[tokio::test]
    async fn test_send_failure_disconnects() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();

        fleet.sink.set_failing(true);
        assert!(!node.send_reliable(&conn, vec![host_game()]).await);

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(conn.is_disconnected());
        assert_eq!(node.connections().count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();
        fleet.sink.clear();

        node.disconnect(&conn, DisconnectReason::Hacking, None).await;
        node.disconnect(&conn, DisconnectReason::Hacking, None).await;

        assert_eq!(fleet.sink.packets_to(remote).len(), 1);
        assert_eq!(node.stats().connections_active.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_reconnect_gets_a_fresh_connection() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);

        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let first = node.connections().get(&remote).unwrap();
        node.disconnect(&first, DisconnectReason::None, None).await;

        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let second = node.connections().get(&remote).unwrap();
        assert_ne!(first.id, second.id);
        assert!(second.is_identified());
    }

    #[tokio::test]
    async fn test_massive_datagram_strikes_then_disconnects() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;

        let oversized = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        node.receive(remote, &oversized).await;
        node.receive(remote, &oversized).await;
        let conn = node.connections().get(&remote).unwrap();
        assert_eq!(conn.state().strikes.get(Check::MassivePackets), 2);

        node.receive(remote, &oversized).await;
        assert!(conn.is_disconnected());
    }

    #[tokio::test]
    async fn test_malformed_datagram_creates_connection_only_when_checked() {
        let mut config = ServerConfig::default();
        config.anticheat.malformed_packets = CheckPolicy::Rule(PenaltyRule {
            penalty: Some(Penalty::Disconnect),
            strikes: Some(2),
            ban_duration: None,
        });
        let fleet = TestFleet::with_config(config);
        let node = fleet.plain_node();

        node.receive(client_addr(1), &[0xff, 0xff, 0xff, 0xff, 0x01]).await;
        let conn = node.connections().get(&client_addr(1)).unwrap();
        assert_eq!(conn.state().strikes.get(Check::MalformedPackets), 1);

        // A handshake on that connection still goes through admission
        fleet.deliver(&node, client_addr(1), &hello(1, "alice")).await;
        assert!(conn.state().initialized);
        assert!(conn.is_identified());

        let default_fleet = TestFleet::new();
        let plain = default_fleet.plain_node();
        plain.receive(client_addr(2), &[0xff, 0xff, 0xff, 0xff, 0x01]).await;
        assert_eq!(plain.connections().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unadmitted_connection_is_reaped() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();

        node.receive(client_addr(1), &vec![0u8; MAX_DATAGRAM_SIZE + 10]).await;
        assert_eq!(node.connections().count(), 1);

        tokio::time::sleep(HANDSHAKE_DEADLINE + Duration::from_millis(10)).await;
        assert_eq!(node.connections().count(), 0);
    }

    #[tokio::test]
    async fn test_ban_verdict_writes_ledger_and_disconnects() {
        let mut config = ServerConfig::default();
        config.anticheat.host_checks = CheckPolicy::Rule(PenaltyRule {
            penalty: Some(Penalty::Ban),
            strikes: None,
            ban_duration: Some(120),
        });
        let fleet = TestFleet::with_config(config);
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();

        assert!(node.penalize(&conn, Check::HostChecks).await);
        assert!(conn.is_disconnected());

        let ban = sanctions::active_ban(fleet.ledger.as_ref(), remote.ip())
            .await
            .unwrap()
            .unwrap();
        assert!(ban.remaining() > Duration::from_secs(100));
        assert!(matches!(
            fleet.sink.packets_to(remote).last(),
            Some(Packet::Disconnect {
                reason: Some(DisconnectReason::Banned),
                message: Some(_)
            })
        ));
    }

    #[tokio::test]
    async fn test_strikes_are_mirrored_and_cleared() {
        let mut config = ServerConfig::default();
        config.anticheat.host_checks = CheckPolicy::Rule(PenaltyRule {
            penalty: Some(Penalty::Disconnect),
            strikes: Some(5),
            ban_duration: None,
        });
        let fleet = TestFleet::with_config(config);
        let node = fleet.plain_node();
        let remote = client_addr(1);
        fleet.deliver(&node, remote, &hello(1, "alice")).await;
        let conn = node.connections().get(&remote).unwrap();

        assert!(!node.penalize(&conn, Check::HostChecks).await);
        assert!(!node.penalize(&conn, Check::HostChecks).await);
        let key = keys::infraction(node.label(), conn.id, "hostChecks");
        assert_eq!(fleet.ledger.get(&key).await.unwrap().as_deref(), Some("2"));

        node.disconnect(&conn, DisconnectReason::None, None).await;
        assert!(fleet.ledger.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everyone() {
        let fleet = TestFleet::new();
        let node = fleet.plain_node();
        for port in 1..=3 {
            fleet.deliver(&node, client_addr(port), &hello(1, "player")).await;
        }
        let mut closed = node.closed();

        node.shutdown().await;

        assert_eq!(node.connections().count(), 0);
        assert!(closed.changed().await.is_ok());
        assert!(*closed.borrow());
        for port in 1..=3 {
            assert!(matches!(
                fleet.sink.packets_to(client_addr(port)).last(),
                Some(Packet::Disconnect {
                    reason: Some(DisconnectReason::Custom),
                    message: Some(m)
                }) if m == SHUTDOWN_MESSAGE
            ));
        }

        // No new connections once stopped
        fleet.deliver(&node, client_addr(9), &hello(1, "late")).await;
        assert_eq!(node.connections().count(), 0);
    }
}
