//! Worker node: hosts rooms and validates game traffic
//!
//! Only clients carrying a redirect proof are admitted. Object traffic is checked
//! against the room's ownership table before the room ever sees it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::anticheat::penalty::Check;
use crate::cluster::handoff::{self, Consumed};
use crate::ledger::keys;
use crate::lobby::{expected_components, Player, Room, RoomCode, RoomError, RoomTable};
use crate::metrics::NodeStats;
use crate::net::admission::{Admission, AdmissionError};
use crate::net::connection::Connection;
use crate::net::dispatch::{Dispatcher, Flow, Message, MessageHandler};
use crate::net::node::{Node, NodeRole};
use crate::net::protocol::{ClientId, DisconnectReason, GameMessage, GameOptions, MessageKind, Packet, Payload};

const NOT_REDIRECTED: &str = "Please connect through the master server.";

/// Rooms nobody joined within this long are destroyed on the next host request
pub const ABANDONED_ROOM_TIMEOUT: Duration = Duration::from_secs(60);
/// Fresh codes tried before giving up on a fleet-wide unique one
const ROOM_CODE_ATTEMPTS: usize = 16;

#[derive(Debug, Default)]
pub struct WorkerRole {
    rooms: RoomTable,
}

impl WorkerRole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rooms(&self) -> &RoomTable {
        &self.rooms
    }

    /// Room `conn` belongs to, if it is the room `code` names
    fn room_of(&self, conn: &Connection, code: i32) -> Option<Arc<Mutex<Room>>> {
        if conn.room() != Some(code) {
            return None;
        }
        self.rooms.get(code)
    }

    /// Take `conn` out of its room, destroying the room once empty
    async fn leave_room(&self, node: &Arc<Node>, conn: &Connection) {
        let Some(code) = conn.state().room.take() else {
            return;
        };
        let Some(room) = self.rooms.get(code) else {
            return;
        };

        let empty = {
            let mut room = room.lock();
            room.remove_player(conn.id);
            room.is_empty()
        };
        if empty {
            self.destroy_room(node, code).await;
        }
    }

    async fn destroy_room(&self, node: &Arc<Node>, code: i32) {
        let Some(room) = self.rooms.remove(code) else {
            return;
        };
        let room_code = room.lock().code;
        self.unpublish(node, &room_code.to_string()).await;
        NodeStats::dec(&node.stats().rooms_active);
        info!("Room {} destroyed on {}", room_code, node.label());
    }

    /// Create a room and claim its code in the fleet-wide directory
    ///
    /// A code another worker already published is given back and redrawn. The
    /// table never keeps a room whose code could not be published.
    async fn open_room(&self, node: &Arc<Node>, options: GameOptions) -> anyhow::Result<RoomCode> {
        for _ in 0..ROOM_CODE_ATTEMPTS {
            let (code, _) = self.rooms.create(options);
            let claimed = node
                .ledger()
                .set_nx(&keys::room(&code.to_string()), node.label(), None)
                .await;
            match claimed {
                Ok(true) => {
                    NodeStats::inc(&node.stats().rooms_active);
                    return Ok(code);
                }
                Ok(false) => {
                    self.rooms.remove(code.to_int());
                    debug!("Room code {} is taken elsewhere in the fleet, drawing another", code);
                }
                Err(e) => {
                    self.rooms.remove(code.to_int());
                    return Err(e.into());
                }
            }
        }
        anyhow::bail!("No free room code after {} attempts", ROOM_CODE_ATTEMPTS)
    }

    /// Destroy rooms created and never joined
    async fn reap_abandoned(&self, node: &Arc<Node>) {
        for room in self.rooms.take_abandoned(ABANDONED_ROOM_TIMEOUT) {
            let code = room.lock().code;
            self.unpublish(node, &code.to_string()).await;
            NodeStats::dec(&node.stats().rooms_active);
            info!("Room {} on {} was never joined, destroyed", code, node.label());
        }
    }

    async fn unpublish(&self, node: &Node, code: &str) {
        if let Err(e) = node.ledger().del(&keys::room(code)).await {
            debug!("Could not unpublish room {}: {}", code, e);
        }
    }
}

#[async_trait]
impl NodeRole for WorkerRole {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn register(self: Arc<Self>, dispatcher: &mut Dispatcher) {
        dispatcher.register(MessageKind::HostGame, Arc::new(HostGame(self.clone())));
        dispatcher.register(MessageKind::JoinGame, Arc::new(JoinGame(self.clone())));
        dispatcher.register(MessageKind::StartGame, Arc::new(StartGame(self.clone())));
        dispatcher.register(MessageKind::GameData, Arc::new(GameDataScope(self.clone())));
        dispatcher.register(MessageKind::GameDataTo, Arc::new(GameDataScope(self.clone())));

        let traffic: Arc<dyn MessageHandler> = Arc::new(ObjectTraffic(self.clone()));
        for kind in [MessageKind::Data, MessageKind::Rpc, MessageKind::Despawn] {
            dispatcher.register(kind, traffic.clone());
        }
        dispatcher.register(MessageKind::Spawn, Arc::new(SpawnCheck(self)));
    }

    /// Take a connection slot, then consume the redirect proof
    async fn handle_initial(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        hello: &Packet,
    ) -> anyhow::Result<bool> {
        let Packet::Hello { username, version, .. } = hello else {
            return Ok(false);
        };
        // Identify refuses the version; the proof and the slot stay untouched
        if !node.config().anticheat.versions.contains(version) {
            return Ok(true);
        }
        let ip = conn.ip();

        match Admission::new(node.ledger(), &node.config().anticheat)
            .register(ip)
            .await
        {
            Ok(_) => conn.state().counted = true,
            Err(AdmissionError::Ledger(e)) => return Err(e.into()),
            Err(e) => {
                info!("Client {} ({}) refused: {}", conn.id, conn.remote, e);
                node.disconnect(conn, e.reason(), e.message()).await;
                return Ok(false);
            }
        }

        let consumed = handoff::consume_redirect(node.ledger(), ip, username).await?;
        if !consumed.accepted() {
            info!("Client {} ({}) was not redirected here", conn.id, conn.remote);
            node.disconnect(conn, DisconnectReason::Custom, Some(NOT_REDIRECTED.to_string()))
                .await;
            return Ok(false);
        }

        if let Consumed::Remaining(count) = consumed {
            debug!("Client {} ({}) redirect proof still expects {}", conn.id, conn.remote, count);
        }
        Ok(true)
    }

    async fn on_disconnect(&self, node: &Arc<Node>, conn: &Arc<Connection>) -> anyhow::Result<()> {
        self.leave_room(node, conn).await;

        let counted = std::mem::take(&mut conn.state().counted);
        if counted {
            Admission::new(node.ledger(), &node.config().anticheat)
                .unregister(conn.ip())
                .await?;
        }
        Ok(())
    }

    async fn on_shutdown(&self, node: &Arc<Node>) -> anyhow::Result<()> {
        let rooms = self.rooms.drain();
        info!(
            "Shutting down {} with {} rooms and {} clients",
            node.label(),
            rooms.len(),
            node.connections().count()
        );
        for (_, room) in rooms {
            let code = room.lock().code.to_string();
            self.unpublish(node, &code).await;
            NodeStats::dec(&node.stats().rooms_active);
        }
        Ok(())
    }
}

struct HostGame(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for HostGame {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Payload(Payload::HostGame { options }) = message else {
            return Ok(Flow::Continue);
        };
        if node.check_mods(conn).await {
            return Ok(Flow::Halt);
        }

        if !options.is_valid() && node.config().anticheat.check_settings.is_enabled() {
            warn!("Client {} ({}) created a game with invalid settings", conn.id, conn.remote);
            if node.penalize(conn, Check::CheckSettings).await {
                return Ok(Flow::Halt);
            }
        }

        self.0.reap_abandoned(node).await;
        let code = match self.0.open_room(node, *options).await {
            Ok(code) => code,
            Err(e) => {
                node.join_error(conn, DisconnectReason::ServerRequest, None).await;
                return Err(e);
            }
        };
        info!("Client {} ({}) created room {}", conn.id, conn.remote, code);

        node.send_reliable(conn, vec![Payload::GameCreated { code: code.to_int() }])
            .await;
        Ok(Flow::Continue)
    }
}

struct JoinGame(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for JoinGame {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Payload(Payload::JoinGame { code }) = message else {
            return Ok(Flow::Continue);
        };
        if node.check_mods(conn).await {
            return Ok(Flow::Halt);
        }

        let Some(room) = self.0.rooms.get(*code) else {
            node.join_error(conn, DisconnectReason::GameNotFound, None).await;
            return Ok(Flow::Continue);
        };
        if conn.room().is_some_and(|current| current != *code) {
            self.0.leave_room(node, conn).await;
        }

        let username = conn.username().unwrap_or_default();
        let joined = {
            let mut room = room.lock();
            room.add_player(Player::new(conn.id, username)).map(|()| {
                let others: Vec<ClientId> =
                    room.player_ids().into_iter().filter(|id| *id != conn.id).collect();
                (room.host_id().unwrap_or(conn.id), others)
            })
        };

        match joined {
            Ok((host_id, others)) => {
                conn.state().room = Some(*code);
                info!("Client {} ({}) joined room {}", conn.id, conn.remote, code);
                let reply = Payload::JoinedGame {
                    code: *code,
                    client_id: conn.id,
                    host_id,
                    others,
                };
                node.send_reliable(conn, vec![reply]).await;
            }
            Err(RoomError::AlreadyJoined) => {}
            Err(RoomError::RoomFull) => {
                node.join_error(conn, DisconnectReason::GameFull, None).await;
            }
            Err(RoomError::GameInProgress) => {
                node.join_error(conn, DisconnectReason::GameStarted, None).await;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(Flow::Continue)
    }
}

struct StartGame(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for StartGame {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Payload(Payload::StartGame { code }) = message else {
            return Ok(Flow::Continue);
        };
        let Some(room) = self.0.room_of(conn, *code) else {
            return Ok(Flow::Halt);
        };

        let is_host = room.lock().is_host(conn.id);
        if !is_host {
            warn!("Client {} ({}) tried to start room {} without hosting", conn.id, conn.remote, code);
            node.penalize(conn, Check::HostChecks).await;
            return Ok(Flow::Halt);
        }

        if let Err(e) = room.lock().start() {
            debug!("Client {} ({}) start of room {}: {}", conn.id, conn.remote, code, e);
        }
        Ok(Flow::Continue)
    }
}

/// Room scoping of game data: the sender's room, and for directed data a host recipient
struct GameDataScope(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for GameDataScope {
    async fn handle(
        &self,
        _node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let (code, recipient) = match message {
            Message::Payload(Payload::GameData { code, .. }) => (*code, None),
            Message::Payload(Payload::GameDataTo { code, recipient, .. }) => (*code, Some(*recipient)),
            _ => return Ok(Flow::Continue),
        };
        let Some(room) = self.0.room_of(conn, code) else {
            return Ok(Flow::Halt);
        };

        let room = room.lock();
        if room.get_player(conn.id).is_none() {
            return Ok(Flow::Halt);
        }
        if let Some(recipient) = recipient {
            let to_host = room.get_player(recipient).is_some_and(|p| p.is_host);
            if !to_host {
                return Ok(Flow::Halt);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Ownership check for data, rpc and despawn messages
struct ObjectTraffic(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for ObjectTraffic {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Game { code, message } = message else {
            return Ok(Flow::Continue);
        };
        let Some(net_id) = message.net_id() else {
            return Ok(Flow::Continue);
        };
        let Some(room) = self.0.room_of(conn, code) else {
            return Ok(Flow::Halt);
        };

        let allowed = {
            let room = room.lock();
            room.get_player(conn.id)
                .and_then(|_| room.may_control(conn.id, net_id))
        };
        match allowed {
            None => return Ok(Flow::Continue),
            Some(false) => {
                warn!(
                    "Client {} ({}) sent {:?} for object {} it does not own",
                    conn.id,
                    conn.remote,
                    message.kind(),
                    net_id
                );
                let stop = node.penalize(conn, Check::CheckObjectOwnership).await;
                return Ok(if stop { Flow::Halt } else { Flow::Continue });
            }
            Some(true) => {}
        }

        if let Err(e) = room.lock().apply(conn.id, message) {
            debug!("Client {} ({}) {:?}: {}", conn.id, conn.remote, message.kind(), e);
        }
        Ok(Flow::Continue)
    }
}

/// Host authority and component count of spawns
struct SpawnCheck(Arc<WorkerRole>);

#[async_trait]
impl MessageHandler for SpawnCheck {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Game { code, message: spawn } = message else {
            return Ok(Flow::Continue);
        };
        let GameMessage::Spawn {
            spawn_type,
            components,
            ..
        } = spawn
        else {
            return Ok(Flow::Continue);
        };
        let Some(room) = self.0.room_of(conn, code) else {
            return Ok(Flow::Halt);
        };

        let membership = {
            let room = room.lock();
            room.get_player(conn.id).map(|p| p.is_host)
        };
        match membership {
            None => return Ok(Flow::Continue),
            Some(false) => {
                warn!("Client {} ({}) tried to spawn without hosting", conn.id, conn.remote);
                let stop = node.penalize(conn, Check::HostChecks).await;
                return Ok(if stop { Flow::Halt } else { Flow::Continue });
            }
            Some(true) => {}
        }

        if let Some(expected) = expected_components(*spawn_type) {
            if components.len() != expected {
                warn!(
                    "Client {} ({}) spawned type {} with {} components, expected {}",
                    conn.id,
                    conn.remote,
                    spawn_type,
                    components.len(),
                    expected
                );
                let stop = node.penalize(conn, Check::MalformedPackets).await;
                return Ok(if stop { Flow::Halt } else { Flow::Continue });
            }
        }

        if let Err(e) = room.lock().apply(conn.id, spawn) {
            debug!("Client {} ({}) spawn: {}", conn.id, conn.remote, e);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anticheat::penalty::{CheckPolicy, Penalty, PenaltyRule};
    use crate::cluster::handoff::{read_record, record_redirect, throttle_delay};
    use crate::config::{NodeEndpoint, ServerConfig};
    use crate::ledger::{Ledger, MemoryLedger};
    use crate::net::protocol::{GameVersion, ObjectOwner, SpawnComponent};
    use crate::net::testing::{client_addr, hello, reliable, shared_ip_addr, InterferingLedger, TestFleet};
    use std::net::SocketAddr;
    use std::sync::atomic::Ordering;

    fn worker_endpoint() -> NodeEndpoint {
        NodeEndpoint::new("127.0.0.1".parse().unwrap(), 22123)
    }

    fn host_game() -> Payload {
        Payload::HostGame {
            options: GameOptions::default(),
        }
    }

    struct Harness {
        fleet: TestFleet,
        role: Arc<WorkerRole>,
        node: Arc<Node>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(ServerConfig::default())
        }

        fn with_config(config: ServerConfig) -> Self {
            let fleet = TestFleet::with_config(config);
            let role = Arc::new(WorkerRole::new());
            let node = fleet.node_with_role(worker_endpoint(), role.clone());
            Self { fleet, role, node }
        }

        /// Worker reaching the fleet ledger through a wrapper
        fn with_ledger(wrap: impl FnOnce(Arc<MemoryLedger>) -> Arc<dyn Ledger>) -> Self {
            let fleet = TestFleet::new();
            let role = Arc::new(WorkerRole::new());
            let ledger = wrap(fleet.ledger.clone());
            let node = fleet.node_with_ledger(worker_endpoint(), ledger, role.clone());
            Self { fleet, role, node }
        }

        fn rooms_active(&self) -> u64 {
            self.node.stats().rooms_active.load(Ordering::Relaxed)
        }

        /// Redirect proof plus handshake
        async fn connect(&self, remote: SocketAddr, username: &str) {
            record_redirect(self.fleet.ledger.as_ref(), remote.ip(), username)
                .await
                .unwrap();
            self.fleet.deliver(&self.node, remote, &hello(1, username)).await;
        }

        async fn send(&self, remote: SocketAddr, nonce: u32, messages: Vec<Payload>) {
            self.fleet.deliver(&self.node, remote, &reliable(nonce, messages)).await;
        }

        fn created_code(&self, remote: SocketAddr) -> i32 {
            self.fleet
                .sink
                .payloads_to(remote)
                .into_iter()
                .find_map(|p| match p {
                    Payload::GameCreated { code } => Some(code),
                    _ => None,
                })
                .unwrap()
        }

        /// Host creates a room, then host and guests join it in order
        async fn room_with(&self, members: &[(SocketAddr, &str)]) -> i32 {
            for (remote, name) in members {
                self.connect(*remote, name).await;
            }
            let host = members[0].0;
            self.send(host, 2, vec![Payload::HostGame { options: GameOptions::default() }])
                .await;
            let code = self.created_code(host);
            for (remote, _) in members {
                self.send(*remote, 3, vec![Payload::JoinGame { code }]).await;
            }
            code
        }

        fn conn(&self, remote: SocketAddr) -> Arc<Connection> {
            self.node.connections().get(&remote).unwrap()
        }
    }

    fn game_data(code: i32, messages: Vec<GameMessage>) -> Payload {
        Payload::GameData { code, messages }
    }

    fn spawn(owner: ObjectOwner, net_ids: &[u32]) -> GameMessage {
        GameMessage::Spawn {
            spawn_type: 4,
            owner,
            components: net_ids
                .iter()
                .map(|net_id| SpawnComponent {
                    net_id: *net_id,
                    data: vec![],
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_handshake_without_proof_is_refused() {
        let h = Harness::new();
        let remote = client_addr(1);

        h.fleet.deliver(&h.node, remote, &hello(1, "alice")).await;

        assert_eq!(
            h.fleet.sink.packets_to(remote).last(),
            Some(&Packet::Disconnect {
                reason: Some(DisconnectReason::Custom),
                message: Some(NOT_REDIRECTED.to_string()),
            })
        );
        assert!(h.node.connections().get(&remote).is_none());
        assert!(h
            .fleet
            .ledger
            .get(&keys::connections(remote.ip()))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_proof_is_consumed_or_decremented() {
        let h = Harness::new();
        let ledger = h.fleet.ledger.as_ref();
        let alice = client_addr(1);
        let bob = client_addr(2);

        h.connect(alice, "alice").await;
        assert!(h.node.connections().get(&alice).is_some());
        assert!(read_record(ledger, alice.ip(), "alice").await.unwrap().is_none());

        record_redirect(ledger, bob.ip(), "bob").await.unwrap();
        throttle_delay(ledger, bob.ip(), "bob").await.unwrap();
        h.fleet.deliver(&h.node, bob, &hello(1, "bob")).await;
        assert!(h.node.connections().get(&bob).is_some());
        assert_eq!(read_record(ledger, bob.ip(), "bob").await.unwrap().unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_connection_counting_per_ip() {
        let h = Harness::new();
        let ledger = h.fleet.ledger.as_ref();
        let first = shared_ip_addr(40_001);
        let second = shared_ip_addr(40_002);
        let third = shared_ip_addr(40_003);

        h.connect(first, "a").await;
        h.connect(second, "b").await;
        h.connect(third, "c").await;

        let key = keys::connections(first.ip());
        assert_eq!(ledger.get(&key).await.unwrap().as_deref(), Some("2"));
        assert!(h.node.connections().get(&third).is_none());
        assert_eq!(
            h.fleet.sink.packets_to(third).last(),
            Some(&Packet::Disconnect {
                reason: Some(DisconnectReason::Custom),
                message: Some("Too many connections coming from your IP.".to_string()),
            })
        );

        h.node.disconnect(&h.conn(first), DisconnectReason::None, None).await;
        assert_eq!(ledger.get(&key).await.unwrap().as_deref(), Some("1"));
        h.node.disconnect(&h.conn(second), DisconnectReason::None, None).await;
        assert!(ledger.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_host_join_and_leave_lifecycle() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);

        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;
        let text = RoomCode::from_int(code).unwrap().to_string();
        assert_eq!(
            h.fleet.ledger.get(&keys::room(&text)).await.unwrap().as_deref(),
            Some("127.0.0.1:22123")
        );
        assert!(h.fleet.sink.payloads_to(bob).contains(&Payload::JoinedGame {
            code,
            client_id: h.conn(bob).id,
            host_id: h.conn(alice).id,
            others: vec![h.conn(alice).id],
        }));

        let bob_id = h.conn(bob).id;
        h.node.disconnect(&h.conn(alice), DisconnectReason::None, None).await;
        assert!(h.role.rooms().get(code).unwrap().lock().is_host(bob_id));

        h.node.disconnect(&h.conn(bob), DisconnectReason::None, None).await;
        assert!(h.role.rooms().get(code).is_none());
        assert!(h.fleet.ledger.get(&keys::room(&text)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_refusals() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);
        let carol = client_addr(3);

        let code = h.room_with(&[(alice, "alice")]).await;
        h.connect(bob, "bob").await;
        h.send(bob, 2, vec![Payload::JoinGame { code: code ^ 1 }]).await;
        assert!(h.fleet.sink.payloads_to(bob).contains(&Payload::JoinError {
            reason: DisconnectReason::GameNotFound,
            message: None,
        }));

        h.send(alice, 4, vec![Payload::StartGame { code }]).await;
        h.connect(carol, "carol").await;
        h.send(carol, 2, vec![Payload::JoinGame { code }]).await;
        assert!(h.fleet.sink.payloads_to(carol).contains(&Payload::JoinError {
            reason: DisconnectReason::GameStarted,
            message: None,
        }));
        assert_eq!(h.conn(carol).state().strikes.get(Check::HostChecks), 0);
    }

    #[tokio::test]
    async fn test_invalid_settings_strikes_then_disconnects() {
        let mut config = ServerConfig::default();
        config.anticheat.check_settings = CheckPolicy::Rule(PenaltyRule {
            penalty: Some(Penalty::Disconnect),
            strikes: Some(3),
            ban_duration: None,
        });
        let h = Harness::with_config(config);
        let remote = client_addr(1);
        h.connect(remote, "alice").await;

        let invalid = GameOptions {
            max_players: 200,
            ..Default::default()
        };
        for nonce in 2..=4 {
            h.send(remote, nonce, vec![Payload::HostGame { options: invalid }]).await;
        }

        assert_eq!(h.role.rooms().count(), 2);
        assert!(h.node.connections().get(&remote).is_none());
        assert!(matches!(
            h.fleet.sink.packets_to(remote).last(),
            Some(Packet::Disconnect {
                reason: Some(DisconnectReason::Hacking),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_non_host_start_is_penalized() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);
        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;

        h.send(bob, 4, vec![Payload::StartGame { code }]).await;

        assert!(h.node.connections().get(&bob).is_none());
        assert_eq!(
            h.role.rooms().get(code).unwrap().lock().state,
            crate::lobby::RoomState::Waiting
        );
    }

    #[tokio::test]
    async fn test_object_ownership() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);
        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;
        let bob_id = h.conn(bob).id;

        h.send(
            alice,
            4,
            vec![game_data(
                code,
                vec![spawn(ObjectOwner::Client(bob_id), &[10, 11, 12]), spawn(ObjectOwner::Host, &[20, 21, 22])],
            )],
        )
        .await;
        let room = h.role.rooms().get(code).unwrap();
        assert_eq!(room.lock().object_count(), 6);

        // own object and host-owned object from the host are fine
        h.send(bob, 4, vec![game_data(code, vec![GameMessage::Rpc { net_id: 10, call_id: 0, data: vec![] }])])
            .await;
        h.send(alice, 5, vec![game_data(code, vec![GameMessage::Despawn { net_id: 20 }])])
            .await;
        assert_eq!(room.lock().object_count(), 5);

        // unknown object is dropped without a penalty
        h.send(bob, 5, vec![game_data(code, vec![GameMessage::Data { net_id: 99, data: vec![] }])])
            .await;
        assert!(h.node.connections().get(&bob).is_some());

        h.send(bob, 6, vec![game_data(code, vec![GameMessage::Despawn { net_id: 21 }])])
            .await;
        assert!(h.node.connections().get(&bob).is_none());
        assert!(room.lock().object(21).is_some());
    }

    #[tokio::test]
    async fn test_spawn_checks() {
        let mut config = ServerConfig::default();
        config.anticheat.malformed_packets = CheckPolicy::Toggle(true);
        let h = Harness::with_config(config);
        let alice = client_addr(1);
        let bob = client_addr(2);
        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;
        let room = h.role.rooms().get(code).unwrap();

        h.send(alice, 4, vec![game_data(code, vec![spawn(ObjectOwner::Host, &[1, 2])])])
            .await;
        assert!(h.node.connections().get(&alice).is_none());
        assert_eq!(room.lock().object_count(), 0);

        h.send(bob, 4, vec![game_data(code, vec![spawn(ObjectOwner::Host, &[1, 2, 3])])])
            .await;
        assert_eq!(room.lock().object_count(), 3);
    }

    #[tokio::test]
    async fn test_spawn_from_non_host_never_reaches_room() {
        let mut config = ServerConfig::default();
        config.anticheat.host_checks = CheckPolicy::Rule(PenaltyRule {
            penalty: Some(Penalty::Disconnect),
            strikes: Some(5),
            ban_duration: None,
        });
        let h = Harness::with_config(config);
        let alice = client_addr(1);
        let bob = client_addr(2);
        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;

        h.send(bob, 4, vec![game_data(code, vec![spawn(ObjectOwner::Host, &[1, 2, 3])])])
            .await;

        assert!(h.node.connections().get(&bob).is_some());
        assert_eq!(h.conn(bob).state().strikes.get(Check::HostChecks), 1);
        assert_eq!(h.role.rooms().get(code).unwrap().lock().object_count(), 0);
    }

    #[tokio::test]
    async fn test_game_data_for_other_room_is_dropped() {
        let h = Harness::new();
        let alice = client_addr(1);
        let code = h.room_with(&[(alice, "alice")]).await;

        h.send(alice, 4, vec![game_data(code ^ 1, vec![spawn(ObjectOwner::Host, &[1, 2, 3])])])
            .await;
        assert_eq!(h.role.rooms().get(code).unwrap().lock().object_count(), 0);
    }

    #[tokio::test]
    async fn test_directed_data_must_address_host() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);
        let code = h.room_with(&[(alice, "alice"), (bob, "bob")]).await;
        let alice_id = h.conn(alice).id;
        let bob_id = h.conn(bob).id;

        let to = |recipient| Payload::GameDataTo {
            code,
            recipient,
            messages: vec![spawn(ObjectOwner::Host, &[1, 2, 3])],
        };
        h.send(alice, 4, vec![to(bob_id)]).await;
        assert_eq!(h.role.rooms().get(code).unwrap().lock().object_count(), 0);

        h.send(alice, 5, vec![to(alice_id)]).await;
        assert_eq!(h.role.rooms().get(code).unwrap().lock().object_count(), 3);
    }

    #[tokio::test]
    async fn test_wrong_version_keeps_proof_and_slot() {
        let h = Harness::new();
        let ledger = h.fleet.ledger.as_ref();
        let remote = client_addr(1);
        record_redirect(ledger, remote.ip(), "alice").await.unwrap();

        let outdated = Packet::Hello {
            nonce: 1,
            version: GameVersion::new(2019, 1, 1, 0),
            username: "alice".to_string(),
            mod_count: None,
        };
        h.fleet.deliver(&h.node, remote, &outdated).await;

        assert_eq!(
            h.fleet.sink.packets_to(remote).last(),
            Some(&Packet::Disconnect {
                reason: Some(DisconnectReason::IncorrectVersion),
                message: None,
            })
        );
        assert_eq!(read_record(ledger, remote.ip(), "alice").await.unwrap().unwrap().count, 1);
        assert!(ledger.get(&keys::connections(remote.ip())).await.unwrap().is_none());

        // the updated client still gets in on the same proof
        h.fleet.deliver(&h.node, remote, &hello(1, "alice")).await;
        assert!(h.node.connections().get(&remote).is_some());
        assert!(read_record(ledger, remote.ip(), "alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpublished_room_is_not_kept() {
        let h = Harness::with_ledger(|inner| Arc::new(InterferingLedger::failing_writes(inner, "room.")));
        let alice = client_addr(1);
        h.connect(alice, "alice").await;

        h.send(alice, 2, vec![host_game()]).await;

        assert_eq!(h.role.rooms().count(), 0);
        assert_eq!(h.rooms_active(), 0);
        let payloads = h.fleet.sink.payloads_to(alice);
        assert!(payloads.contains(&Payload::JoinError {
            reason: DisconnectReason::ServerRequest,
            message: None,
        }));
        assert!(!payloads.iter().any(|p| matches!(p, Payload::GameCreated { .. })));
        assert!(h.fleet.ledger.keys("room.").await.unwrap().is_empty());
        assert!(h.node.connections().get(&alice).is_some());
    }

    #[tokio::test]
    async fn test_code_claimed_by_other_worker_is_redrawn() {
        let h = Harness::with_ledger(|inner| Arc::new(InterferingLedger::taken_claims(inner, "room.", 3)));
        let alice = client_addr(1);
        h.connect(alice, "alice").await;

        h.send(alice, 2, vec![host_game()]).await;

        let code = h.created_code(alice);
        let text = RoomCode::from_int(code).unwrap().to_string();
        assert_eq!(h.role.rooms().codes(), vec![code]);
        assert_eq!(h.rooms_active(), 1);
        assert_eq!(
            h.fleet.ledger.get(&keys::room(&text)).await.unwrap().as_deref(),
            Some("127.0.0.1:22123")
        );
    }

    #[tokio::test]
    async fn test_no_free_code_creates_nothing() {
        let h = Harness::with_ledger(|inner| {
            Arc::new(InterferingLedger::taken_claims(inner, "room.", ROOM_CODE_ATTEMPTS))
        });
        let alice = client_addr(1);
        h.connect(alice, "alice").await;

        h.send(alice, 2, vec![host_game()]).await;

        assert_eq!(h.role.rooms().count(), 0);
        assert_eq!(h.rooms_active(), 0);
        assert!(h.fleet.sink.payloads_to(alice).contains(&Payload::JoinError {
            reason: DisconnectReason::ServerRequest,
            message: None,
        }));
    }

    #[tokio::test]
    async fn test_published_code_is_never_overwritten() {
        let h = Harness::new();
        let alice = client_addr(1);
        let code = h.room_with(&[(alice, "alice")]).await;
        let text = RoomCode::from_int(code).unwrap().to_string();
        h.fleet
            .ledger
            .set(&keys::room(&text), "127.0.0.1:22124", None)
            .await
            .unwrap();

        assert!(!h
            .fleet
            .ledger
            .set_nx(&keys::room(&text), h.node.label(), None)
            .await
            .unwrap());
        assert_eq!(
            h.fleet.ledger.get(&keys::room(&text)).await.unwrap().as_deref(),
            Some("127.0.0.1:22124")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_room_is_reaped_on_next_host() {
        let h = Harness::new();
        let alice = client_addr(1);
        let bob = client_addr(2);
        h.connect(alice, "alice").await;
        h.send(alice, 2, vec![host_game()]).await;
        let abandoned = h.created_code(alice);
        let text = RoomCode::from_int(abandoned).unwrap().to_string();

        tokio::time::advance(ABANDONED_ROOM_TIMEOUT + Duration::from_secs(1)).await;
        h.connect(bob, "bob").await;
        h.send(bob, 2, vec![host_game()]).await;

        assert!(h.role.rooms().get(abandoned).is_none());
        assert_eq!(h.role.rooms().count(), 1);
        assert_eq!(h.rooms_active(), 1);
        assert!(h.fleet.ledger.get(&keys::room(&text)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_destroys_rooms() {
        let h = Harness::new();
        let alice = client_addr(1);
        let code = h.room_with(&[(alice, "alice")]).await;
        let text = RoomCode::from_int(code).unwrap().to_string();

        h.node.shutdown().await;

        assert_eq!(h.role.rooms().count(), 0);
        assert!(h.fleet.ledger.get(&keys::room(&text)).await.unwrap().is_none());
        assert!(h
            .fleet
            .ledger
            .get(&keys::connections(alice.ip()))
            .await
            .unwrap()
            .is_none());
    }
}
