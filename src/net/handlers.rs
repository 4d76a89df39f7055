//! Handlers installed on every node
//!
//! - acknowledgement replies for nonce-bearing packets
//! - identity handshake with the client version gate
//! - client disconnect requests
//! - acknowledgement reconciliation for our own reliable sends
//! - mod declarations (modded handshake only)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, trace};

use crate::anticheat::mods::ModInfo;
use crate::net::connection::Connection;
use crate::net::dispatch::{Dispatcher, Flow, Message, MessageHandler};
use crate::net::node::Node;
use crate::net::protocol::{DisconnectReason, MessageKind, Packet, Payload};

/// Upper bound on declarations kept for one client
const MAX_DECLARED_MODS: usize = 256;

pub fn install(dispatcher: &mut Dispatcher, reactor: bool) {
    let reply: Arc<dyn MessageHandler> = Arc::new(AcknowledgeReply);
    for kind in [MessageKind::Hello, MessageKind::Reliable, MessageKind::Ping] {
        dispatcher.register(kind, reply.clone());
    }
    dispatcher.register(MessageKind::Hello, Arc::new(Identify));
    dispatcher.register(MessageKind::Disconnect, Arc::new(DisconnectRequest));
    dispatcher.register(MessageKind::Acknowledge, Arc::new(Acknowledgement));

    if reactor {
        dispatcher.register(MessageKind::ModDeclaration, Arc::new(ModDeclarations));
    }
}

/// Acknowledge every accepted nonce
struct AcknowledgeReply;

#[async_trait]
impl MessageHandler for AcknowledgeReply {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Packet(packet) = message else {
            return Ok(Flow::Continue);
        };
        let Some(nonce) = packet.reliable_nonce() else {
            return Ok(Flow::Continue);
        };

        let missing = conn.state().reliability.record_received(nonce);
        node.send(conn, &Packet::Acknowledge { nonce, missing }).await;
        Ok(Flow::Continue)
    }
}

struct Identify;

#[async_trait]
impl MessageHandler for Identify {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Packet(Packet::Hello {
            version,
            username,
            mod_count,
            ..
        }) = message
        else {
            return Ok(Flow::Continue);
        };

        if conn.is_identified() {
            trace!("Client {} ({}) repeated its handshake", conn.id, conn.remote);
            return Ok(Flow::Halt);
        }

        if !node.config().anticheat.versions.contains(version) {
            info!(
                "Client {} ({}) refused: unsupported version {}",
                conn.id, conn.remote, version
            );
            node.disconnect(conn, DisconnectReason::IncorrectVersion, None)
                .await;
            return Ok(Flow::Halt);
        }

        {
            let mut state = conn.state();
            state.identified = true;
            state.username = Some(username.clone());
            state.version = Some(*version);
            if let Some(count) = mod_count {
                state.expected_mods = Some(*count);
                state.mods = Some(Vec::new());
            }
        }

        info!(
            "Client {} ({}) identified as {} (version {}{})",
            conn.id,
            conn.remote,
            username,
            version,
            mod_count
                .map(|count| format!(", {} mods", count))
                .unwrap_or_default()
        );

        if node.config().reactor.enabled() && mod_count.is_some() {
            let config = node.config();
            let handshake = Payload::ReactorHandshake {
                server_name: config.server_name.clone(),
                server_version: config.server_version.clone(),
                plugin_count: 0,
            };
            node.send_reliable(conn, vec![handshake]).await;
        }

        Ok(Flow::Continue)
    }
}

struct DisconnectRequest;

#[async_trait]
impl MessageHandler for DisconnectRequest {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        if let Message::Packet(Packet::Disconnect { reason, .. }) = message {
            debug!("Client {} ({}) asked to disconnect", conn.id, conn.remote);
            node.disconnect(conn, reason.unwrap_or(DisconnectReason::None), None)
                .await;
        }
        Ok(Flow::Halt)
    }
}

struct Acknowledgement;

#[async_trait]
impl MessageHandler for Acknowledgement {
    async fn handle(
        &self,
        _node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        if let Message::Packet(Packet::Acknowledge { nonce, .. }) = message {
            let acked = conn.state().reliability.acknowledge(*nonce);
            if !acked {
                trace!("Client {} ({}) acknowledged unknown nonce {}", conn.id, conn.remote, nonce);
            }
        }
        Ok(Flow::Continue)
    }
}

struct ModDeclarations;

#[async_trait]
impl MessageHandler for ModDeclarations {
    async fn handle(
        &self,
        _node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Payload(Payload::ModDeclaration { mod_id, version }) = message else {
            return Ok(Flow::Continue);
        };

        let mut state = conn.state();
        let limit = state
            .expected_mods
            .map_or(MAX_DECLARED_MODS, |count| (count as usize).min(MAX_DECLARED_MODS));
        let mods = state.mods.get_or_insert_with(Vec::new);
        if mods.len() >= limit {
            debug!("Client {} ({}) declared more mods than announced", conn.id, conn.remote);
            return Ok(Flow::Continue);
        }
        if !mods.iter().any(|m| &m.id == mod_id) {
            mods.push(ModInfo::new(mod_id.clone(), version.clone()));
        }
        Ok(Flow::Continue)
    }
}
