//! Load balancer: admission, then redirects to workers
//!
//! Host requests go to a uniformly random worker; join requests go to the worker
//! that published the room code.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use crate::cluster::handoff;
use crate::config::{NodeEndpoint, ServerConfig};
use crate::ledger::{keys, Ledger, LedgerError};
use crate::lobby::RoomCode;
use crate::net::admission::Admission;
use crate::net::connection::Connection;
use crate::net::dispatch::{Dispatcher, Flow, Message, MessageHandler};
use crate::net::node::{Node, NodeRole};
use crate::net::protocol::{DisconnectReason, MessageKind, Packet, Payload};

#[derive(Debug, Default)]
pub struct BalancerRole;

impl BalancerRole {
    pub fn new() -> Self {
        Self
    }

    /// Drop proofs and counters left by a previous run
    pub async fn prepare_ledger(ledger: &dyn Ledger, config: &ServerConfig) -> Result<(), LedgerError> {
        if config.ledger.flush_on_start {
            ledger.flush().await?;
            info!("Flushed {} ledger", ledger.name());
        }
        Ok(())
    }
}

#[async_trait]
impl NodeRole for BalancerRole {
    fn name(&self) -> &'static str {
        "master"
    }

    fn register(self: Arc<Self>, dispatcher: &mut Dispatcher) {
        dispatcher.register(MessageKind::HostGame, Arc::new(HostGameRedirect));
        dispatcher.register(MessageKind::JoinGame, Arc::new(JoinGameRedirect));
    }

    /// Ban check, then the per-IP limit; nothing is counted here
    async fn handle_initial(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        _hello: &Packet,
    ) -> anyhow::Result<bool> {
        let admission = Admission::new(node.ledger(), &node.config().anticheat);
        let ip = conn.ip();

        let verdict = match admission.check_ban(ip).await {
            Ok(()) => admission.check_capacity(ip).await,
            Err(e) => Err(e),
        };

        match verdict {
            Ok(()) => Ok(true),
            Err(e) => {
                info!("Client {} ({}) refused: {}", conn.id, conn.remote, e);
                node.disconnect(conn, e.reason(), e.message()).await;
                Ok(false)
            }
        }
    }
}

struct HostGameRedirect;

#[async_trait]
impl MessageHandler for HostGameRedirect {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow> {
        let Message::Payload(Payload::HostGame { .. }) = message else {
            return Ok(Flow::Continue);
        };
        if node.check_mods(conn).await {
            return Ok(Flow::Halt);
        }
        let Some(username) = conn.username() else {
            return Ok(Flow::Halt);
        };

        let target = node.config().master.nodes.choose(&mut rand::thread_rng()).copied();
        let Some(target) = target else {
            warn!("No workers configured, cannot place client {} ({})", conn.id, conn.remote);
            node.join_error(conn, DisconnectReason::ServerRequest, None).await;
            return Ok(Flow::Halt);
        };

        handoff::issue_redirect(node, conn, &username, target).await?;
        Ok(Flow::Continue)
    }
}

struct JoinGameRedirect;

impl JoinGameRedirect {
    async fn owner_of(node: &Node, code: i32) -> anyhow::Result<Option<NodeEndpoint>> {
        let Some(code) = RoomCode::from_int(code) else {
            return Ok(None);
        };
        let owner = node.ledger().get(&keys::room(&code.to_string())).await?;
        Ok(owner
            .and_then(|raw| raw.parse::<SocketAddr>().ok())
            .map(|addr| NodeEndpoint::new(addr.ip(), addr.port())))
    }
}

#[async_trait]
impl MessageHandler for JoinGameRedirect {
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
        let Some(username) = conn.username() else {
            return Ok(Flow::Halt);
        };

        match Self::owner_of(node, *code).await? {
            Some(target) => {
                handoff::issue_redirect(node, conn, &username, target).await?;
            }
            None => {
                debug!("Client {} ({}) asked for unknown room {}", conn.id, conn.remote, code);
                node.join_error(conn, DisconnectReason::GameNotFound, None).await;
            }
        }
        Ok(Flow::Continue)
    }
}
