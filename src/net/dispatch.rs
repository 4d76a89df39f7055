//! Handler table keyed by message kind
//!
//! Handlers are registered explicitly while a node is being built. Dispatching a
//! packet walks it outermost first: packet handlers, then each payload, then each
//! game message inside a payload.

use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::net::connection::Connection;
use crate::net::node::Node;
use crate::net::protocol::{GameMessage, MessageKind, Packet, Payload};

/// A borrowed view of one message at any nesting level
#[derive(Debug, Clone, Copy)]
pub enum Message<'a> {
    Packet(&'a Packet),
    Payload(&'a Payload),
    Game {
        code: i32,
        message: &'a GameMessage,
    },
}

impl Message<'_> {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Packet(packet) => packet.kind(),
            Message::Payload(payload) => payload.kind(),
            Message::Game { message, .. } => message.kind(),
        }
    }
}

/// Whether dispatch continues after a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip the remaining handlers of this message and everything nested in it
    Halt,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        node: &Arc<Node>,
        conn: &Arc<Connection>,
        message: Message<'_>,
    ) -> anyhow::Result<Flow>;
}

type HandlerList = SmallVec<[Arc<dyn MessageHandler>; 2]>;

#[derive(Default)]
pub struct Dispatcher {
    handlers: FxHashMap<MessageKind, HandlerList>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `kind`; handlers run in registration order
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(kind).or_default().push(handler);
    }

    pub fn handler_count(&self, kind: MessageKind) -> usize {
        self.handlers.get(&kind).map_or(0, |list| list.len())
    }

    /// Route a decoded packet through every matching handler
    pub async fn dispatch(&self, node: &Arc<Node>, conn: &Arc<Connection>, packet: &Packet) {
        if self.run(node, conn, Message::Packet(packet)).await == Flow::Halt {
            return;
        }

        for payload in packet.payloads() {
            if conn.is_disconnected() {
                return;
            }
            if self.run(node, conn, Message::Payload(payload)).await == Flow::Halt {
                continue;
            }

            let code = match payload {
                Payload::GameData { code, .. } | Payload::GameDataTo { code, .. } => *code,
                _ => continue,
            };
            for message in payload.game_messages() {
                if conn.is_disconnected() {
                    return;
                }
                self.run(node, conn, Message::Game { code, message }).await;
            }
        }
    }

    async fn run(&self, node: &Arc<Node>, conn: &Arc<Connection>, message: Message<'_>) -> Flow {
        let kind = message.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            return Flow::Continue;
        };

        for handler in handlers {
            if conn.is_disconnected() {
                return Flow::Halt;
            }
            match handler.handle(node, conn, message).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return Flow::Halt,
                Err(e) => {
                    tracing::error!(
                        "Handler for {:?} failed (client {}, {}): {:#}",
                        kind,
                        conn.id,
                        conn.remote,
                        e
                    );
                    return Flow::Halt;
                }
            }
        }
        Flow::Continue
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.handlers.len())
            .finish()
    }
}
