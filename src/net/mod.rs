//! Networking: wire protocol, reliable UDP connections and the node runtime

pub mod admission;
pub mod connection;
pub mod dispatch;
pub mod handlers;
pub mod node;
pub mod protocol;
pub mod reliability;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::Connection;
pub use dispatch::{Dispatcher, Flow, Message, MessageHandler};
pub use node::{Node, NodeRole};
pub use transport::{Listener, PacketSink};
