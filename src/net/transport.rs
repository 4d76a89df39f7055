//! UDP transport
//!
//! The [`Listener`] owns the node's socket. Datagrams are fanned out to one inbox
//! task per remote endpoint so a connection's packets are handled strictly in order
//! while other connections keep being served.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::net::node::Node;

/// Largest datagram read from the socket
const RECV_BUFFER_SIZE: usize = 64 * 1024;
/// Datagrams queued per remote before further ones are dropped
const INBOX_CAPACITY: usize = 64;
/// Inbox table size above which closed inboxes are pruned
const INBOX_PRUNE_THRESHOLD: usize = 1024;

/// Outbound half of the transport
#[async_trait]
pub trait PacketSink: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> std::io::Result<usize>;
}

#[async_trait]
impl PacketSink for UdpSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> std::io::Result<usize> {
        UdpSocket::send_to(self, data, target).await
    }
}

/// UDP listener of one node
pub struct Listener {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// The socket, to be handed to the node as its packet sink
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive until the node shuts down
    pub async fn run(self, node: Arc<Node>) -> anyhow::Result<()> {
        let mut closed = node.closed();
        let mut inboxes: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        tracing::info!(
            "{} {} listening on udp://{}",
            node.role_name(),
            node.label(),
            self.local_addr
        );

        while !*closed.borrow() {
            let (len, remote) = tokio::select! {
                _ = closed.changed() => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        tracing::debug!("UDP receive error on {}: {}", self.local_addr, e);
                        continue;
                    }
                },
            };

            let datagram = buffer[..len].to_vec();
            let datagram = match inboxes.get(&remote) {
                Some(inbox) => match inbox.try_send(datagram) {
                    Ok(()) => continue,
                    Err(TrySendError::Full(_)) => {
                        tracing::trace!("Inbox for {} full, dropping datagram", remote);
                        continue;
                    }
                    Err(TrySendError::Closed(datagram)) => datagram,
                },
                None => datagram,
            };

            if inboxes.len() > INBOX_PRUNE_THRESHOLD {
                inboxes.retain(|_, inbox| !inbox.is_closed());
            }

            let (inbox, rx) = mpsc::channel(INBOX_CAPACITY);
            if inbox.try_send(datagram).is_ok() {
                inboxes.insert(remote, inbox);
                tokio::spawn(drain_inbox(node.clone(), remote, rx));
            }
        }

        tracing::info!("{} {} closed its socket", node.role_name(), node.label());
        Ok(())
    }
}

/// Feed one remote's datagrams to the node in arrival order
///
/// Once the remote has no connection the inbox is closed before it is emptied, so
/// a datagram either gets queued here and handled, or bounces back to the listener
/// as `Closed` and opens a fresh inbox.
async fn drain_inbox(node: Arc<Node>, remote: SocketAddr, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(datagram) = rx.recv().await {
        node.receive(remote, &datagram).await;
        if !node.connections().contains(&remote) {
            rx.close();
            while let Some(datagram) = rx.recv().await {
                node.receive(remote, &datagram).await;
            }
            break;
        }
    }
}
