use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::anticheat::mods::ModInfo;
use crate::anticheat::penalty::StrikeCounter;
use crate::net::protocol::{ClientId, GameVersion, Nonce};
use crate::net::reliability::ReliabilityState;

/// Mutable per-connection state, guarded by the connection's lock
///
/// The lock is never held across an await point; handlers copy what they need out
/// of the guard before touching the ledger or the socket.
#[derive(Debug, Default)]
pub struct ConnectionState {
    /// Set once, by the first accepted handshake
    pub identified: bool,
    pub username: Option<String>,
    pub version: Option<GameVersion>,
    /// `None` until the client declares its mods
    pub mods: Option<Vec<ModInfo>>,
    /// Mod count announced by a modded handshake
    pub expected_mods: Option<u32>,
    /// Passed the node's initial admission hook
    pub initialized: bool,
    /// Contributed to the fleet-wide per-IP connection counter
    pub counted: bool,
    pub reliability: ReliabilityState,
    pub strikes: StrikeCounter,
    /// Room code, worker nodes only
    pub room: Option<i32>,
    next_nonce: Nonce,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl ConnectionState {
    /// Allocate the next outbound nonce
    pub fn next_nonce(&mut self) -> Nonce {
        self.next_nonce = self.next_nonce.wrapping_add(1);
        self.next_nonce
    }

    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
    }
}

/// One remote endpoint as seen by a node
#[derive(Debug)]
pub struct Connection {
    pub id: ClientId,
    pub remote: SocketAddr,
    pub created_at: Instant,
    disconnected: AtomicBool,
    state: Mutex<ConnectionState>,
}

impl Connection {
    pub fn new(id: ClientId, remote: SocketAddr) -> Self {
        Self {
            id,
            remote,
            created_at: Instant::now(),
            disconnected: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.remote.ip()
    }

    pub fn state(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    /// Flag the connection as gone; only the first caller gets `true`
    pub fn mark_disconnected(&self) -> bool {
        !self.disconnected.swap(true, Ordering::AcqRel)
    }

    pub fn username(&self) -> Option<String> {
        self.state().username.clone()
    }

    pub fn is_identified(&self) -> bool {
        self.state().identified
    }

    pub fn room(&self) -> Option<i32> {
        self.state().room
    }
}

/// Connections of one node keyed by remote endpoint
#[derive(Debug)]
pub struct ConnectionTable {
    connections: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    /// Process-local, restarts at 1 with the node
    next_id: AtomicU32,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub fn get(&self, remote: &SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().get(remote).cloned()
    }

    pub fn contains(&self, remote: &SocketAddr) -> bool {
        self.connections.read().contains_key(remote)
    }

    /// Return the connection for `remote`, creating it if unseen
    ///
    /// The flag tells whether the connection was created by this call.
    pub fn get_or_create(&self, remote: SocketAddr) -> (Arc<Connection>, bool) {
        if let Some(conn) = self.get(&remote) {
            return (conn, false);
        }

        let mut connections = self.connections.write();
        if let Some(conn) = connections.get(&remote) {
            return (conn.clone(), false);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, remote));
        connections.insert(remote, conn.clone());
        (conn, true)
    }

    pub fn by_id(&self, id: ClientId) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .values()
            .find(|conn| conn.id == id)
            .cloned()
    }

    /// Remove `conn` if it still owns its endpoint slot
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut connections = self.connections.write();
        match connections.get(&conn.remote) {
            Some(current) if current.id == conn.id => {
                connections.remove(&conn.remote);
                true
            }
            _ => false,
        }
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Snapshot of every live connection
    pub fn all(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[test]
    fn test_connection_new() {
        let conn = Connection::new(1, test_addr(8080));
        assert_eq!(conn.id, 1);
        assert!(!conn.is_identified());
        assert!(conn.username().is_none());
        assert!(!conn.is_disconnected());
    }

    #[test]
    fn test_mark_disconnected_once() {
        let conn = Connection::new(1, test_addr(8080));
        assert!(conn.mark_disconnected());
        assert!(!conn.mark_disconnected());
        assert!(conn.is_disconnected());
    }

    #[test]
    fn test_outbound_nonces_start_at_one() {
        let conn = Connection::new(1, test_addr(8080));
        let mut state = conn.state();
        assert_eq!(state.next_nonce(), 1);
        assert_eq!(state.next_nonce(), 2);
    }

    #[test]
    fn test_connection_stats() {
        let conn = Connection::new(1, test_addr(8080));
        let mut state = conn.state();

        state.record_sent(100);
        state.record_sent(200);
        state.record_received(50);

        assert_eq!(state.bytes_sent, 300);
        assert_eq!(state.bytes_received, 50);
        assert_eq!(state.packets_sent, 2);
        assert_eq!(state.packets_received, 1);
    }

    #[test]
    fn test_table_ids_are_monotonic() {
        let table = ConnectionTable::new();

        let (first, created) = table.get_or_create(test_addr(1));
        assert!(created);
        let (second, _) = table.get_or_create(test_addr(2));
        let (again, created) = table.get_or_create(test_addr(1));

        assert!(!created);
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(again.id, first.id);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn test_table_remove() {
        let table = ConnectionTable::new();
        let (conn, _) = table.get_or_create(test_addr(1));

        assert!(table.remove(&conn));
        assert!(!table.remove(&conn));
        assert_eq!(table.count(), 0);
        assert!(table.get(&test_addr(1)).is_none());
    }

    #[test]
    fn test_stale_remove_keeps_new_connection() {
        let table = ConnectionTable::new();
        let (old, _) = table.get_or_create(test_addr(1));
        table.remove(&old);

        let (fresh, _) = table.get_or_create(test_addr(1));
        assert_ne!(fresh.id, old.id);
        assert!(!table.remove(&old));
        assert!(table.by_id(fresh.id).is_some());
    }
}
