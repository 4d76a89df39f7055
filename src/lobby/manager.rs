use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;

use crate::lobby::code::RoomCode;
use crate::lobby::room::Room;
use crate::net::protocol::GameOptions;

/// Rooms hosted by one worker, keyed by integer room code
///
/// Each room sits behind its own lock; callers never hold it across an await.
#[derive(Debug, Default)]
pub struct RoomTable {
    rooms: RwLock<FxHashMap<i32, Arc<Mutex<Room>>>>,
}

impl RoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room under a fresh code
    pub fn create(&self, options: GameOptions) -> (RoomCode, Arc<Mutex<Room>>) {
        let mut rng = rand::thread_rng();
        let mut rooms = self.rooms.write();

        let code = loop {
            let code = RoomCode::random(&mut rng);
            if !rooms.contains_key(&code.to_int()) {
                break code;
            }
        };

        let room = Arc::new(Mutex::new(Room::new(code, options)));
        rooms.insert(code.to_int(), room.clone());
        (code, room)
    }

    pub fn get(&self, code: i32) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().get(&code).cloned()
    }

    pub fn remove(&self, code: i32) -> Option<Arc<Mutex<Room>>> {
        self.rooms.write().remove(&code)
    }

    pub fn count(&self) -> usize {
        self.rooms.read().len()
    }

    pub fn codes(&self) -> Vec<i32> {
        self.rooms.read().keys().copied().collect()
    }

    /// Take out rooms nobody joined within `max_idle`
    pub fn take_abandoned(&self, max_idle: Duration) -> Vec<Arc<Mutex<Room>>> {
        let mut rooms = self.rooms.write();
        let codes: Vec<i32> = rooms
            .iter()
            .filter(|(_, room)| room.lock().is_abandoned(max_idle))
            .map(|(code, _)| *code)
            .collect();
        codes.iter().filter_map(|code| rooms.remove(code)).collect()
    }

    /// Take every room out of the table
    pub fn drain(&self) -> Vec<(i32, Arc<Mutex<Room>>)> {
        self.rooms.write().drain().collect()
    }
}
