//! Rooms hosted by worker nodes
//!
//! Membership, host migration and the network-object ownership table used by
//! the worker's traffic checks.

pub mod code;
pub mod manager;
pub mod player;
pub mod room;

pub use code::RoomCode;
pub use manager::RoomTable;
pub use player::Player;
pub use room::{expected_components, Room, RoomError, RoomState};
