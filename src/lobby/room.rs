use std::time::Duration;

use tokio::time::Instant;

use rustc_hash::FxHashMap;

use crate::lobby::code::RoomCode;
use crate::lobby::player::Player;
use crate::net::protocol::{ClientId, GameMessage, GameOptions, NetId, ObjectOwner};

/// Component count of each known spawn type
const SPAWN_COMPONENTS: [(u32, usize); 9] = [
    (0, 1), // ship status
    (1, 1), // meeting hud
    (2, 1), // lobby behaviour
    (3, 2), // game data + vote ban system
    (4, 3), // player control + physics + network transform
    (5, 1), // headquarters
    (6, 1), // planet map
    (7, 1), // april ship status
    (8, 1), // airship
];

/// Expected component count for a spawn type, `None` if the type is unknown
pub fn expected_components(spawn_type: u32) -> Option<usize> {
    SPAWN_COMPONENTS
        .iter()
        .find(|(kind, _)| *kind == spawn_type)
        .map(|(_, count)| *count)
}

/// Room state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    /// Waiting for players
    Waiting,
    /// Game in progress
    Started,
}

/// A spawned network object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetObject {
    pub spawn_type: u32,
    pub owner: ObjectOwner,
}

/// Game room: members, settings and the network-object ownership table
#[derive(Debug)]
pub struct Room {
    pub code: RoomCode,
    pub state: RoomState,
    pub options: GameOptions,
    pub created_at: Instant,
    /// Join order, oldest first
    players: Vec<Player>,
    objects: FxHashMap<NetId, NetObject>,
    messages_applied: u64,
}

impl Room {
    /// Nobody ever joined and the room has waited at least `max_idle`
    pub fn is_abandoned(&self, max_idle: Duration) -> bool {
        self.is_empty() && self.state == RoomState::Waiting && self.created_at.elapsed() >= max_idle
    }

    pub fn new(code: RoomCode, options: GameOptions) -> Self {
        Self {
            code,
            state: RoomState::Waiting,
            options,
            created_at: Instant::now(),
            players: Vec::new(),
            objects: FxHashMap::default(),
            messages_applied: 0,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.players.len() >= usize::from(self.options.max_players)
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn host_id(&self) -> Option<ClientId> {
        self.players.iter().find(|p| p.is_host).map(|p| p.client_id)
    }

    pub fn is_host(&self, client_id: ClientId) -> bool {
        self.host_id() == Some(client_id)
    }

    pub fn get_player(&self, client_id: ClientId) -> Option<&Player> {
        self.players.iter().find(|p| p.client_id == client_id)
    }

    pub fn player_ids(&self) -> Vec<ClientId> {
        self.players.iter().map(|p| p.client_id).collect()
    }

    /// Add a member; the first one becomes host
    pub fn add_player(&mut self, mut player: Player) -> Result<(), RoomError> {
        if self.get_player(player.client_id).is_some() {
            return Err(RoomError::AlreadyJoined);
        }
        if self.state != RoomState::Waiting {
            return Err(RoomError::GameInProgress);
        }
        if self.is_full() {
            return Err(RoomError::RoomFull);
        }

        player.is_host = self.players.is_empty();
        self.players.push(player);
        Ok(())
    }

    /// Remove a member, handing host to the oldest remaining one
    ///
    /// Objects owned by the member go with it.
    pub fn remove_player(&mut self, client_id: ClientId) -> Option<Player> {
        let index = self.players.iter().position(|p| p.client_id == client_id)?;
        let player = self.players.remove(index);

        if player.is_host {
            if let Some(next) = self.players.first_mut() {
                next.is_host = true;
            }
        }
        self.objects
            .retain(|_, object| object.owner != ObjectOwner::Client(client_id));

        Some(player)
    }

    pub fn start(&mut self) -> Result<(), RoomError> {
        if self.state != RoomState::Waiting {
            return Err(RoomError::GameInProgress);
        }
        self.state = RoomState::Started;
        Ok(())
    }

    pub fn object(&self, net_id: NetId) -> Option<&NetObject> {
        self.objects.get(&net_id)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Whether `client_id` may address `net_id`; `None` for unknown objects
    pub fn may_control(&self, client_id: ClientId, net_id: NetId) -> Option<bool> {
        let object = self.objects.get(&net_id)?;
        Some(match object.owner {
            ObjectOwner::Client(owner) => owner == client_id,
            ObjectOwner::Host => self.is_host(client_id),
        })
    }

    /// Hand a validated game message to the object model
    pub fn apply(&mut self, sender: ClientId, message: &GameMessage) -> Result<(), RoomError> {
        if self.get_player(sender).is_none() {
            return Err(RoomError::PlayerNotFound);
        }

        match message {
            GameMessage::Data { net_id, .. } | GameMessage::Rpc { net_id, .. } => {
                if !self.objects.contains_key(net_id) {
                    return Err(RoomError::UnknownObject(*net_id));
                }
            }
            GameMessage::Despawn { net_id } => {
                if self.objects.remove(net_id).is_none() {
                    return Err(RoomError::UnknownObject(*net_id));
                }
            }
            GameMessage::Spawn {
                spawn_type,
                owner,
                components,
            } => {
                if let Some(taken) = components
                    .iter()
                    .find(|c| self.objects.contains_key(&c.net_id))
                {
                    return Err(RoomError::DuplicateObject(taken.net_id));
                }
                for component in components {
                    self.objects.insert(
                        component.net_id,
                        NetObject {
                            spawn_type: *spawn_type,
                            owner: *owner,
                        },
                    );
                }
            }
        }

        self.messages_applied += 1;
        Ok(())
    }

    pub fn messages_applied(&self) -> u64 {
        self.messages_applied
    }
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("Room is full")]
    RoomFull,
    #[error("Game already in progress")]
    GameInProgress,
    #[error("Player already in room")]
    AlreadyJoined,
    #[error("Player not found")]
    PlayerNotFound,
    #[error("Unknown network object {0}")]
    UnknownObject(NetId),
    #[error("Network object {0} already exists")]
    DuplicateObject(NetId),
}
