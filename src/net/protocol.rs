//! Wire protocol: root packets, top-level messages and room-scoped game messages
//!
//! Every datagram carries exactly one [`Packet`]. Reliable packets wrap a list of
//! [`Payload`] messages; game-data payloads in turn wrap [`GameMessage`]s addressed
//! to network objects. The [`Codec`] decodes only message kinds registered with it,
//! so extensions (the modded handshake) are enabled by registration at startup.

use std::net::IpAddr;
use std::str::FromStr;

use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Reliable-delivery sequence number
pub type Nonce = u32;
/// Process-local connection identity
pub type ClientId = u32;
/// Network object identity inside a room
pub type NetId = u32;

/// Upper bound on what the decoder will allocate for one datagram
const MAX_DECODE_BYTES: usize = 64 * 1024;

/// Client build version, written `year.month.day[.revision]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GameVersion {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub revision: u8,
}

impl GameVersion {
    pub const fn new(year: u16, month: u8, day: u8, revision: u8) -> Self {
        Self {
            year,
            month,
            day,
            revision,
        }
    }
}

impl std::fmt::Display for GameVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.year, self.month, self.day)?;
        if self.revision > 0 {
            write!(f, ".{}", self.revision)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid game version '{0}'")]
pub struct ParseVersionError(String);

impl FromStr for GameVersion {
    type Err = ParseVersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(raw.to_string());
        let parts: Vec<&str> = raw.trim().split('.').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(invalid());
        }

        let year = parts[0].parse().map_err(|_| invalid())?;
        let month = parts[1].parse().map_err(|_| invalid())?;
        let day = parts[2].parse().map_err(|_| invalid())?;
        let revision = match parts.get(3) {
            Some(rev) => rev.parse().map_err(|_| invalid())?,
            None => 0,
        };

        Ok(Self::new(year, month, day, revision))
    }
}

impl TryFrom<String> for GameVersion {
    type Error = ParseVersionError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<GameVersion> for String {
    fn from(version: GameVersion) -> Self {
        version.to_string()
    }
}

/// Reason code attached to disconnects and join errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    None,
    IncorrectVersion,
    Banned,
    GameNotFound,
    GameFull,
    GameStarted,
    Hacking,
    ServerRequest,
    Custom,
}

/// Game settings declared by the host (owned by the game model)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GameOptions {
    pub max_players: u8,
    pub map: u8,
    pub num_impostors: u8,
    pub kill_cooldown: f32,
    pub player_speed: f32,
}

impl GameOptions {
    pub fn is_valid(&self) -> bool {
        (4..=15).contains(&self.max_players)
            && self.map <= 4
            && (1..=3).contains(&self.num_impostors)
            && self.kill_cooldown.is_finite()
            && (10.0..=60.0).contains(&self.kill_cooldown)
            && self.player_speed.is_finite()
            && (0.5..=3.0).contains(&self.player_speed)
    }
}

impl Default for GameOptions {
    fn default() -> Self {
        Self {
            max_players: 10,
            map: 0,
            num_impostors: 1,
            kill_cooldown: 15.0,
            player_speed: 1.0,
        }
    }
}

/// Owner of a network object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectOwner {
    /// Owned by whoever currently hosts the room
    Host,
    Client(ClientId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnComponent {
    pub net_id: NetId,
    pub data: Vec<u8>,
}

/// Root packet, one per datagram
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Identity handshake; `mod_count` is set by modded clients
    Hello {
        nonce: Nonce,
        version: GameVersion,
        username: String,
        mod_count: Option<u32>,
    },
    Reliable {
        nonce: Nonce,
        messages: Vec<Payload>,
    },
    Unreliable {
        messages: Vec<Payload>,
    },
    /// `missing` flags which of the 8 nonces before `nonce` were not seen
    Acknowledge {
        nonce: Nonce,
        missing: u8,
    },
    Ping {
        nonce: Nonce,
    },
    Disconnect {
        reason: Option<DisconnectReason>,
        message: Option<String>,
    },
}

/// Top-level message carried by reliable/unreliable packets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    HostGame {
        options: GameOptions,
    },
    /// Reply to a host-game request with the new room code
    GameCreated {
        code: i32,
    },
    JoinGame {
        code: i32,
    },
    JoinedGame {
        code: i32,
        client_id: ClientId,
        host_id: ClientId,
        others: Vec<ClientId>,
    },
    JoinError {
        reason: DisconnectReason,
        message: Option<String>,
    },
    StartGame {
        code: i32,
    },
    Redirect {
        ip: IpAddr,
        port: u16,
    },
    GameData {
        code: i32,
        messages: Vec<GameMessage>,
    },
    GameDataTo {
        code: i32,
        recipient: ClientId,
        messages: Vec<GameMessage>,
    },
    /// One mod of a modded client (extension)
    ModDeclaration {
        mod_id: String,
        version: String,
    },
    /// Server identity sent to modded clients (extension)
    ReactorHandshake {
        server_name: String,
        server_version: String,
        plugin_count: u32,
    },
}

/// Room-scoped message addressed to a network object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GameMessage {
    Data {
        net_id: NetId,
        data: Vec<u8>,
    },
    Rpc {
        net_id: NetId,
        call_id: u8,
        data: Vec<u8>,
    },
    Despawn {
        net_id: NetId,
    },
    Spawn {
        spawn_type: u32,
        owner: ObjectOwner,
        components: Vec<SpawnComponent>,
    },
}

impl GameMessage {
    /// Target object of object-addressed messages
    pub fn net_id(&self) -> Option<NetId> {
        match self {
            GameMessage::Data { net_id, .. }
            | GameMessage::Rpc { net_id, .. }
            | GameMessage::Despawn { net_id } => Some(*net_id),
            GameMessage::Spawn { .. } => None,
        }
    }
}

/// Runtime type of any message, the key of the handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Hello,
    Reliable,
    Unreliable,
    Acknowledge,
    Ping,
    Disconnect,
    HostGame,
    GameCreated,
    JoinGame,
    JoinedGame,
    JoinError,
    StartGame,
    Redirect,
    GameData,
    GameDataTo,
    ModDeclaration,
    ReactorHandshake,
    Data,
    Rpc,
    Despawn,
    Spawn,
}

impl MessageKind {
    /// Kinds understood by an unextended node
    pub const BASE: [MessageKind; 19] = [
        MessageKind::Hello,
        MessageKind::Reliable,
        MessageKind::Unreliable,
        MessageKind::Acknowledge,
        MessageKind::Ping,
        MessageKind::Disconnect,
        MessageKind::HostGame,
        MessageKind::GameCreated,
        MessageKind::JoinGame,
        MessageKind::JoinedGame,
        MessageKind::JoinError,
        MessageKind::StartGame,
        MessageKind::Redirect,
        MessageKind::GameData,
        MessageKind::GameDataTo,
        MessageKind::Data,
        MessageKind::Rpc,
        MessageKind::Despawn,
        MessageKind::Spawn,
    ];

    /// Kinds added by the modded handshake extension
    pub const REACTOR: [MessageKind; 2] = [MessageKind::ModDeclaration, MessageKind::ReactorHandshake];

    /// Whether clients may send this kind to a node
    pub fn is_serverbound(&self) -> bool {
        !matches!(
            self,
            MessageKind::GameCreated
                | MessageKind::JoinedGame
                | MessageKind::JoinError
                | MessageKind::Redirect
                | MessageKind::ReactorHandshake
        )
    }
}

impl Packet {
    pub fn kind(&self) -> MessageKind {
        match self {
            Packet::Hello { .. } => MessageKind::Hello,
            Packet::Reliable { .. } => MessageKind::Reliable,
            Packet::Unreliable { .. } => MessageKind::Unreliable,
            Packet::Acknowledge { .. } => MessageKind::Acknowledge,
            Packet::Ping { .. } => MessageKind::Ping,
            Packet::Disconnect { .. } => MessageKind::Disconnect,
        }
    }

    /// Nonce of packets that expect an acknowledgement
    pub fn reliable_nonce(&self) -> Option<Nonce> {
        match self {
            Packet::Hello { nonce, .. } | Packet::Reliable { nonce, .. } | Packet::Ping { nonce } => {
                Some(*nonce)
            }
            _ => None,
        }
    }

    /// Payloads wrapped by this packet
    pub fn payloads(&self) -> &[Payload] {
        match self {
            Packet::Reliable { messages, .. } | Packet::Unreliable { messages } => messages,
            _ => &[],
        }
    }

    /// Every message kind in this packet, outermost first
    pub fn kinds(&self) -> Vec<MessageKind> {
        let mut kinds = vec![self.kind()];
        for payload in self.payloads() {
            kinds.push(payload.kind());
            for message in payload.game_messages() {
                kinds.push(message.kind());
            }
        }
        kinds
    }
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::HostGame { .. } => MessageKind::HostGame,
            Payload::GameCreated { .. } => MessageKind::GameCreated,
            Payload::JoinGame { .. } => MessageKind::JoinGame,
            Payload::JoinedGame { .. } => MessageKind::JoinedGame,
            Payload::JoinError { .. } => MessageKind::JoinError,
            Payload::StartGame { .. } => MessageKind::StartGame,
            Payload::Redirect { .. } => MessageKind::Redirect,
            Payload::GameData { .. } => MessageKind::GameData,
            Payload::GameDataTo { .. } => MessageKind::GameDataTo,
            Payload::ModDeclaration { .. } => MessageKind::ModDeclaration,
            Payload::ReactorHandshake { .. } => MessageKind::ReactorHandshake,
        }
    }

    pub fn game_messages(&self) -> &[GameMessage] {
        match self {
            Payload::GameData { messages, .. } | Payload::GameDataTo { messages, .. } => messages,
            _ => &[],
        }
    }
}

impl GameMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            GameMessage::Data { .. } => MessageKind::Data,
            GameMessage::Rpc { .. } => MessageKind::Rpc,
            GameMessage::Despawn { .. } => MessageKind::Despawn,
            GameMessage::Spawn { .. } => MessageKind::Spawn,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty datagram")]
    Empty,
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),
    #[error("Message kind {0:?} is not registered")]
    Unregistered(MessageKind),
    #[error("Message kind {0:?} cannot be sent by clients")]
    WrongDirection(MessageKind),
}

#[derive(Debug, thiserror::Error)]
#[error("Failed to encode packet: {0}")]
pub struct EncodeError(String);

/// Packet encoder/decoder with a registry of accepted message kinds
#[derive(Debug, Clone)]
pub struct Codec {
    registered: FxHashSet<MessageKind>,
}

impl Codec {
    /// Codec accepting the base message kinds
    pub fn new() -> Self {
        Self {
            registered: MessageKind::BASE.into_iter().collect(),
        }
    }

    /// Accept an additional message kind
    pub fn register(&mut self, kind: MessageKind) {
        self.registered.insert(kind);
    }

    pub fn is_registered(&self, kind: MessageKind) -> bool {
        self.registered.contains(&kind)
    }

    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, EncodeError> {
        bincode::serde::encode_to_vec(packet, bincode::config::legacy())
            .map_err(|e| EncodeError(e.to_string()))
    }

    /// Decode a client datagram, rejecting unregistered and clientbound kinds
    pub fn decode(&self, data: &[u8]) -> Result<Packet, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::Empty);
        }

        let config = bincode::config::legacy().with_limit::<MAX_DECODE_BYTES>();
        let (packet, read): (Packet, usize) = bincode::serde::decode_from_slice(data, config)
            .map_err(|e| DecodeError::Malformed(e.to_string()))?;

        if read != data.len() {
            return Err(DecodeError::TrailingBytes(data.len() - read));
        }

        for kind in packet.kinds() {
            if !self.is_registered(kind) {
                return Err(DecodeError::Unregistered(kind));
            }
            if !kind.is_serverbound() {
                return Err(DecodeError::WrongDirection(kind));
            }
        }

        Ok(packet)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}
