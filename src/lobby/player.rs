use std::time::Instant;

use crate::net::protocol::ClientId;

/// Room member, keyed by its connection id
#[derive(Debug, Clone)]
pub struct Player {
    pub client_id: ClientId,
    pub username: String,
    pub is_host: bool,
    pub joined_at: Instant,
}

impl Player {
    pub fn new(client_id: ClientId, username: impl Into<String>) -> Self {
        Self {
            client_id,
            username: username.into(),
            is_host: false,
            joined_at: Instant::now(),
        }
    }
}
