use std::str::FromStr;

use rand::Rng;

const CODE_LEN: usize = 6;
const ALPHABET: &[u8; 26] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Six-letter room code, carried on the wire as an integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomCode(i32);

impl RoomCode {
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut value = 0i32;
        for _ in 0..CODE_LEN {
            value = value * 26 + rng.gen_range(0..26);
        }
        Self(value)
    }

    /// Accept an integer only if it encodes a six-letter code
    pub fn from_int(value: i32) -> Option<Self> {
        if (0..26i32.pow(CODE_LEN as u32)).contains(&value) {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn to_int(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for RoomCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut letters = [b'A'; CODE_LEN];
        let mut value = self.0;
        for slot in letters.iter_mut().rev() {
            *slot = ALPHABET[(value % 26) as usize];
            value /= 26;
        }
        f.write_str(&String::from_utf8_lossy(&letters))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid room code '{0}'")]
pub struct ParseRoomCodeError(String);

impl FromStr for RoomCode {
    type Err = ParseRoomCodeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let upper = raw.trim().to_ascii_uppercase();
        if upper.len() != CODE_LEN || !upper.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseRoomCodeError(raw.to_string()));
        }

        let value = upper
            .bytes()
            .fold(0i32, |acc, b| acc * 26 + i32::from(b - b'A'));
        Ok(Self(value))
    }
}
