use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use crate::entity::{EntityId, Position};

pub const PROTOCOL_MAGIC: u32 = 0x4452_4654;
pub const PROTOCOL_VERSION: u8 = 1;
pub const DEFAULT_PORT: u16 = 19501;

/// magic (u32 BE) + version (u8) + payload length (u32 BE)
pub const HEADER_LEN: usize = 9;
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;
pub const MAX_DATAGRAM_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_SIZE;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerEntry {
    pub identifier: EntityId,
    pub x: f32,
    pub y: f32,
}

impl PlayerEntry {
    pub fn new(identifier: EntityId, position: Position) -> Self {
        Self {
            identifier,
            x: position.x,
            y: position.y,
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.x, self.y)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum Message {
    Introduce {
        identifier: EntityId,
    },
    Update {
        identifier: EntityId,
        sequence: u32,
        x: f32,
        y: f32,
    },
    Leave {
        identifier: EntityId,
    },
    PlayerListSnapshot {
        entries: Vec<PlayerEntry>,
    },
    Ping {
        identifier: EntityId,
    },
    Pong {
        identifier: EntityId,
    },
    Rejected {
        reason: String,
    },
}

impl Message {
    pub fn update(identifier: EntityId, sequence: u32, position: Position) -> Self {
        Self::Update {
            identifier,
            sequence,
            x: position.x,
            y: position.y,
        }
    }

    /// Identifier of the entity the message speaks for, if any.
    pub fn identifier(&self) -> Option<&EntityId> {
        match self {
            Self::Introduce { identifier }
            | Self::Update { identifier, .. }
            | Self::Leave { identifier }
            | Self::Ping { identifier }
            | Self::Pong { identifier } => Some(identifier),
            Self::PlayerListSnapshot { .. } | Self::Rejected { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Introduce { .. } => "introduce",
            Self::Update { .. } => "update",
            Self::Leave { .. } => "leave",
            Self::PlayerListSnapshot { .. } => "player-list",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Rejected { .. } => "rejected",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        encode(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        decode(data)
    }
}

/// Every variant except `Serialize` and `Oversized` on encode means the bytes
/// were malformed; callers drop the datagram or close the stream.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit")]
    Oversized(usize),
    #[error("truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("bad protocol magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
}

/// Validates a header and returns the payload length it announces.
pub fn parse_header(header: &[u8]) -> Result<usize, PacketError> {
    if header.len() < HEADER_LEN {
        return Err(PacketError::Truncated {
            expected: HEADER_LEN,
            actual: header.len(),
        });
    }

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != PROTOCOL_MAGIC {
        return Err(PacketError::BadMagic(magic));
    }

    let version = header[4];
    if version != PROTOCOL_VERSION {
        return Err(PacketError::UnsupportedVersion(version));
    }

    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(PacketError::Oversized(len));
    }

    Ok(len)
}

pub fn encode(message: &Message) -> Result<Vec<u8>, PacketError> {
    let payload = rkyv::to_bytes::<rancor::Error>(message).map_err(PacketError::Serialize)?;
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(PacketError::Oversized(payload.len()));
    }

    let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
    bytes.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    bytes.push(PROTOCOL_VERSION);
    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

pub fn decode(data: &[u8]) -> Result<Message, PacketError> {
    let len = parse_header(data)?;
    let actual = data.len() - HEADER_LEN;
    if actual != len {
        return Err(PacketError::Truncated {
            expected: HEADER_LEN + len,
            actual: data.len(),
        });
    }

    // Receive buffers carry no alignment guarantee; archived data needs one.
    let mut aligned = AlignedVec::<16>::with_capacity(len);
    aligned.extend_from_slice(&data[HEADER_LEN..]);
    rkyv::from_bytes::<Message, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
}
