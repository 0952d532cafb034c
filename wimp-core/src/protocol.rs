//! WIMP protocol constants: well-known opcodes, process names, relations and the connection handshake.

use serde::{Deserialize, Serialize};

/// Current protocol version. Sent in every handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Handshake magic: "wimp" read as a little-endian u32.
pub const HANDSHAKE_MAGIC: u32 = 0x706d_6977;

/// Longest process name accepted on the wire, in bytes.
pub const MAX_NAME_LEN: usize = 32;

/// Handshake size: magic + version + padded process name.
pub const HANDSHAKE_SIZE: usize = 4 + 1 + MAX_NAME_LEN;

/// Peer should leave its processing loop.
pub const EXIT: u64 = 1_540_385;
/// Payload is UTF-8 text to display.
pub const LOG: u64 = 161_821;
/// Liveness check; receivers conventionally answer with PING.
pub const PING: u64 = 1_446_181;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Derive an opcode from an instruction name (FNV-1a, 64-bit).
/// Lets processes agree on opcodes by name without sharing an enum.
pub fn opcode_from_name(name: &str) -> u64 {
    name.bytes().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(b)).wrapping_mul(FNV_PRIME)
    })
}

/// Declared topology role of a peer. Informational; never used for routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    #[default]
    Unknown,
    Child,
    Parent,
    Independent,
}

impl Relation {
    /// Stable numeric code (Unknown = 0 .. Independent = 3).
    pub fn code(self) -> i32 {
        match self {
            Relation::Unknown => 0,
            Relation::Child => 1,
            Relation::Parent => 2,
            Relation::Independent => 3,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Relation::Child,
            2 => Relation::Parent,
            3 => Relation::Independent,
            _ => Relation::Unknown,
        }
    }
}

impl std::str::FromStr for Relation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unknown" => Ok(Relation::Unknown),
            "child" => Ok(Relation::Child),
            "parent" => Ok(Relation::Parent),
            "independent" => Ok(Relation::Independent),
            other => Err(format!("unknown relation: {other}")),
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Relation::Unknown => "unknown",
            Relation::Child => "child",
            Relation::Parent => "parent",
            Relation::Independent => "independent",
        };
        f.write_str(s)
    }
}

/// A process name is non-empty printable ASCII of at most [`MAX_NAME_LEN`] bytes.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.bytes().all(|b| b.is_ascii_graphic() || b == b' ')
}

/// Pack a name into a NUL-padded fixed field. None if the name is invalid.
pub fn pack_name(name: &str) -> Option<[u8; MAX_NAME_LEN]> {
    if !is_valid_name(name) {
        return None;
    }
    let mut out = [0u8; MAX_NAME_LEN];
    out[..name.len()].copy_from_slice(name.as_bytes());
    Some(out)
}

/// Inverse of [`pack_name`]. Rejects empty names, non-ASCII bytes and bytes after the padding starts.
pub fn unpack_name(field: &[u8; MAX_NAME_LEN]) -> Option<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN);
    if field[end..].iter().any(|&b| b != 0) {
        return None;
    }
    let name = std::str::from_utf8(&field[..end]).ok()?;
    is_valid_name(name).then(|| name.to_string())
}

/// Handshake bytes for `name`: magic (LE) + version + padded name.
pub fn handshake_bytes(name: &str) -> Option<[u8; HANDSHAKE_SIZE]> {
    let packed = pack_name(name)?;
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0..4].copy_from_slice(&HANDSHAKE_MAGIC.to_le_bytes());
    out[4] = PROTOCOL_VERSION;
    out[5..].copy_from_slice(&packed);
    Some(out)
}

/// Error parsing a handshake received from a peer.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("bad handshake magic {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported protocol version {0}")]
    Version(u8),
    #[error("invalid process name in handshake")]
    InvalidName,
}

/// Parse a handshake and return the announced process name.
pub fn parse_handshake(buf: &[u8; HANDSHAKE_SIZE]) -> Result<String, HandshakeError> {
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != HANDSHAKE_MAGIC {
        return Err(HandshakeError::BadMagic(magic));
    }
    if buf[4] != PROTOCOL_VERSION {
        return Err(HandshakeError::Version(buf[4]));
    }
    let mut field = [0u8; MAX_NAME_LEN];
    field.copy_from_slice(&buf[5..]);
    unpack_name(&field).ok_or(HandshakeError::InvalidName)
}
