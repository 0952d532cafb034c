//! Framing: fixed 80-byte header (bincode, fixed-int LE) + raw argument bytes.
//!
//! Header layout: total_size u32 | opcode u64 | arg_size u32 | dest [u8; 32] | source [u8; 32].
//! `total_size` counts the header itself, so it doubles as the length prefix.
//! A bare `total_size` of zero is a keepalive, not a frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocol::{pack_name, unpack_name, MAX_NAME_LEN};
use crate::strpack::{PackError, StrPack};

/// Size of the length prefix at the start of every frame.
pub const LEN_SIZE: usize = 4;
/// Size of the fixed frame header (length prefix included).
pub const HEADER_SIZE: usize = 4 + 8 + 4 + MAX_NAME_LEN + MAX_NAME_LEN;
/// Default upper bound for `total_size`.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB
/// Keepalive written by liveness checks; receivers skip it.
pub const KEEPALIVE: [u8; LEN_SIZE] = [0; LEN_SIZE];

#[derive(Debug, Serialize, Deserialize)]
struct FrameHeader {
    total_size: u32,
    opcode: u64,
    arg_size: u32,
    dest: [u8; MAX_NAME_LEN],
    source: [u8; MAX_NAME_LEN],
}

/// One decoded instruction. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: u64,
    source: String,
    dest: String,
    payload: Bytes,
}

impl Frame {
    /// Build a frame, validating both process names and the size limit.
    pub fn new(
        opcode: u64,
        source: &str,
        dest: &str,
        payload: impl Into<Bytes>,
    ) -> Result<Self, FrameEncodeError> {
        let payload = payload.into();
        if pack_name(source).is_none() {
            return Err(FrameEncodeError::InvalidName(source.to_string()));
        }
        if pack_name(dest).is_none() {
            return Err(FrameEncodeError::InvalidName(dest.to_string()));
        }
        if HEADER_SIZE + payload.len() > MAX_FRAME_LEN as usize {
            return Err(FrameEncodeError::TooLarge);
        }
        Ok(Self {
            opcode,
            source: source.to_string(),
            dest: dest.to_string(),
            payload,
        })
    }

    pub fn opcode(&self) -> u64 {
        self.opcode
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dest(&self) -> &str {
        &self.dest
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload as a cheaply clonable buffer.
    pub fn payload_bytes(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn arg_size(&self) -> usize {
        self.payload.len()
    }

    pub fn header_size(&self) -> usize {
        HEADER_SIZE
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Payload read as text up to the first NUL (senders often include a C terminator).
    pub fn payload_str(&self) -> Option<&str> {
        let end = self
            .payload
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).ok()
    }

    /// Payload read as a string pack (see [`crate::strpack`]).
    pub fn payload_strings(&self) -> Result<StrPack<'_>, PackError> {
        StrPack::parse(&self.payload)
    }

    /// Append the encoded frame to `out`.
    pub fn encode_into(&self, out: &mut BytesMut) -> Result<(), FrameEncodeError> {
        let header = FrameHeader {
            total_size: self.total_size() as u32,
            opcode: self.opcode,
            arg_size: self.payload.len() as u32,
            dest: pack_name(&self.dest)
                .ok_or_else(|| FrameEncodeError::InvalidName(self.dest.clone()))?,
            source: pack_name(&self.source)
                .ok_or_else(|| FrameEncodeError::InvalidName(self.source.clone()))?,
        };
        let head = bincode::serialize(&header)?;
        debug_assert_eq!(head.len(), HEADER_SIZE);
        out.reserve(head.len() + self.payload.len());
        out.put_slice(&head);
        out.put_slice(&self.payload);
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let mut out = BytesMut::with_capacity(self.total_size());
        self.encode_into(&mut out)?;
        Ok(out.to_vec())
    }
}

/// Encode one instruction: fixed header + payload bytes.
pub fn encode_frame(
    opcode: u64,
    source: &str,
    dest: &str,
    payload: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    Frame::new(opcode, source, dest, Bytes::copy_from_slice(payload))?.encode()
}

/// Error encoding a frame (bad name, size limit or bincode).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("invalid process name: {0:?}")]
    InvalidName(String),
    #[error("frame too large")]
    TooLarge,
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
}

/// Read the `total_size` prefix.
pub fn frame_len(prefix: [u8; LEN_SIZE]) -> u32 {
    u32::from_le_bytes(prefix)
}

/// Decode one frame from the front of `bytes` with the default size limit.
/// Returns the frame and the number of bytes consumed. The payload shares `bytes`' storage.
pub fn decode_frame(bytes: &Bytes) -> Result<(Frame, usize), FrameDecodeError> {
    decode_frame_limited(bytes, MAX_FRAME_LEN)
}

/// Like [`decode_frame`] with an explicit upper bound for `total_size`.
pub fn decode_frame_limited(
    bytes: &Bytes,
    max_len: u32,
) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::Truncated {
            needed: LEN_SIZE,
            available: bytes.len(),
        });
    }
    let total = frame_len([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if total > max_len {
        return Err(FrameDecodeError::TooLarge(total));
    }
    let total = total as usize;
    if total < HEADER_SIZE {
        return Err(FrameDecodeError::Corrupt);
    }
    if bytes.len() < total {
        return Err(FrameDecodeError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let header: FrameHeader = bincode::deserialize(&bytes[..HEADER_SIZE])?;
    if header.total_size as usize != HEADER_SIZE + header.arg_size as usize {
        return Err(FrameDecodeError::Corrupt);
    }
    let dest = unpack_name(&header.dest).ok_or(FrameDecodeError::InvalidName)?;
    let source = unpack_name(&header.source).ok_or(FrameDecodeError::InvalidName)?;
    let frame = Frame {
        opcode: header.opcode,
        source,
        dest,
        payload: bytes.slice(HEADER_SIZE..total),
    };
    Ok((frame, total))
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("truncated frame: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("frame too large ({0} bytes)")]
    TooLarge(u32),
    #[error("corrupt frame header")]
    Corrupt,
    #[error("invalid process name in frame")]
    InvalidName,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
