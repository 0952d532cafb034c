//! String packs: several strings carried in one instruction payload.
//!
//! Layout: pack_size u64 | count u64 (bincode, fixed-int LE) then `count` NUL-terminated
//! UTF-8 strings. `pack_size` covers the whole pack, header included.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the pack header.
pub const PACK_HEADER_SIZE: usize = 16;

#[derive(Debug, Serialize, Deserialize)]
struct PackHeader {
    pack_size: u64,
    count: u64,
}

/// Error building or reading a string pack.
#[derive(Debug, thiserror::Error)]
pub enum PackError {
    #[error("string {0} contains a NUL byte")]
    InteriorNul(usize),
    #[error("truncated pack: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("pack holds {found} strings, header says {expected}")]
    CountMismatch { expected: u64, found: usize },
    #[error("pack string is not UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("pack header: {0}")]
    Header(#[from] bincode::Error),
}

/// Pack `strings` into one payload, ready for `Frame::new` or `enqueue_outgoing`.
pub fn pack_strings<I, S>(strings: I) -> Result<Bytes, PackError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut body = BytesMut::new();
    let mut count = 0u64;
    for (i, s) in strings.into_iter().enumerate() {
        let s = s.as_ref();
        if s.as_bytes().contains(&0) {
            return Err(PackError::InteriorNul(i));
        }
        body.put_slice(s.as_bytes());
        body.put_u8(0);
        count += 1;
    }
    let header = PackHeader {
        pack_size: (PACK_HEADER_SIZE + body.len()) as u64,
        count,
    };
    let mut out = BytesMut::with_capacity(PACK_HEADER_SIZE + body.len());
    out.put_slice(&bincode::serialize(&header)?);
    out.put_slice(&body);
    Ok(out.freeze())
}

/// Borrowed view over a received pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrPack<'a> {
    strings: Vec<&'a str>,
}

impl<'a> StrPack<'a> {
    /// Validate `payload` and index its strings. Bytes past `pack_size` are ignored.
    pub fn parse(payload: &'a [u8]) -> Result<Self, PackError> {
        if payload.len() < PACK_HEADER_SIZE {
            return Err(PackError::Truncated {
                needed: PACK_HEADER_SIZE,
                available: payload.len(),
            });
        }
        let header: PackHeader = bincode::deserialize(&payload[..PACK_HEADER_SIZE])?;
        let size = usize::try_from(header.pack_size).unwrap_or(usize::MAX);
        if size < PACK_HEADER_SIZE || size > payload.len() {
            return Err(PackError::Truncated {
                needed: size.max(PACK_HEADER_SIZE),
                available: payload.len(),
            });
        }
        let mut body = &payload[PACK_HEADER_SIZE..size];
        let mut strings = Vec::new();
        while let Some(end) = body.iter().position(|&b| b == 0) {
            strings.push(std::str::from_utf8(&body[..end])?);
            body = &body[end + 1..];
        }
        if !body.is_empty() || strings.len() as u64 != header.count {
            return Err(PackError::CountMismatch {
                expected: header.count,
                found: strings.len(),
            });
        }
        Ok(Self { strings })
    }

    /// String at `index`, or None past the end.
    pub fn get(&self, index: usize) -> Option<&'a str> {
        self.strings.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a str> + '_ {
        self.strings.iter().copied()
    }
}
