//! WIMP core: instruction framing, string packs, protocol constants and the incoming queue.
//! No I/O; the server crate owns sockets and tasks.

pub mod protocol;
pub mod queue;
pub mod strpack;
pub mod wire;

pub use protocol::{
    opcode_from_name, Relation, EXIT, HANDSHAKE_SIZE, LOG, MAX_NAME_LEN, PING, PROTOCOL_VERSION,
};
pub use queue::{IncomingQueue, QueueFull, QueueGuard};
pub use strpack::{pack_strings, PackError, StrPack};
pub use wire::{
    decode_frame, decode_frame_limited, encode_frame, Frame, FrameDecodeError, FrameEncodeError,
    HEADER_SIZE, MAX_FRAME_LEN,
};
