//! WIMP local server: listens for peers, dials them, and moves instruction frames
//! between processes over TCP.

pub mod config;
pub mod handshake;
pub mod launch;
pub mod receiver;
pub mod server;
pub mod table;

pub use config::Config;
pub use launch::{sibling_executable, spawn_executable_process, ChildLaunch};
pub use receiver::ReceiverState;
pub use server::{
    assign_unused_local_port, FlushReport, LocalServer, SendError, ServerError, ServerState,
};
pub use table::TableError;
pub use wimp_core::{
    opcode_from_name, pack_strings, Frame, QueueGuard, Relation, StrPack, EXIT, LOG, PING,
};
