//! Wire protocol shared by the courier hub and its peers.
//!
//! Every frame on the wire is `u32_le length || payload`, where the payload
//! is one encoded [`Message`]. The codec lives in [`wire`], the closed set of
//! message kinds in [`message`].

pub mod message;
pub mod wire;

pub use message::{Message, SERVER_SENDER, is_server_sender};
pub use wire::{CHUNK_SIZE, FrameError, MAX_FILE_SIZE, MAX_FRAME_LEN, decode, encode};
