//! Peer-side core for the courier hub: chat, consent-gated file send, and
//! inbound transfer assembly. The interactive `courier` binary is a thin
//! renderer over this crate's event stream.

mod client;
mod downloads;
mod events;
mod storage;
mod uploads;

pub use client::{AllowAll, Client, ClientConfig, ClientError, UploadPolicy};
pub use downloads::{DownloadOffer, DownloadProgress};
pub use events::ClientEvent;
pub use storage::sanitize_file_name;
