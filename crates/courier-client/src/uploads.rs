//! Sender side of a transfer: the pending-upload table and the chunk
//! streaming driver that runs once the hub confirms consent.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_net::Connection;
use courier_proto::{CHUNK_SIZE, Message};

use crate::ClientError;

/// How long a FILE_START may wait for UPLOAD_CONFIRMED before the upload is
/// dropped locally.
pub const UPLOAD_CONFIRM_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// An announced upload the hub has not yet confirmed. Payload stays on disk
/// until consent arrives.
pub struct PendingUpload {
    pub path: PathBuf,
    pub file_name: String,
    pub target: String,
    pub size: u64,
    pub created_at: Instant,
}

impl PendingUpload {
    pub fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > UPLOAD_CONFIRM_TIMEOUT
    }
}

/// Streams the file as consecutive CHUNK_SIZE chunks (sequences from 0),
/// then FILE_END(success). A zero-byte file produces no chunks at all.
///
/// Cancellation means the hub or recipient already ended the transfer;
/// the driver just stops quietly.
pub(crate) async fn stream_chunks(
    conn: &Connection,
    own_id: &str,
    target: &str,
    transfer_id: Uuid,
    path: &PathBuf,
    size: u64,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = size;
    let mut seq: u32 = 0;

    while remaining > 0 {
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        let take = remaining.min(CHUNK_SIZE as u64) as usize;
        file.read_exact(&mut buf[..take]).await?;
        conn.send(&Message::FileData {
            sender: own_id.to_owned(),
            target: target.to_owned(),
            transfer_id: transfer_id.to_string(),
            seq,
            data: Bytes::copy_from_slice(&buf[..take]),
        })
        .await?;
        seq += 1;
        remaining -= take as u64;
    }

    conn.send(&Message::FileEnd {
        sender: own_id.to_owned(),
        target: target.to_owned(),
        transfer_id: transfer_id.to_string(),
        success: true,
        error: String::new(),
    })
    .await?;
    Ok(())
}
