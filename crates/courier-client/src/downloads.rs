//! Receiver side of a transfer: the offer queue and the active-download
//! assembler that writes chunks to disk in sequence order.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

/// How long an unanswered offer is kept before it is swept.
pub const OFFER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// A file someone offered us, addressed by a short local ordinal.
#[derive(Debug, Clone)]
pub struct DownloadOffer {
    pub ordinal: u32,
    pub transfer_id: Uuid,
    pub sender: String,
    pub file_name: String,
    pub size: u64,
}

struct PendingDownload {
    offer: DownloadOffer,
    arrived_at: Instant,
}

struct ActiveDownload {
    offer: DownloadOffer,
    path: PathBuf,
    file: fs::File,
    next_seq: u32,
    bytes: u64,
}

/// What remains of an active download after FILE_END or abort.
pub(crate) struct FinishedDownload {
    pub offer: DownloadOffer,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Per-transfer progress, for the UI's list surface.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub bytes: u64,
    pub size: u64,
}

/// Receiver-side transfer table. Offers are never auto-accepted; an entry
/// moves to `active` only after the user consents and the destination file
/// is open.
#[derive(Default)]
pub(crate) struct Downloads {
    next_ordinal: u32,
    pending: HashMap<u32, PendingDownload>,
    active: HashMap<Uuid, ActiveDownload>,
}

impl Downloads {
    /// Queues an inbound FILE_START and returns its offer.
    pub fn queue(&mut self, transfer_id: Uuid, sender: String, file_name: String, size: u64) -> DownloadOffer {
        self.next_ordinal += 1;
        let offer = DownloadOffer {
            ordinal: self.next_ordinal,
            transfer_id,
            sender,
            file_name,
            size,
        };
        self.pending.insert(
            offer.ordinal,
            PendingDownload {
                offer: offer.clone(),
                arrived_at: Instant::now(),
            },
        );
        offer
    }

    pub fn take_pending(&mut self, ordinal: u32) -> Option<DownloadOffer> {
        self.pending.remove(&ordinal).map(|p| p.offer)
    }

    /// Drops an unanswered offer by its transfer id, e.g. when the hub
    /// reports the transfer gone before the user ever responded.
    pub fn drop_pending_by_transfer(&mut self, transfer_id: Uuid) -> Option<DownloadOffer> {
        let ordinal = self
            .pending
            .values()
            .find(|p| p.offer.transfer_id == transfer_id)
            .map(|p| p.offer.ordinal)?;
        self.take_pending(ordinal)
    }

    pub fn pending_offers(&self) -> Vec<DownloadOffer> {
        let mut offers: Vec<_> = self.pending.values().map(|p| p.offer.clone()).collect();
        offers.sort_by_key(|o| o.ordinal);
        offers
    }

    pub fn progress(&self) -> Vec<DownloadProgress> {
        self.active
            .values()
            .map(|a| DownloadProgress {
                transfer_id: a.offer.transfer_id,
                file_name: a.offer.file_name.clone(),
                bytes: a.bytes,
                size: a.offer.size,
            })
            .collect()
    }

    /// Opens the destination and starts tracking the transfer.
    pub async fn activate(&mut self, offer: DownloadOffer, path: PathBuf) -> io::Result<()> {
        let file = fs::File::create(&path).await?;
        self.active.insert(
            offer.transfer_id,
            ActiveDownload {
                offer,
                path,
                file,
                next_seq: 0,
                bytes: 0,
            },
        );
        Ok(())
    }

    /// Writes one chunk if it is the expected-next sequence. Unexpected
    /// sequences are logged and dropped, not fatal.
    pub async fn write_chunk(&mut self, transfer_id: Uuid, seq: u32, data: &[u8]) -> io::Result<()> {
        let Some(active) = self.active.get_mut(&transfer_id) else {
            warn!("chunk for unknown transfer {transfer_id}, ignoring");
            return Ok(());
        };
        if seq != active.next_seq {
            warn!(
                "transfer {transfer_id}: unexpected sequence {seq} (wanted {})",
                active.next_seq
            );
            return Ok(());
        }
        active.file.write_all(data).await?;
        active.next_seq += 1;
        active.bytes += data.len() as u64;
        Ok(())
    }

    /// Ends an active transfer. On success the file is flushed in place; on
    /// failure the partial file is deleted.
    pub async fn finish(&mut self, transfer_id: Uuid, success: bool) -> Option<FinishedDownload> {
        let ActiveDownload {
            offer,
            path,
            mut file,
            bytes,
            ..
        } = self.active.remove(&transfer_id)?;
        if success {
            if let Err(e) = file.flush().await {
                warn!("flush of {} failed: {e}", path.display());
            }
        } else {
            drop(file);
            if let Err(e) = fs::remove_file(&path).await {
                warn!("could not delete partial {}: {e}", path.display());
            }
        }
        Some(FinishedDownload { offer, path, bytes })
    }

    /// Drops offers older than [`OFFER_TIMEOUT`], returning them so the
    /// caller can surface the expiry.
    pub fn sweep(&mut self, now: Instant) -> Vec<DownloadOffer> {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.arrived_at) > OFFER_TIMEOUT)
            .map(|(ord, _)| *ord)
            .collect();
        expired
            .into_iter()
            .filter_map(|ord| self.pending.remove(&ord))
            .map(|p| p.offer)
            .collect()
    }

    /// Aborts every active download (link lost); partial files are deleted.
    pub async fn abort_all(&mut self) -> Vec<DownloadOffer> {
        let ids: Vec<Uuid> = self.active.keys().copied().collect();
        let mut aborted = Vec::new();
        for id in ids {
            if let Some(finished) = self.finish(id, false).await {
                aborted.push(finished.offer);
            }
        }
        aborted
    }
}
