//! Bookkeeping for in-flight file transfers.
//!
//! The registry never forwards bytes; it tracks state transitions, chunk
//! accounting, and idle expiry. All per-entry mutation happens under one
//! mutex, so chunk counts, byte totals, and activity stamps stay consistent
//! with each other.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use uuid::Uuid;

use courier_proto::{CHUNK_SIZE, MAX_FILE_SIZE};

/// How long a transfer may sit without chunk or control traffic before the
/// sweep removes it.
pub const TRANSFER_IDLE_MAX: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// FILE_START has reached the hub; waiting on the recipient.
    Proposed,
    /// Recipient consented; payload may flow.
    Accepted,
    /// Recipient declined. Terminal.
    Rejected,
    /// At least one chunk observed.
    InFlight,
    /// Full chunk set plus FILE_END(success). Terminal.
    Completed,
    /// Failure, expiry, peer loss, or rejection. Terminal.
    Aborted,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Rejected | TransferState::Completed | TransferState::Aborted
        )
    }

    fn accepts_chunks(self) -> bool {
        matches!(self, TransferState::Accepted | TransferState::InFlight)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transfer {
    pub id: Uuid,
    pub file_name: String,
    pub size: u64,
    pub sender: String,
    pub target: String,
    pub state: TransferState,
    pub expected_chunks: u32,
    pub chunks_seen: u32,
    pub bytes_accounted: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("transfer {0} already registered")]
    Duplicate(Uuid),
    #[error("unknown transfer {0}")]
    Unknown(Uuid),
    #[error("file too large: {0} bytes")]
    TooLarge(u64),
    #[error("invalid file name: {0:?}")]
    BadFileName(String),
    #[error("transfer {0} is not awaiting consent")]
    NotProposed(Uuid),
    #[error("transfer {0} is not accepting chunks")]
    NotAccepting(Uuid),
    #[error("peer {0} is not the transfer recipient")]
    WrongPeer(String),
    #[error("chunk sequence {seq} out of range (expected < {expected})")]
    SeqOutOfRange { seq: u32, expected: u32 },
    #[error("duplicate chunk sequence {0}")]
    DuplicateSeq(u32),
}

/// Outcome of recording one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Recorded,
    /// The seen-sequence set now equals {0 .. expected-chunk-count}.
    Complete,
}

struct Entry {
    transfer: Transfer,
    seen: crate::seqset::SeqSet,
}

impl Entry {
    fn snapshot(&self) -> Transfer {
        let mut t = self.transfer.clone();
        t.chunks_seen = self.seen.seen();
        t
    }
}

/// Process-wide table of in-flight transfers, keyed by transfer id.
#[derive(Default)]
pub struct TransferRegistry {
    entries: Mutex<HashMap<Uuid, Entry>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly announced transfer in state `Proposed`. Rejects
    /// duplicate ids, oversized files, and file names that are not plain
    /// basenames.
    pub fn open(
        &self,
        id: Uuid,
        file_name: &str,
        size: u64,
        sender: &str,
        target: &str,
    ) -> Result<Transfer, RegistryError> {
        if size > MAX_FILE_SIZE {
            return Err(RegistryError::TooLarge(size));
        }
        if file_name.is_empty()
            || file_name.contains(['/', '\\'])
            || file_name == "."
            || file_name == ".."
        {
            return Err(RegistryError::BadFileName(file_name.to_owned()));
        }

        let expected_chunks = size.div_ceil(CHUNK_SIZE as u64) as u32;
        let now = Instant::now();
        let transfer = Transfer {
            id,
            file_name: file_name.to_owned(),
            size,
            sender: sender.to_owned(),
            target: target.to_owned(),
            state: TransferState::Proposed,
            expected_chunks,
            chunks_seen: 0,
            bytes_accounted: 0,
            created_at: now,
            last_activity: now,
        };

        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        let entry = Entry {
            transfer: transfer.clone(),
            seen: crate::seqset::SeqSet::new(expected_chunks),
        };
        entries.insert(id, entry);
        Ok(transfer)
    }

    /// Proposed → Accepted. Only the transfer's recipient may consent.
    pub fn accept(&self, id: Uuid, claimant: &str) -> Result<Transfer, RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        if entry.transfer.target != claimant {
            return Err(RegistryError::WrongPeer(claimant.to_owned()));
        }
        if entry.transfer.state != TransferState::Proposed {
            return Err(RegistryError::NotProposed(id));
        }
        entry.transfer.state = TransferState::Accepted;
        entry.transfer.last_activity = Instant::now();
        Ok(entry.snapshot())
    }

    /// Proposed → Aborted; the entry is removed immediately. The returned
    /// snapshot lets the hub notify the original sender.
    pub fn reject(&self, id: Uuid, claimant: &str) -> Result<Transfer, RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        if entry.transfer.target != claimant {
            return Err(RegistryError::WrongPeer(claimant.to_owned()));
        }
        if entry.transfer.state != TransferState::Proposed {
            return Err(RegistryError::NotProposed(id));
        }
        let mut entry = entries.remove(&id).unwrap();
        entry.transfer.state = TransferState::Rejected;
        Ok(entry.snapshot())
    }

    /// Records one chunk. Out-of-range and duplicate sequences are errors
    /// but never mutate state; the registry refuses to double-count.
    pub fn observe_chunk(
        &self,
        id: Uuid,
        seq: u32,
        len: usize,
    ) -> Result<ChunkOutcome, RegistryError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(&id).ok_or(RegistryError::Unknown(id))?;
        if !entry.transfer.state.accepts_chunks() {
            return Err(RegistryError::NotAccepting(id));
        }
        if !entry.seen.in_range(seq) {
            return Err(RegistryError::SeqOutOfRange {
                seq,
                expected: entry.seen.expected(),
            });
        }
        if !entry.seen.insert(seq) {
            return Err(RegistryError::DuplicateSeq(seq));
        }

        entry.transfer.state = TransferState::InFlight;
        entry.transfer.bytes_accounted += len as u64;
        entry.transfer.last_activity = Instant::now();

        if entry.seen.is_complete() {
            Ok(ChunkOutcome::Complete)
        } else {
            Ok(ChunkOutcome::Recorded)
        }
    }

    /// Terminal transition; the entry is removed. Returns the final
    /// snapshot, or `None` if the id was never registered (already closed,
    /// expired, or bogus).
    pub fn close(&self, id: Uuid, success: bool) -> Option<Transfer> {
        let mut entries = self.entries.lock().unwrap();
        let mut entry = entries.remove(&id)?;
        entry.transfer.state = if success && entry.seen.is_complete() {
            TransferState::Completed
        } else {
            TransferState::Aborted
        };
        Some(entry.snapshot())
    }

    /// Removes every entry idle for longer than `max_idle`, returning the
    /// snapshots so the hub can notify both sides.
    pub fn sweep(&self, now: Instant, max_idle: Duration) -> Vec<Transfer> {
        let mut entries = self.entries.lock().unwrap();
        let expired: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.transfer.last_activity) > max_idle)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|mut e| {
                e.transfer.state = TransferState::Aborted;
                e.snapshot()
            })
            .collect()
    }

    /// Removes every transfer in which `peer_id` is sender or target, so a
    /// disconnect can abort them and notify the surviving side.
    pub fn remove_involving(&self, peer_id: &str) -> Vec<Transfer> {
        let mut entries = self.entries.lock().unwrap();
        let involved: Vec<Uuid> = entries
            .iter()
            .filter(|(_, e)| e.transfer.sender == peer_id || e.transfer.target == peer_id)
            .map(|(id, _)| *id)
            .collect();
        involved
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .map(|mut e| {
                e.transfer.state = TransferState::Aborted;
                e.snapshot()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Uuid) -> Option<Transfer> {
        self.entries.lock().unwrap().get(&id).map(Entry::snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn open_default(reg: &TransferRegistry, id: Uuid) -> Transfer {
        reg.open(id, "x.bin", 20000, "aaaaaaaa", "bbbbbbbb").unwrap()
    }

    #[test]
    fn open_computes_expected_chunks() {
        let reg = TransferRegistry::new();
        let t = open_default(&reg, tid(1));
        assert_eq!(t.state, TransferState::Proposed);
        assert_eq!(t.expected_chunks, 3); // ceil(20000 / 8192)

        let exact = reg
            .open(tid(2), "y.bin", 8192 * 4, "aaaaaaaa", "bbbbbbbb")
            .unwrap();
        assert_eq!(exact.expected_chunks, 4);

        let empty = reg.open(tid(3), "z.bin", 0, "aaaaaaaa", "bbbbbbbb").unwrap();
        assert_eq!(empty.expected_chunks, 0);
    }

    #[test]
    fn open_rejects_duplicates_and_bad_input() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));
        assert_eq!(
            reg.open(tid(1), "x.bin", 1, "aaaaaaaa", "bbbbbbbb"),
            Err(RegistryError::Duplicate(tid(1)))
        );
        assert!(matches!(
            reg.open(tid(2), "../etc/passwd", 1, "a", "b"),
            Err(RegistryError::BadFileName(_))
        ));
        assert!(matches!(
            reg.open(tid(3), "dir/x.bin", 1, "a", "b"),
            Err(RegistryError::BadFileName(_))
        ));
        assert!(matches!(
            reg.open(tid(4), "x.bin", MAX_FILE_SIZE + 1, "a", "b"),
            Err(RegistryError::TooLarge(_))
        ));
    }

    #[test]
    fn consent_gates_chunks() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));

        // No chunks before acceptance.
        assert_eq!(
            reg.observe_chunk(tid(1), 0, 8192),
            Err(RegistryError::NotAccepting(tid(1)))
        );

        // Only the recipient may accept.
        assert_eq!(
            reg.accept(tid(1), "aaaaaaaa"),
            Err(RegistryError::WrongPeer("aaaaaaaa".into()))
        );
        let t = reg.accept(tid(1), "bbbbbbbb").unwrap();
        assert_eq!(t.state, TransferState::Accepted);

        // Accepting twice fails.
        assert_eq!(
            reg.accept(tid(1), "bbbbbbbb"),
            Err(RegistryError::NotProposed(tid(1)))
        );
    }

    #[test]
    fn chunk_accounting_to_completion() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));
        reg.accept(tid(1), "bbbbbbbb").unwrap();

        assert_eq!(reg.observe_chunk(tid(1), 0, 8192), Ok(ChunkOutcome::Recorded));
        assert_eq!(reg.observe_chunk(tid(1), 1, 8192), Ok(ChunkOutcome::Recorded));
        assert_eq!(
            reg.observe_chunk(tid(1), 1, 8192),
            Err(RegistryError::DuplicateSeq(1))
        );
        assert_eq!(
            reg.observe_chunk(tid(1), 3, 3616),
            Err(RegistryError::SeqOutOfRange {
                seq: 3,
                expected: 3
            })
        );
        assert_eq!(reg.observe_chunk(tid(1), 2, 3616), Ok(ChunkOutcome::Complete));

        let t = reg.get(tid(1)).unwrap();
        assert_eq!(t.state, TransferState::InFlight);
        assert_eq!(t.bytes_accounted, 20000);
        assert_eq!(t.chunks_seen, 3);

        let closed = reg.close(tid(1), true).unwrap();
        assert_eq!(closed.state, TransferState::Completed);
        assert!(reg.is_empty());

        // Terminal: nothing works on the id afterwards.
        assert_eq!(
            reg.observe_chunk(tid(1), 0, 1),
            Err(RegistryError::Unknown(tid(1)))
        );
        assert!(reg.close(tid(1), true).is_none());
    }

    #[test]
    fn close_without_full_chunk_set_aborts() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));
        reg.accept(tid(1), "bbbbbbbb").unwrap();
        reg.observe_chunk(tid(1), 0, 8192).unwrap();

        let closed = reg.close(tid(1), true).unwrap();
        assert_eq!(closed.state, TransferState::Aborted);
    }

    #[test]
    fn reject_removes_entry() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));
        let t = reg.reject(tid(1), "bbbbbbbb").unwrap();
        assert_eq!(t.state, TransferState::Rejected);
        assert!(reg.is_empty());
        assert_eq!(
            reg.reject(tid(1), "bbbbbbbb"),
            Err(RegistryError::Unknown(tid(1)))
        );
    }

    #[test]
    fn sweep_expires_idle_transfers() {
        let reg = TransferRegistry::new();
        open_default(&reg, tid(1));
        reg.accept(tid(1), "bbbbbbbb").unwrap();

        // Nothing expires at the idle boundary.
        let removed = reg.sweep(Instant::now(), TRANSFER_IDLE_MAX);
        assert!(removed.is_empty());

        // Pretend six minutes pass with no activity.
        let later = Instant::now() + Duration::from_secs(6 * 60);
        let removed = reg.sweep(later, TRANSFER_IDLE_MAX);
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].state, TransferState::Aborted);
        assert!(reg.is_empty());
    }

    #[test]
    fn remove_involving_catches_both_roles() {
        let reg = TransferRegistry::new();
        reg.open(tid(1), "a.bin", 1, "aaaaaaaa", "bbbbbbbb").unwrap();
        reg.open(tid(2), "b.bin", 1, "cccccccc", "aaaaaaaa").unwrap();
        reg.open(tid(3), "c.bin", 1, "cccccccc", "bbbbbbbb").unwrap();

        let removed = reg.remove_involving("aaaaaaaa");
        assert_eq!(removed.len(), 2);
        assert!(removed.iter().all(|t| t.state == TransferState::Aborted));
        assert_eq!(reg.len(), 1);
        assert!(reg.get(tid(3)).is_some());
    }
}
