use crate::message::{Command, LogEntry};
use crate::replica::ReplicaID;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

/// Errors surfaced by the durability layer. A codec error on restore means
/// the stored state is unusable; a storage error at runtime is fatal to the
/// replica, which must stop serving rather than break its durability
/// guarantees.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt persisted state: {0}")]
    Codec(#[from] bincode::Error),
}

/// Persister is the stable-storage interface: two opaque byte-blob slots,
/// one for raft state and one for the application snapshot. Writes are
/// atomic and durable on return; no partial write is ever observable, which
/// is what lets the replica persist-then-reply without further ceremony.
pub trait Persister: Send + Sync {
    fn save_raft_state(&self, state: Bytes) -> Result<(), PersistError>;

    fn read_raft_state(&self) -> Result<Bytes, PersistError>;

    fn save_snapshot(&self, snapshot: Bytes) -> Result<(), PersistError>;

    fn read_snapshot(&self) -> Result<Bytes, PersistError>;

    /// Commit both slots in one atomic write. Snapshot installation and log
    /// compaction must not be observable with one slot updated and the other
    /// stale.
    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes) -> Result<(), PersistError>;
}

/// In-memory Persister. Survives a replica restart within one process,
/// which is all the test harness needs to model crash and recovery.
#[derive(Default)]
pub struct MemPersister {
    slots: Mutex<Slots>,
}

#[derive(Default)]
struct Slots {
    raft_state: Bytes,
    snapshot: Bytes,
}

impl MemPersister {
    pub fn new() -> MemPersister {
        MemPersister::default()
    }
}

impl Persister for MemPersister {
    fn save_raft_state(&self, state: Bytes) -> Result<(), PersistError> {
        self.slots.lock().unwrap().raft_state = state;
        Ok(())
    }

    fn read_raft_state(&self) -> Result<Bytes, PersistError> {
        Ok(self.slots.lock().unwrap().raft_state.clone())
    }

    fn save_snapshot(&self, snapshot: Bytes) -> Result<(), PersistError> {
        self.slots.lock().unwrap().snapshot = snapshot;
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Bytes, PersistError> {
        Ok(self.slots.lock().unwrap().snapshot.clone())
    }

    fn save_state_and_snapshot(&self, state: Bytes, snapshot: Bytes) -> Result<(), PersistError> {
        let mut slots = self.slots.lock().unwrap();
        slots.raft_state = state;
        slots.snapshot = snapshot;
        Ok(())
    }
}

// HardState is everything that must survive a crash: the current term, who
// this replica voted for in it, and the log including the sentinel entry at
// the snapshot boundary.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub(crate) struct HardState<C>
where
    C: Command,
{
    pub current_term: usize,
    pub voted_for: Option<ReplicaID>,
    pub log: Vec<LogEntry<C>>,
}

pub(crate) fn encode_state<C: Command>(state: &HardState<C>) -> Result<Bytes, PersistError> {
    Ok(Bytes::from(bincode::serialize(state)?))
}

pub(crate) fn decode_state<C: Command>(data: &[u8]) -> Result<HardState<C>, PersistError> {
    Ok(bincode::deserialize(data)?)
}

/// Snapshot captures the application's state through `last_included_index`,
/// replacing that prefix of the log. The data bytes are opaque to the
/// replica; only the index and term metadata participate in the protocol.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub last_included_index: usize,
    pub last_included_term: usize,
    pub data: Bytes,
}

pub(crate) fn encode_snapshot(snapshot: &Snapshot) -> Result<Bytes, PersistError> {
    Ok(Bytes::from(bincode::serialize(snapshot)?))
}

pub(crate) fn decode_snapshot(data: &[u8]) -> Result<Snapshot, PersistError> {
    Ok(bincode::deserialize(data)?)
}
