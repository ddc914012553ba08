use crate::persist::Snapshot;
use crate::replica::ReplicaID;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Command is the opaque unit of agreement. The replica never inspects a
/// command; it orders it, makes it durable, and hands it back through the
/// apply stream once committed.
///
/// The trait is blanket-implemented, so any serializable owned type
/// qualifies. Default supplies the payload of the sentinel entry at the
/// snapshot boundary; it is never delivered.
pub trait Command:
    Clone + Debug + Default + Send + Serialize + DeserializeOwned + 'static
{
}

impl<C> Command for C where
    C: Clone + Debug + Default + Send + Serialize + DeserializeOwned + 'static
{
}

// LogEntry is one durable record of the replicated log. Indices are globally
// consistent across replicas; the term records when the then-leader created
// the entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct LogEntry<C>
where
    C: Command,
{
    pub index: usize,
    pub term: usize,
    pub command: C,
}

/// RequestVote is sent by candidates to solicit votes for themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    pub term: usize,
    pub candidate_id: ReplicaID,
    pub last_log_index: usize,
    pub last_log_term: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: usize,
    pub vote_granted: bool,
}

/// AppendEntries is sent by leaders to replicate log entries and, with an
/// empty entries vector, as the heartbeat that suppresses elections.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct AppendEntriesArgs<C>
where
    C: Command,
{
    pub term: usize,
    pub leader: ReplicaID,
    pub prev_log_index: usize,
    pub prev_log_term: usize,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: usize,
}

// On rejection next_index carries the accelerated backtracking hint: the
// first index of the conflicting term, or one past the follower's last log
// index when the follower's log is short.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: usize,
    pub success: bool,
    pub next_index: usize,
}

/// InstallSnapshot replaces a lagging follower's log prefix wholesale when
/// the entries it needs have already been compacted away on the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    pub term: usize,
    pub leader: ReplicaID,
    pub last_included_index: usize,
    pub last_included_term: usize,
    pub data: Bytes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotReply {
    pub term: usize,
}

/// ApplyMsg is what the replica emits on the apply stream. Commands arrive
/// in strict index order with no gaps and no duplicates; a snapshot delivery
/// replaces every index at or below its `last_included_index` and the stream
/// continues from there.
#[derive(Clone, Debug)]
pub enum ApplyMsg<C>
where
    C: Command,
{
    Command { index: usize, command: C },
    Snapshot(Snapshot),
}
