use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, Command, InstallSnapshotArgs, InstallSnapshotReply,
    RequestVoteArgs, RequestVoteReply,
};
use crate::replica::ReplicaID;

/// Transport is the interface a Replica uses to talk to the rest of the
/// cluster, be it over the network or pigeon post.
///
/// The network underneath may drop, delay, reorder, or duplicate any
/// message. Each call sends one request and waits a bounded time for the
/// matching reply; `None` means the exchange did not complete. A `None` is
/// informational only: the replica never retries eagerly, the next heartbeat
/// or election round covers it.
///
/// Calls are made from short-lived sender tasks, never while the replica's
/// state lock is held, so an implementation is free to block for its full
/// internal timeout.
///
/// The inbound half of the contract is the `request_vote`,
/// `append_entries`, and `install_snapshot` handlers on
/// [`Replica`](crate::replica::Replica), which a transport server dispatches
/// into.
pub trait Transport<C>: Send + Sync + 'static
where
    C: Command,
{
    fn request_vote(&self, peer: ReplicaID, args: &RequestVoteArgs) -> Option<RequestVoteReply>;

    fn append_entries(
        &self,
        peer: ReplicaID,
        args: &AppendEntriesArgs<C>,
    ) -> Option<AppendEntriesReply>;

    fn install_snapshot(
        &self,
        peer: ReplicaID,
        args: &InstallSnapshotArgs,
    ) -> Option<InstallSnapshotReply>;
}
