use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, ApplyMsg, Command, InstallSnapshotArgs,
    InstallSnapshotReply, LogEntry, RequestVoteArgs, RequestVoteReply,
};
use crate::persist::{
    decode_snapshot, decode_state, encode_snapshot, encode_state, HardState, PersistError,
    Persister, Snapshot,
};
use crate::timer::Timer;
use crate::transport::Transport;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Select, Sender};
use rand::Rng;
use std::cmp;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// ReplicaID is a type alias used to identify Raft nodes.
pub type ReplicaID = usize;

/// Default interval between leader heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// Default lower bound of the randomized election timeout. Keep the bound
/// at least an order of magnitude above the heartbeat interval, or healthy
/// clusters will re-elect under transient load.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(500);

/// Default upper bound (exclusive) of the randomized election timeout.
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(603);

#[derive(Clone, Copy, PartialEq, Debug)]
enum Role {
    Follower,
    Candidate,
    Leader,
}

// Everything mutable about the replica lives here, behind the one state
// lock. Driver loops and sender tasks only ever read snapshots of it;
// transitions happen inside the RPC handlers and reply folds.
struct RaftState<C>
where
    C: Command,
{
    // Durable fields. current_term never decreases; voted_for resets on
    // every term advance; log[0] is the sentinel at the snapshot boundary.
    current_term: usize,
    voted_for: Option<ReplicaID>,
    log: Vec<LogEntry<C>>,

    // Volatile fields.
    role: Role,
    commit_index: usize,
    last_applied: usize,

    // Leader bookkeeping, reinitialized on every election win.
    next_index: BTreeMap<ReplicaID, usize>,
    match_index: BTreeMap<ReplicaID, usize>,

    // Candidate bookkeeping: IDs of peers with votes for self.
    current_votes: BTreeSet<ReplicaID>,

    // Snapshot waiting to be handed to the service by the apply pump.
    pending_snapshot: Option<Snapshot>,
}

impl<C> RaftState<C>
where
    C: Command,
{
    fn base(&self) -> usize {
        self.log[0].index
    }

    fn last_index(&self) -> usize {
        self.log[self.log.len() - 1].index
    }

    fn last_term(&self) -> usize {
        self.log[self.log.len() - 1].term
    }

    fn slot(&self, index: usize) -> usize {
        index - self.base()
    }

    fn term_at(&self, index: usize) -> usize {
        self.log[self.slot(index)].term
    }
}

// Payload-free wakeups. Senders never pass state through these; receivers
// reread everything under the lock. bounded(1) with try_send collapses a
// burst into a single pending token.
struct Signals {
    // A valid heartbeat arrived, a vote was granted, or a leader/candidate
    // was demoted and its loop must notice.
    reset_tx: Sender<()>,
    reset_rx: Receiver<()>,
    // A candidacy reached majority.
    won_tx: Sender<()>,
    won_rx: Receiver<()>,
    // The leader appended a fresh entry; replicate without waiting for the
    // next heartbeat tick.
    submit_tx: Sender<()>,
    submit_rx: Receiver<()>,
    // commit_index moved; wake the apply pump.
    commit_tx: Sender<()>,
    commit_rx: Receiver<()>,
}

impl Signals {
    fn new() -> Signals {
        let (reset_tx, reset_rx) = bounded(1);
        let (won_tx, won_rx) = bounded(1);
        let (submit_tx, submit_rx) = bounded(1);
        let (commit_tx, commit_rx) = bounded(1);
        Signals {
            reset_tx,
            reset_rx,
            won_tx,
            won_rx,
            submit_tx,
            submit_rx,
            commit_tx,
            commit_rx,
        }
    }
}

enum Outbound<C>
where
    C: Command,
{
    Append(AppendEntriesArgs<C>),
    Snapshot(InstallSnapshotArgs),
}

struct Inner<C, T>
where
    C: Command,
    T: Transport<C>,
{
    me: ReplicaID,
    peer_ids: Vec<ReplicaID>,
    cluster_size: usize,
    transport: T,
    persister: Arc<dyn Persister>,
    apply_tx: Sender<ApplyMsg<C>>,
    state: Mutex<RaftState<C>>,
    signals: Signals,
    dead: AtomicBool,
    heartbeat_timeout: Duration,
    election_timeout: (Duration, Duration),
}

/// Replica is the local instance running the Raft algorithm. Its goal is to
/// maintain durable, ordered agreement on a sequence of opaque commands
/// across the cluster. It talks to its peers through the user-supplied
/// [`Transport`], keeps its hard state in the user-supplied [`Persister`],
/// and delivers committed commands to the service on the apply channel.
///
/// The handle is cheap to clone; every clone drives the same replica.
pub struct Replica<C, T>
where
    C: Command,
    T: Transport<C>,
{
    inner: Arc<Inner<C, T>>,
}

impl<C, T> Clone for Replica<C, T>
where
    C: Command,
    T: Transport<C>,
{
    fn clone(&self) -> Replica<C, T> {
        Replica {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C, T> Replica<C, T>
where
    C: Command,
    T: Transport<C>,
{
    /// Create a Replica and start its background tasks.
    ///
    /// id is the ID of this Replica within the cluster and peer_ids are the
    /// IDs of all other Replicas; together they form a fixed, odd-sized
    /// peer group.
    ///
    /// Previously persisted state is restored from the persister before
    /// anything else runs; a decode failure is returned rather than served
    /// around. If a snapshot is present, one snapshot delivery is queued on
    /// the apply channel ahead of any command.
    ///
    /// heartbeat_timeout is how often a leader broadcasts AppendEntries;
    /// election_timeout_range is the half-open interval the randomized
    /// election timeout is drawn from. See [`HEARTBEAT_INTERVAL`],
    /// [`ELECTION_TIMEOUT_MIN`], and [`ELECTION_TIMEOUT_MAX`] for defaults
    /// that fit a LAN-ish round trip.
    pub fn start(
        id: ReplicaID,
        peer_ids: Vec<ReplicaID>,
        transport: T,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg<C>>,
        heartbeat_timeout: Duration,
        election_timeout_range: (Duration, Duration),
    ) -> Result<Replica<C, T>, PersistError> {
        let inner = Arc::new(Inner::restore(
            id,
            peer_ids,
            transport,
            persister,
            apply_tx,
            heartbeat_timeout,
            election_timeout_range,
        )?);

        let driver = Arc::clone(&inner);
        thread::spawn(move || driver.run());
        let pump = Arc::clone(&inner);
        thread::spawn(move || pump.run_apply());

        Ok(Replica { inner })
    }

    /// Start agreement on a command. Returns the log index the command will
    /// occupy if it commits and the current term, or `None` if this replica
    /// is not the leader. Commitment is not guaranteed; the leader may fail
    /// or lose an election before the entry reaches a majority.
    pub fn submit(&self, command: C) -> Option<(usize, usize)> {
        self.inner.submit(command)
    }

    /// Current term and whether this replica believes it is the leader.
    pub fn get_state(&self) -> (usize, bool) {
        self.inner.get_state()
    }

    /// Fold everything through `last_included_index` into the given
    /// application snapshot and discard that log prefix. Ignored unless
    /// `base < last_included_index <= last_applied`.
    pub fn compact(&self, last_included_index: usize, data: Bytes) {
        self.inner.compact(last_included_index, data)
    }

    /// Request termination. Background tasks observe the flag and stop
    /// within one bounded wait.
    pub fn kill(&self) {
        self.inner.kill()
    }

    /// Inbound RequestVote handler, to be dispatched by the transport
    /// server.
    pub fn request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        self.inner.handle_request_vote(args)
    }

    /// Inbound AppendEntries handler, to be dispatched by the transport
    /// server.
    pub fn append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        self.inner.handle_append_entries(args)
    }

    /// Inbound InstallSnapshot handler, to be dispatched by the transport
    /// server.
    pub fn install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        self.inner.handle_install_snapshot(args)
    }
}

impl<C, T> Inner<C, T>
where
    C: Command,
    T: Transport<C>,
{
    fn restore(
        me: ReplicaID,
        peer_ids: Vec<ReplicaID>,
        transport: T,
        persister: Arc<dyn Persister>,
        apply_tx: Sender<ApplyMsg<C>>,
        heartbeat_timeout: Duration,
        election_timeout: (Duration, Duration),
    ) -> Result<Inner<C, T>, PersistError> {
        let mut state = RaftState {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry {
                index: 0,
                term: 0,
                command: C::default(),
            }],
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            next_index: BTreeMap::new(),
            match_index: BTreeMap::new(),
            current_votes: BTreeSet::new(),
            pending_snapshot: None,
        };

        // A fresh persister holds empty blobs; check before decoding.
        let state_blob = persister.read_raft_state()?;
        if !state_blob.is_empty() {
            let hard: HardState<C> = decode_state(&state_blob)?;
            state.current_term = hard.current_term;
            state.voted_for = hard.voted_for;
            state.log = hard.log;
        }

        let snapshot_blob = persister.read_snapshot()?;
        if !snapshot_blob.is_empty() {
            // Queue a delivery so the service rebuilds its state before
            // entries past the boundary arrive.
            state.pending_snapshot = Some(decode_snapshot(&snapshot_blob)?);
        }

        state.commit_index = state.base();
        state.last_applied = state.base();

        let signals = Signals::new();
        if state.pending_snapshot.is_some() {
            let _ = signals.commit_tx.try_send(());
        }

        let cluster_size = peer_ids.len() + 1;
        Ok(Inner {
            me,
            peer_ids,
            cluster_size,
            transport,
            persister,
            apply_tx,
            state: Mutex::new(state),
            signals,
            dead: AtomicBool::new(false),
            heartbeat_timeout,
            election_timeout,
        })
    }

    fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn role(&self) -> Role {
        self.state.lock().unwrap().role
    }

    fn random_election_timeout(&self) -> Duration {
        rand::thread_rng().gen_range(self.election_timeout.0..self.election_timeout.1)
    }

    // Role driver. One wait loop per role; the handlers make the
    // transitions, the loops wake on signals and reread the role under the
    // lock.
    fn run(self: Arc<Self>) {
        while !self.killed() {
            match self.role() {
                Role::Follower => self.run_follower(),
                Role::Candidate => self.run_candidate(),
                Role::Leader => self.run_leader(),
            }
        }
    }

    fn run_follower(&self) {
        let mut deadline = Instant::now() + self.random_election_timeout();
        loop {
            if self.killed() {
                return;
            }
            match self.signals.reset_rx.recv_deadline(deadline) {
                // A heartbeat arrived or a vote was granted; push the
                // deadline out.
                Ok(()) => {
                    if self.role() != Role::Follower {
                        return;
                    }
                    deadline = Instant::now() + self.random_election_timeout();
                }
                Err(RecvTimeoutError::Timeout) => {
                    let mut state = self.state.lock().unwrap();
                    if state.role == Role::Follower {
                        state.role = Role::Candidate;
                    }
                    return;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn run_candidate(self: &Arc<Self>) {
        self.start_election();
        let deadline = Instant::now() + self.random_election_timeout();
        loop {
            if self.killed() || self.role() != Role::Candidate {
                return;
            }

            let mut select = Select::new();
            let won = select.recv(&self.signals.won_rx);
            let reset = select.recv(&self.signals.reset_rx);
            let remaining = deadline.saturating_duration_since(Instant::now());
            let oper = match select.select_timeout(remaining) {
                Ok(oper) => oper,
                // No winner this round; run() starts a fresh election with
                // a fresh term.
                Err(_) => return,
            };
            match oper.index() {
                i if i == won => {
                    let _ = oper.recv(&self.signals.won_rx);
                }
                i if i == reset => {
                    let _ = oper.recv(&self.signals.reset_rx);
                }
                _ => unreachable!(),
            }
            // Loop around and reread the role under the lock.
        }
    }

    fn run_leader(self: &Arc<Self>) {
        // Announce leadership immediately; the empty round resets follower
        // election timers before they can expire.
        self.broadcast_round();
        let mut heartbeat = Timer::new(self.heartbeat_timeout);
        heartbeat.renew();
        let heartbeat_rx = heartbeat.get_rx();

        enum Wake {
            Heartbeat,
            Submitted,
            Signal,
        }

        loop {
            if self.killed() || self.role() != Role::Leader {
                return;
            }

            let wake = {
                let mut select = Select::new();
                let tick = select.recv(&heartbeat_rx);
                let submitted = select.recv(&self.signals.submit_rx);
                let reset = select.recv(&self.signals.reset_rx);
                let oper = select.select();
                match oper.index() {
                    i if i == tick => {
                        let _ = oper.recv(&heartbeat_rx);
                        Wake::Heartbeat
                    }
                    i if i == submitted => {
                        let _ = oper.recv(&self.signals.submit_rx);
                        Wake::Submitted
                    }
                    i if i == reset => {
                        let _ = oper.recv(&self.signals.reset_rx);
                        Wake::Signal
                    }
                    _ => unreachable!(),
                }
            };

            match wake {
                Wake::Heartbeat => {
                    self.broadcast_round();
                    heartbeat.renew();
                }
                Wake::Submitted => {
                    self.broadcast_round();
                }
                // Demotion; the next iteration rereads the role and exits.
                Wake::Signal => {}
            }
        }
    }

    fn start_election(self: &Arc<Self>) {
        let args = {
            let mut state = self.state.lock().unwrap();
            if state.role != Role::Candidate {
                return;
            }
            state.current_term += 1;
            state.voted_for = Some(self.me);
            state.current_votes.clear();
            state.current_votes.insert(self.me);
            self.persist(&state);
            debug!(me = self.me, term = state.current_term, "starting election");

            if 2 * state.current_votes.len() > self.cluster_size {
                // Single-replica cluster; there is nobody to ask.
                self.become_leader(&mut state);
                return;
            }

            RequestVoteArgs {
                term: state.current_term,
                candidate_id: self.me,
                last_log_index: state.last_index(),
                last_log_term: state.last_term(),
            }
        };

        for &peer in &self.peer_ids {
            let inner = Arc::clone(self);
            let args = args.clone();
            thread::spawn(move || {
                if let Some(reply) = inner.transport.request_vote(peer, &args) {
                    inner.fold_vote_reply(peer, &args, reply);
                }
            });
        }
    }

    fn fold_vote_reply(&self, from: ReplicaID, args: &RequestVoteArgs, reply: RequestVoteReply) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        // Discard replies from an earlier candidacy.
        if state.role != Role::Candidate || args.term != state.current_term {
            return;
        }
        if reply.vote_granted {
            state.current_votes.insert(from);
            if 2 * state.current_votes.len() > self.cluster_size {
                self.become_leader(&mut state);
            }
        }
    }

    fn become_leader(&self, state: &mut RaftState<C>) {
        info!(me = self.me, term = state.current_term, "won election");
        state.role = Role::Leader;
        state.current_votes.clear();
        state.next_index.clear();
        state.match_index.clear();
        let next = state.last_index() + 1;
        for &peer in &self.peer_ids {
            state.next_index.insert(peer, next);
            state.match_index.insert(peer, 0);
        }
        let _ = self.signals.won_tx.try_send(());
    }

    // Any message carrying a term beyond ours forces a durable term
    // adoption; a leader or candidate also drops back to follower and its
    // loop is woken to notice.
    fn step_down(&self, state: &mut RaftState<C>, term: usize) {
        let was = state.role;
        state.current_term = term;
        state.voted_for = None;
        state.role = Role::Follower;
        self.persist(state);
        if was != Role::Follower {
            debug!(me = self.me, term, "stepping down to follower");
            let _ = self.signals.reset_tx.try_send(());
        }
    }

    // One replication round: per peer, either the entries it is missing or
    // the snapshot if those entries are already compacted away. Arguments
    // are built under the lock; the calls happen on sender threads.
    fn broadcast_round(self: &Arc<Self>) {
        let mut round: Vec<(ReplicaID, Outbound<C>)> = Vec::new();
        {
            let state = self.state.lock().unwrap();
            if state.role != Role::Leader {
                return;
            }
            for &peer in &self.peer_ids {
                let prev = state.next_index[&peer] - 1;
                if prev < state.base() {
                    let snapshot = self.stored_snapshot();
                    round.push((
                        peer,
                        Outbound::Snapshot(InstallSnapshotArgs {
                            term: state.current_term,
                            leader: self.me,
                            last_included_index: state.base(),
                            last_included_term: state.log[0].term,
                            data: snapshot.data,
                        }),
                    ));
                } else {
                    let entries = state.log[state.slot(prev) + 1..].to_vec();
                    round.push((
                        peer,
                        Outbound::Append(AppendEntriesArgs {
                            term: state.current_term,
                            leader: self.me,
                            prev_log_index: prev,
                            prev_log_term: state.term_at(prev),
                            entries,
                            leader_commit: state.commit_index,
                        }),
                    ));
                }
            }
        }

        for (peer, outbound) in round {
            let inner = Arc::clone(self);
            thread::spawn(move || match outbound {
                Outbound::Append(args) => {
                    if let Some(reply) = inner.transport.append_entries(peer, &args) {
                        inner.fold_append_reply(peer, &args, reply);
                    }
                }
                Outbound::Snapshot(args) => {
                    if let Some(reply) = inner.transport.install_snapshot(peer, &args) {
                        inner.fold_snapshot_reply(peer, &args, reply);
                    }
                }
            });
        }
    }

    fn fold_append_reply(
        &self,
        from: ReplicaID,
        args: &AppendEntriesArgs<C>,
        reply: AppendEntriesReply,
    ) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        if state.role != Role::Leader || args.term != state.current_term {
            return;
        }

        if reply.success {
            // Replies can arrive out of order; the peer bookkeeping only
            // moves forward.
            let matched = args.prev_log_index + args.entries.len();
            if matched > state.match_index[&from] {
                state.match_index.insert(from, matched);
            }
            if matched + 1 > state.next_index[&from] {
                state.next_index.insert(from, matched + 1);
            }
            self.advance_commit(&mut state);
        } else {
            // Accelerated backtracking. A rejection that would move
            // next_index forward is a stray duplicate.
            let floor = cmp::max(state.base(), 1);
            let hint = cmp::min(cmp::max(reply.next_index, floor), state.last_index() + 1);
            if hint < state.next_index[&from] {
                state.next_index.insert(from, hint);
            }
        }
    }

    fn fold_snapshot_reply(
        &self,
        from: ReplicaID,
        args: &InstallSnapshotArgs,
        reply: InstallSnapshotReply,
    ) {
        let mut state = self.state.lock().unwrap();
        if reply.term > state.current_term {
            self.step_down(&mut state, reply.term);
            return;
        }
        if state.role != Role::Leader || args.term != state.current_term {
            return;
        }
        if args.last_included_index > state.match_index[&from] {
            state.match_index.insert(from, args.last_included_index);
        }
        if args.last_included_index + 1 > state.next_index[&from] {
            state.next_index.insert(from, args.last_included_index + 1);
        }
    }

    // An index commits once a majority of match indices cover it and the
    // entry is from the current term. Majority-counting a prior-term entry
    // directly could commit something a later leader is still allowed to
    // overwrite.
    fn advance_commit(&self, state: &mut RaftState<C>) {
        if state.role != Role::Leader {
            return;
        }
        let mut advanced = false;
        for index in state.commit_index + 1..=state.last_index() {
            if state.term_at(index) != state.current_term {
                continue;
            }
            let replicas = 1 + self
                .peer_ids
                .iter()
                .filter(|&&peer| state.match_index[&peer] >= index)
                .count();
            if 2 * replicas > self.cluster_size {
                state.commit_index = index;
                advanced = true;
            }
        }
        if advanced {
            trace!(
                me = self.me,
                commit_index = state.commit_index,
                "commit advanced"
            );
            let _ = self.signals.commit_tx.try_send(());
        }
    }

    fn submit(&self, command: C) -> Option<(usize, usize)> {
        let mut state = self.state.lock().unwrap();
        if state.role != Role::Leader {
            return None;
        }
        let index = state.last_index() + 1;
        let term = state.current_term;
        state.log.push(LogEntry {
            index,
            term,
            command,
        });
        self.persist(&state);
        // A single-replica cluster commits right here.
        self.advance_commit(&mut state);
        drop(state);
        let _ = self.signals.submit_tx.try_send(());
        Some((index, term))
    }

    fn get_state(&self) -> (usize, bool) {
        let state = self.state.lock().unwrap();
        (state.current_term, state.role == Role::Leader)
    }

    fn compact(&self, last_included_index: usize, data: Bytes) {
        let mut state = self.state.lock().unwrap();
        // Only applied entries can be folded into a snapshot, and
        // compaction never moves backwards.
        if last_included_index <= state.base() || last_included_index > state.last_applied {
            return;
        }
        let term = state.term_at(last_included_index);
        let cut = state.slot(last_included_index);
        state.log.drain(..cut);
        state.log[0] = LogEntry {
            index: last_included_index,
            term,
            command: C::default(),
        };
        let snapshot = Snapshot {
            last_included_index,
            last_included_term: term,
            data,
        };
        self.persist_with_snapshot(&state, &snapshot);
        debug!(me = self.me, last_included_index, "compacted log");
    }

    fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
        // Wake every waiter so the flag is observed promptly.
        let _ = self.signals.reset_tx.try_send(());
        let _ = self.signals.won_tx.try_send(());
        let _ = self.signals.submit_tx.try_send(());
        let _ = self.signals.commit_tx.try_send(());
    }

    fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut state = self.state.lock().unwrap();

        if args.term < state.current_term {
            return RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            };
        }
        if args.term > state.current_term {
            self.step_down(&mut state, args.term);
        }

        // Grant only to candidates whose log is at least as up to date as
        // ours; anything less could erase committed entries.
        let up_to_date = args.last_log_term > state.last_term()
            || (args.last_log_term == state.last_term()
                && args.last_log_index >= state.last_index());
        let free_to_vote =
            state.voted_for.is_none() || state.voted_for == Some(args.candidate_id);

        if up_to_date && free_to_vote {
            state.voted_for = Some(args.candidate_id);
            state.role = Role::Follower;
            // The grant must be durable before the candidate may count it.
            self.persist(&state);
            trace!(
                me = self.me,
                candidate = args.candidate_id,
                term = state.current_term,
                "vote granted"
            );
            let _ = self.signals.reset_tx.try_send(());
            RequestVoteReply {
                term: state.current_term,
                vote_granted: true,
            }
        } else {
            RequestVoteReply {
                term: state.current_term,
                vote_granted: false,
            }
        }
    }

    fn handle_append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        let mut state = self.state.lock().unwrap();

        // A stale leader learns our term and backs off.
        if args.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                success: false,
                next_index: state.last_index() + 1,
            };
        }

        // A live leader suppresses elections for this window.
        let _ = self.signals.reset_tx.try_send(());
        if args.term > state.current_term {
            state.current_term = args.term;
            state.voted_for = None;
        }
        state.role = Role::Follower;

        // Our log is too short to check the previous entry.
        if args.prev_log_index > state.last_index() {
            let reply = AppendEntriesReply {
                term: state.current_term,
                success: false,
                next_index: state.last_index() + 1,
            };
            self.persist(&state);
            return reply;
        }

        // The previous entry conflicts. Back the leader up to the first
        // index of the conflicting term rather than one entry at a time.
        // At or below base the snapshot is authoritative and always
        // matches.
        if args.prev_log_index > state.base()
            && state.term_at(args.prev_log_index) != args.prev_log_term
        {
            let conflict = state.term_at(args.prev_log_index);
            let mut next_index = args.prev_log_index;
            while next_index > state.base() + 1 && state.term_at(next_index - 1) == conflict {
                next_index -= 1;
            }
            let reply = AppendEntriesReply {
                term: state.current_term,
                success: false,
                next_index,
            };
            self.persist(&state);
            return reply;
        }

        // Integrate the entries: skip what the snapshot already covers and
        // what we already hold, truncate from the first real conflict, then
        // append. A stale duplicate therefore cannot drop entries a newer
        // message appended.
        for entry in args.entries {
            if entry.index <= state.base() {
                continue;
            }
            if entry.index <= state.last_index() {
                if state.term_at(entry.index) == entry.term {
                    continue;
                }
                let cut = state.slot(entry.index);
                state.log.truncate(cut);
            }
            state.log.push(entry);
        }
        self.persist(&state);

        // Chase the leader's commit index, bounded by what we hold.
        if args.leader_commit > state.commit_index {
            state.commit_index = cmp::min(args.leader_commit, state.last_index());
            let _ = self.signals.commit_tx.try_send(());
        }

        AppendEntriesReply {
            term: state.current_term,
            success: true,
            next_index: state.last_index() + 1,
        }
    }

    fn handle_install_snapshot(&self, args: InstallSnapshotArgs) -> InstallSnapshotReply {
        let mut state = self.state.lock().unwrap();

        if args.term < state.current_term {
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }

        let _ = self.signals.reset_tx.try_send(());
        if args.term > state.current_term {
            state.current_term = args.term;
            state.voted_for = None;
        }
        state.role = Role::Follower;

        // Everything at or below the commit index is already settled here;
        // an older snapshot would only rewind us.
        if args.last_included_index <= state.commit_index {
            self.persist(&state);
            return InstallSnapshotReply {
                term: state.current_term,
            };
        }

        // Keep the suffix past the boundary when our log contains the
        // boundary entry itself; otherwise the whole log is superseded.
        let matches_boundary = args.last_included_index <= state.last_index()
            && state.term_at(args.last_included_index) == args.last_included_term;
        let suffix: Vec<LogEntry<C>> = if matches_boundary {
            state.log[state.slot(args.last_included_index) + 1..].to_vec()
        } else {
            Vec::new()
        };

        let mut log = Vec::with_capacity(suffix.len() + 1);
        log.push(LogEntry {
            index: args.last_included_index,
            term: args.last_included_term,
            command: C::default(),
        });
        log.extend(suffix);
        state.log = log;

        state.commit_index = args.last_included_index;
        state.last_applied = args.last_included_index;

        let snapshot = Snapshot {
            last_included_index: args.last_included_index,
            last_included_term: args.last_included_term,
            data: args.data,
        };
        // Both slots must land together before the reply.
        self.persist_with_snapshot(&state, &snapshot);
        info!(
            me = self.me,
            last_included_index = snapshot.last_included_index,
            "installed snapshot"
        );
        state.pending_snapshot = Some(snapshot);
        let _ = self.signals.commit_tx.try_send(());

        InstallSnapshotReply {
            term: state.current_term,
        }
    }

    // Apply pump: the only steady-state writer of last_applied. Delivers a
    // queued snapshot first, then committed entries one at a time in index
    // order. The channel send happens outside the lock, so a slow consumer
    // stalls only this pump.
    fn run_apply(&self) {
        loop {
            if self.killed() {
                return;
            }

            let next = {
                let mut state = self.state.lock().unwrap();
                if let Some(snapshot) = state.pending_snapshot.take() {
                    Some((ApplyMsg::Snapshot(snapshot), None))
                } else if state.last_applied < state.commit_index {
                    let index = state.last_applied + 1;
                    let slot = state.slot(index);
                    Some((
                        ApplyMsg::Command {
                            index,
                            command: state.log[slot].command.clone(),
                        },
                        Some(index),
                    ))
                } else {
                    None
                }
            };

            match next {
                Some((msg, applied)) => {
                    // The consumer hanging up is a shutdown.
                    if self.apply_tx.send(msg).is_err() {
                        return;
                    }
                    if let Some(index) = applied {
                        let mut state = self.state.lock().unwrap();
                        // A snapshot install may have advanced last_applied
                        // past us while the send was in flight.
                        if state.last_applied < index {
                            state.last_applied = index;
                        }
                    }
                }
                None => {
                    let _ = self
                        .signals
                        .commit_rx
                        .recv_timeout(Duration::from_millis(50));
                }
            }
        }
    }

    fn stored_snapshot(&self) -> Snapshot {
        let blob = self
            .persister
            .read_snapshot()
            .unwrap_or_else(|err| panic!("snapshot read failed: {}", err));
        decode_snapshot(&blob).unwrap_or_else(|err| panic!("snapshot decode failed: {}", err))
    }

    // A failed write is fatal: continuing could un-grant a vote or
    // resurrect truncated entries after a restart.
    fn persist(&self, state: &RaftState<C>) {
        let blob = self.encode_hard_state(state);
        if let Err(err) = self.persister.save_raft_state(blob) {
            panic!("raft state write failed: {}", err);
        }
    }

    fn persist_with_snapshot(&self, state: &RaftState<C>, snapshot: &Snapshot) {
        let blob = self.encode_hard_state(state);
        let snapshot_blob = encode_snapshot(snapshot)
            .unwrap_or_else(|err| panic!("snapshot encode failed: {}", err));
        if let Err(err) = self.persister.save_state_and_snapshot(blob, snapshot_blob) {
            panic!("raft state and snapshot write failed: {}", err);
        }
    }

    fn encode_hard_state(&self, state: &RaftState<C>) -> Bytes {
        let hard = HardState {
            current_term: state.current_term,
            voted_for: state.voted_for,
            log: state.log.clone(),
        };
        encode_state(&hard).unwrap_or_else(|err| panic!("raft state encode failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemPersister;
    use crossbeam_channel::unbounded;

    struct NullTransport;

    impl Transport<u64> for NullTransport {
        fn request_vote(&self, _: ReplicaID, _: &RequestVoteArgs) -> Option<RequestVoteReply> {
            None
        }

        fn append_entries(
            &self,
            _: ReplicaID,
            _: &AppendEntriesArgs<u64>,
        ) -> Option<AppendEntriesReply> {
            None
        }

        fn install_snapshot(
            &self,
            _: ReplicaID,
            _: &InstallSnapshotArgs,
        ) -> Option<InstallSnapshotReply> {
            None
        }
    }

    struct Fixture {
        inner: Arc<Inner<u64, NullTransport>>,
        apply_rx: Receiver<ApplyMsg<u64>>,
        persister: Arc<MemPersister>,
    }

    // Handler tests build the replica without spawning the driver or the
    // pump, so nothing advances terms behind the assertions.
    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemPersister::new()))
    }

    fn fixture_with(persister: Arc<MemPersister>) -> Fixture {
        let (apply_tx, apply_rx) = unbounded();
        let inner = Arc::new(
            Inner::restore(
                0,
                vec![1, 2],
                NullTransport,
                persister.clone() as Arc<dyn Persister>,
                apply_tx,
                HEARTBEAT_INTERVAL,
                (ELECTION_TIMEOUT_MIN, ELECTION_TIMEOUT_MAX),
            )
            .unwrap(),
        );
        Fixture {
            inner,
            apply_rx,
            persister,
        }
    }

    fn entry(index: usize, term: usize) -> LogEntry<u64> {
        LogEntry {
            index,
            term,
            command: index as u64 * 10,
        }
    }

    fn seed_log(inner: &Inner<u64, NullTransport>, entries: &[(usize, usize)]) {
        let mut state = inner.state.lock().unwrap();
        for &(index, term) in entries {
            state.log.push(entry(index, term));
        }
    }

    fn make_leader(inner: &Inner<u64, NullTransport>, term: usize) {
        let mut state = inner.state.lock().unwrap();
        state.current_term = term;
        state.role = Role::Candidate;
        state.current_votes.insert(0);
        inner.become_leader(&mut state);
    }

    fn append(
        term: usize,
        prev_log_index: usize,
        prev_log_term: usize,
        entries: Vec<LogEntry<u64>>,
        leader_commit: usize,
    ) -> AppendEntriesArgs<u64> {
        AppendEntriesArgs {
            term,
            leader: 1,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        }
    }

    fn log_terms(inner: &Inner<u64, NullTransport>) -> Vec<(usize, usize)> {
        let state = inner.state.lock().unwrap();
        log_terms_locked(&state)
    }

    fn log_terms_locked(state: &RaftState<u64>) -> Vec<(usize, usize)> {
        state.log.iter().map(|e| (e.index, e.term)).collect()
    }

    #[test]
    fn vote_granted_to_up_to_date_candidate() {
        let f = fixture();
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);
        assert_eq!(f.inner.state.lock().unwrap().voted_for, Some(1));
    }

    #[test]
    fn vote_rejected_for_stale_term() {
        let f = fixture();
        f.inner.state.lock().unwrap().current_term = 5;
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 4,
            candidate_id: 1,
            last_log_index: 10,
            last_log_term: 4,
        });
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[test]
    fn one_vote_per_term() {
        let f = fixture();
        let grant = f.inner.handle_request_vote(RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(grant.vote_granted);

        // A different candidate in the same term is refused; the same
        // candidate is re-granted.
        let other = f.inner.handle_request_vote(RequestVoteArgs {
            term: 1,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(!other.vote_granted);
        let again = f.inner.handle_request_vote(RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(again.vote_granted);
    }

    #[test]
    fn vote_rejected_when_candidate_log_behind() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 2)]);
        f.inner.state.lock().unwrap().current_term = 2;

        // Lower last term loses regardless of length.
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 3,
            candidate_id: 1,
            last_log_index: 7,
            last_log_term: 1,
        });
        assert!(!reply.vote_granted);

        // Equal last term but shorter log loses too.
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 4,
            candidate_id: 1,
            last_log_index: 1,
            last_log_term: 2,
        });
        assert!(!reply.vote_granted);

        // Equal last term and equal length is good enough.
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 5,
            candidate_id: 1,
            last_log_index: 2,
            last_log_term: 2,
        });
        assert!(reply.vote_granted);
    }

    #[test]
    fn granted_vote_is_durable() {
        let f = fixture();
        let reply = f.inner.handle_request_vote(RequestVoteArgs {
            term: 3,
            candidate_id: 2,
            last_log_index: 0,
            last_log_term: 0,
        });
        assert!(reply.vote_granted);

        // The grant is on disk before the reply, so a crash and restart
        // within the term cannot double-vote.
        let restarted = fixture_with(f.persister.clone());
        let state = restarted.inner.state.lock().unwrap();
        assert_eq!(state.current_term, 3);
        assert_eq!(state.voted_for, Some(2));
    }

    #[test]
    fn higher_term_demotes_leader() {
        let f = fixture();
        make_leader(&f.inner, 2);

        let reply = f
            .inner
            .handle_append_entries(append(5, 0, 0, Vec::new(), 0));
        assert!(reply.success);

        let state = f.inner.state.lock().unwrap();
        assert_eq!(state.current_term, 5);
        assert_eq!(state.role, Role::Follower);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn append_rejects_stale_term() {
        let f = fixture();
        f.inner.state.lock().unwrap().current_term = 3;
        let reply = f
            .inner
            .handle_append_entries(append(2, 0, 0, vec![entry(1, 2)], 0));
        assert!(!reply.success);
        assert_eq!(reply.term, 3);
        assert_eq!(f.inner.state.lock().unwrap().log.len(), 1);
    }

    #[test]
    fn append_past_end_hints_own_length() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1)]);
        let reply = f.inner.handle_append_entries(append(1, 5, 1, Vec::new(), 0));
        assert!(!reply.success);
        assert_eq!(reply.next_index, 2);
    }

    #[test]
    fn append_conflict_backtracks_whole_term() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 2), (3, 2), (4, 2)]);
        f.inner.state.lock().unwrap().current_term = 3;

        let reply = f.inner.handle_append_entries(append(3, 4, 3, Vec::new(), 0));
        assert!(!reply.success);
        // The whole run of term-2 entries is skipped in one step.
        assert_eq!(reply.next_index, 2);
    }

    #[test]
    fn append_extends_log_and_commit() {
        let f = fixture();
        let reply = f
            .inner
            .handle_append_entries(append(1, 0, 0, vec![entry(1, 1), entry(2, 1)], 1));
        assert!(reply.success);
        assert_eq!(reply.next_index, 3);

        let state = f.inner.state.lock().unwrap();
        assert_eq!(state.last_index(), 2);
        // Commit follows leader_commit, not the log end.
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1)]);

        let mut replacement = entry(2, 3);
        replacement.command = 777;
        let reply = f
            .inner
            .handle_append_entries(append(3, 1, 1, vec![replacement], 0));
        assert!(reply.success);
        assert_eq!(log_terms(&f.inner), vec![(0, 0), (1, 1), (2, 3)]);
        assert_eq!(f.inner.state.lock().unwrap().log[2].command, 777);
    }

    #[test]
    fn duplicate_append_is_idempotent() {
        let f = fixture();
        let args = append(1, 0, 0, vec![entry(1, 1), entry(2, 1)], 0);
        let first = f.inner.handle_append_entries(args.clone());
        let second = f.inner.handle_append_entries(args);
        assert!(first.success && second.success);
        assert_eq!(log_terms(&f.inner), vec![(0, 0), (1, 1), (2, 1)]);
    }

    #[test]
    fn stale_shorter_duplicate_keeps_newer_entries() {
        let f = fixture();
        f.inner.handle_append_entries(append(
            1,
            0,
            0,
            vec![entry(1, 1), entry(2, 1), entry(3, 1)],
            0,
        ));

        // A delayed retransmission carrying only the first entry must not
        // roll the log back.
        let reply = f
            .inner
            .handle_append_entries(append(1, 0, 0, vec![entry(1, 1)], 0));
        assert!(reply.success);
        assert_eq!(reply.next_index, 4);
        assert_eq!(log_terms(&f.inner), vec![(0, 0), (1, 1), (2, 1), (3, 1)]);
    }

    #[test]
    fn submit_rejected_on_follower() {
        let f = fixture();
        assert_eq!(f.inner.submit(9), None);
    }

    #[test]
    fn submit_appends_on_leader() {
        let f = fixture();
        make_leader(&f.inner, 1);
        assert_eq!(f.inner.submit(9), Some((1, 1)));
        assert_eq!(f.inner.submit(8), Some((2, 1)));
        assert_eq!(log_terms(&f.inner), vec![(0, 0), (1, 1), (2, 1)]);
    }

    #[test]
    fn leader_commits_on_majority() {
        let f = fixture();
        make_leader(&f.inner, 1);
        f.inner.submit(9);

        let args = {
            let state = f.inner.state.lock().unwrap();
            append(1, 0, 0, state.log[1..].to_vec(), 0)
        };
        f.inner.fold_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term: 1,
                success: true,
                next_index: 2,
            },
        );

        let state = f.inner.state.lock().unwrap();
        assert_eq!(state.match_index[&1], 1);
        assert_eq!(state.next_index[&1], 2);
        // Self plus one peer is a majority of three.
        assert_eq!(state.commit_index, 1);
    }

    #[test]
    fn leader_ignores_reply_from_older_term() {
        let f = fixture();
        make_leader(&f.inner, 2);
        f.inner.submit(9);

        let stale = append(1, 0, 0, Vec::new(), 0);
        f.inner.fold_append_reply(
            1,
            &stale,
            AppendEntriesReply {
                term: 1,
                success: true,
                next_index: 2,
            },
        );
        assert_eq!(f.inner.state.lock().unwrap().commit_index, 0);
    }

    #[test]
    fn majority_alone_cannot_commit_prior_term() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1)]);
        make_leader(&f.inner, 2);
        {
            let mut state = f.inner.state.lock().unwrap();
            state.match_index.insert(1, 1);
            state.match_index.insert(2, 1);
            f.inner.advance_commit(&mut state);
            // The term-1 entry is fully replicated but not from term 2; it
            // may only commit beneath a term-2 entry.
            assert_eq!(state.commit_index, 0);
        }

        f.inner.submit(9);
        let mut state = f.inner.state.lock().unwrap();
        state.match_index.insert(1, 2);
        f.inner.advance_commit(&mut state);
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn rejection_backtracks_next_index() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1), (3, 1)]);
        make_leader(&f.inner, 2);

        let args = append(2, 3, 1, Vec::new(), 0);
        f.inner.fold_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term: 2,
                success: false,
                next_index: 2,
            },
        );
        assert_eq!(f.inner.state.lock().unwrap().next_index[&1], 2);

        // A stray rejection that would move next_index forward is ignored.
        f.inner.fold_append_reply(
            1,
            &args,
            AppendEntriesReply {
                term: 2,
                success: false,
                next_index: 4,
            },
        );
        assert_eq!(f.inner.state.lock().unwrap().next_index[&1], 2);
    }

    #[test]
    fn install_snapshot_replaces_log() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1)]);

        let reply = f.inner.handle_install_snapshot(InstallSnapshotArgs {
            term: 2,
            leader: 1,
            last_included_index: 5,
            last_included_term: 2,
            data: Bytes::from_static(b"app state"),
        });
        assert_eq!(reply.term, 2);

        let state = f.inner.state.lock().unwrap();
        assert_eq!(log_terms_locked(&state), vec![(5, 2)]);
        assert_eq!(state.commit_index, 5);
        assert_eq!(state.last_applied, 5);
        assert!(state.pending_snapshot.is_some());
        drop(state);

        // Both slots were written before the reply.
        assert!(!f.persister.read_snapshot().unwrap().is_empty());
        let restarted = fixture_with(f.persister.clone());
        let state = restarted.inner.state.lock().unwrap();
        assert_eq!(state.base(), 5);
        assert_eq!(state.commit_index, 5);
    }

    #[test]
    fn install_snapshot_keeps_matching_suffix() {
        let f = fixture();
        seed_log(
            &f.inner,
            &[(1, 1), (2, 1), (3, 2), (4, 2), (5, 2), (6, 3), (7, 3)],
        );

        f.inner.handle_install_snapshot(InstallSnapshotArgs {
            term: 3,
            leader: 1,
            last_included_index: 5,
            last_included_term: 2,
            data: Bytes::new(),
        });

        let state = f.inner.state.lock().unwrap();
        assert_eq!(log_terms_locked(&state), vec![(5, 2), (6, 3), (7, 3)]);
        assert_eq!(state.last_index(), 7);
    }

    #[test]
    fn repeated_install_snapshot_is_noop() {
        let f = fixture();
        let args = InstallSnapshotArgs {
            term: 2,
            leader: 1,
            last_included_index: 5,
            last_included_term: 2,
            data: Bytes::from_static(b"app state"),
        };
        f.inner.handle_install_snapshot(args.clone());
        {
            let mut state = f.inner.state.lock().unwrap();
            state.pending_snapshot = None;
        }

        // The boundary now sits at the commit index; a replay changes
        // nothing and queues no second delivery.
        f.inner.handle_install_snapshot(args);
        let state = f.inner.state.lock().unwrap();
        assert_eq!(log_terms_locked(&state), vec![(5, 2)]);
        assert_eq!(state.commit_index, 5);
        assert!(state.pending_snapshot.is_none());
    }

    #[test]
    fn compact_discards_applied_prefix() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1), (3, 2), (4, 2)]);
        {
            let mut state = f.inner.state.lock().unwrap();
            state.commit_index = 3;
            state.last_applied = 3;
        }

        f.inner.compact(3, Bytes::from_static(b"through 3"));

        let state = f.inner.state.lock().unwrap();
        assert_eq!(log_terms_locked(&state), vec![(3, 2), (4, 2)]);
        assert_eq!(state.log[0].command, 0);
        drop(state);

        let snapshot = decode_snapshot(&f.persister.read_snapshot().unwrap()).unwrap();
        assert_eq!(snapshot.last_included_index, 3);
        assert_eq!(snapshot.last_included_term, 2);
    }

    #[test]
    fn compact_ignores_unapplied_index() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1)]);
        f.inner.state.lock().unwrap().last_applied = 1;

        f.inner.compact(2, Bytes::new());
        assert_eq!(log_terms(&f.inner), vec![(0, 0), (1, 1), (2, 1)]);
    }

    #[test]
    fn apply_pump_delivers_in_order() {
        let f = fixture();
        seed_log(&f.inner, &[(1, 1), (2, 1), (3, 1)]);
        f.inner.state.lock().unwrap().commit_index = 3;

        let pump = Arc::clone(&f.inner);
        thread::spawn(move || pump.run_apply());

        for want in 1..=3 {
            match f.apply_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                ApplyMsg::Command { index, command } => {
                    assert_eq!(index, want);
                    assert_eq!(command, want as u64 * 10);
                }
                other => panic!("unexpected delivery: {:?}", other),
            }
        }
        assert!(f
            .apply_rx
            .recv_timeout(Duration::from_millis(100))
            .is_err());
        assert_eq!(f.inner.state.lock().unwrap().last_applied, 3);
        f.inner.kill();
    }

    #[test]
    fn apply_pump_delivers_snapshot_before_commands() {
        let f = fixture();
        f.inner.handle_install_snapshot(InstallSnapshotArgs {
            term: 1,
            leader: 1,
            last_included_index: 4,
            last_included_term: 1,
            data: Bytes::from_static(b"app state"),
        });
        f.inner
            .handle_append_entries(append(1, 4, 1, vec![entry(5, 1)], 5));

        let pump = Arc::clone(&f.inner);
        thread::spawn(move || pump.run_apply());

        match f.apply_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ApplyMsg::Snapshot(snapshot) => {
                assert_eq!(snapshot.last_included_index, 4);
                assert_eq!(snapshot.data, Bytes::from_static(b"app state"));
            }
            other => panic!("expected snapshot first, got {:?}", other),
        }
        match f.apply_rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            ApplyMsg::Command { index, .. } => assert_eq!(index, 5),
            other => panic!("unexpected delivery: {:?}", other),
        }
        f.inner.kill();
    }

    #[test]
    fn restore_round_trips_hard_state() {
        let f = fixture();
        f.inner
            .handle_append_entries(append(4, 0, 0, vec![entry(1, 2), entry(2, 4)], 0));

        let restarted = fixture_with(f.persister.clone());
        let state = restarted.inner.state.lock().unwrap();
        assert_eq!(state.current_term, 4);
        assert_eq!(log_terms_locked(&state), vec![(0, 0), (1, 2), (2, 4)]);
        // Volatile counters restart at the snapshot boundary.
        assert_eq!(state.commit_index, 0);
        assert_eq!(state.last_applied, 0);
    }

    #[test]
    fn restore_with_snapshot_queues_delivery() {
        let f = fixture();
        f.inner.handle_install_snapshot(InstallSnapshotArgs {
            term: 2,
            leader: 1,
            last_included_index: 6,
            last_included_term: 2,
            data: Bytes::from_static(b"app state"),
        });

        let restarted = fixture_with(f.persister.clone());
        let state = restarted.inner.state.lock().unwrap();
        assert_eq!(state.commit_index, 6);
        assert_eq!(state.last_applied, 6);
        match &state.pending_snapshot {
            Some(snapshot) => assert_eq!(snapshot.last_included_index, 6),
            None => panic!("expected queued snapshot delivery"),
        }
    }
}
