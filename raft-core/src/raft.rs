use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::RaftLog;
use crate::network::{Network, RaftService};
use crate::state::{NodeState, RaftState, ReplicationOutcome, ReplicationRequest, VoteOutcome};
use crate::state_machine::StateMachine;
use crate::storage::{HardState, Snapshot, Storage};
use async_trait::async_trait;
use serde::Serialize;
use shared::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use shared::types::{EntryKind, Index, LogEntry, NodeId, Term};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch, Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

/// Externally visible snapshot of a node's consensus position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusStatus {
    pub node_id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub leader_id: Option<NodeId>,
    pub commit_index: Index,
    pub last_applied: Index,
    pub last_log_index: Index,
    pub cluster_size: usize,
}

struct PendingProposal {
    term: Term,
    tx: oneshot::Sender<Result<Index, RaftError>>,
}

/// Everything guarded by the node's single lock: consensus state, the
/// durable log, the state machine and waiting proposals.
struct Core<S, M> {
    state: RaftState,
    storage: S,
    machine: M,
    pending: BTreeMap<Index, PendingProposal>,
    last_heartbeat: Instant,
    last_ack: HashMap<NodeId, Instant>,
}

#[derive(Clone, Copy)]
struct Transition {
    term: Term,
    voted_for: Option<NodeId>,
    role: NodeState,
}

impl Transition {
    fn of(state: &RaftState) -> Self {
        Self {
            term: state.current_term,
            voted_for: state.voted_for,
            role: state.state,
        }
    }
}

enum Outgoing {
    Append(AppendEntriesRequest),
    Snapshot(InstallSnapshotRequest),
}

impl<S, M> Core<S, M>
where
    S: Storage,
    M: StateMachine,
{
    fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.state.current_term,
            voted_for: self.state.voted_for,
            commit_index: self.state.commit_index,
        }
    }

    async fn persist_hard_state(&mut self) -> Result<(), RaftError> {
        let hard_state = self.hard_state();
        self.storage.set_hard_state(hard_state).await
    }

    fn status(&self) -> ConsensusStatus {
        ConsensusStatus {
            node_id: self.state.node_id,
            role: self.state.state,
            term: self.state.current_term,
            leader_id: self.state.leader_id,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.state.last_log_index(),
            cluster_size: self.state.cluster_size(),
        }
    }

    /// Feed newly committed entries to the state machine and release the
    /// proposals waiting on them.
    fn apply_committed(&mut self) -> bool {
        let mut applied = false;
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            match self.state.log.get(index) {
                Some(entry) => self.machine.apply(entry),
                None => {
                    error!("Committed entry {} missing from log", index);
                    break;
                }
            }
            self.state.last_applied = index;
            applied = true;
        }

        let rest = self.pending.split_off(&(self.state.last_applied + 1));
        let done = std::mem::replace(&mut self.pending, rest);
        for (index, proposal) in done {
            let result = if self.state.log.term_at(index) == Some(proposal.term) {
                Ok(index)
            } else {
                Err(RaftError::NotLeader {
                    leader_hint: self.state.leader_id,
                })
            };
            let _ = proposal.tx.send(result);
        }
        applied
    }

    fn fail_pending(&mut self, err: RaftError) {
        for (_, proposal) in std::mem::take(&mut self.pending) {
            let _ = proposal.tx.send(Err(err.clone()));
        }
    }
}

pub struct RaftNode<S, N, M> {
    id: NodeId,
    config: Arc<RaftConfig>,
    core: Arc<Mutex<Core<S, M>>>,
    network: Arc<N>,
    signals: Arc<HashMap<NodeId, Arc<Notify>>>,
    status_tx: Arc<watch::Sender<ConsensusStatus>>,
    running: Arc<AtomicBool>,
}

impl<S, N, M> Clone for RaftNode<S, N, M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            config: Arc::clone(&self.config),
            core: Arc::clone(&self.core),
            network: Arc::clone(&self.network),
            signals: Arc::clone(&self.signals),
            status_tx: Arc::clone(&self.status_tx),
            running: Arc::clone(&self.running),
        }
    }
}

impl<S, N, M> RaftNode<S, N, M>
where
    S: Storage,
    N: Network,
    M: StateMachine,
{
    pub fn new(node_id: NodeId, peers: Vec<NodeId>, config: RaftConfig, storage: S, network: N, machine: M) -> Self {
        let state = RaftState::new(node_id, peers);
        let signals = state
            .peers
            .iter()
            .map(|peer| (*peer, Arc::new(Notify::new())))
            .collect();

        let core = Core {
            state,
            storage,
            machine,
            pending: BTreeMap::new(),
            last_heartbeat: Instant::now(),
            last_ack: HashMap::new(),
        };
        let (status_tx, _) = watch::channel(core.status());

        Self {
            id: node_id,
            config: Arc::new(config),
            core: Arc::new(Mutex::new(core)),
            network: Arc::new(network),
            signals: Arc::new(signals),
            status_tx: Arc::new(status_tx),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub async fn start(&self) -> Result<(), RaftError> {
        info!("Starting Raft node {}", self.id);
        self.config.validate()?;

        // Load persisted state; corruption is fatal here.
        self.load_state().await?;
        self.running.store(true, Ordering::SeqCst);

        let node = self.clone();
        tokio::spawn(async move {
            node.run_election_timer().await;
        });

        Ok(())
    }

    /// Stop background loops and refuse further RPCs.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut core = self.core.lock().await;
        core.fail_pending(RaftError::Stopped);
        info!("Raft node {} stopped", self.id);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), RaftError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RaftError::Stopped)
        }
    }

    pub fn status(&self) -> ConsensusStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsensusStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_leader(&self) -> bool {
        self.status().role == NodeState::Leader
    }

    /// Run `f` against the applied state machine.
    pub async fn read<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        let core = self.core.lock().await;
        f(&core.machine)
    }

    /// Entries currently held in memory, after the snapshot boundary.
    pub async fn entries(&self) -> Vec<LogEntry> {
        let core = self.core.lock().await;
        let first = core.state.log.snapshot_index() + 1;
        core.state.log.entries_from(first, usize::MAX)
    }

    pub async fn snapshot_index(&self) -> Index {
        self.core.lock().await.state.log.snapshot_index()
    }

    fn publish(&self, core: &Core<S, M>) {
        let status = core.status();
        self.status_tx.send_if_modified(|current| {
            if *current != status {
                *current = status;
                true
            } else {
                false
            }
        });
    }

    fn signal_replication(&self) {
        for signal in self.signals.values() {
            signal.notify_one();
        }
    }

    async fn load_state(&self) -> Result<(), RaftError> {
        let mut core = self.core.lock().await;

        let hard_state = core.storage.get_hard_state().await?;
        let snapshot = core.storage.get_snapshot().await?;
        let entries = core.storage.get_log().await?;

        let (snapshot_index, snapshot_term) = match &snapshot {
            Some(snapshot) => {
                core.machine.restore(&snapshot.data)?;
                (snapshot.last_included_index, snapshot.last_included_term)
            }
            None => (0, 0),
        };

        let log = RaftLog::restore(snapshot_index, snapshot_term, entries);
        let mut expected = snapshot_index + 1;
        for entry in log.entries_from(snapshot_index + 1, usize::MAX) {
            if entry.index != expected {
                return Err(RaftError::Corruption(format!(
                    "log gap: expected index {}, found {}",
                    expected, entry.index
                )));
            }
            expected += 1;
        }

        core.state.current_term = hard_state.current_term;
        core.state.voted_for = hard_state.voted_for;
        core.state.commit_index = hard_state.commit_index.max(snapshot_index).min(log.last_index());
        core.state.last_applied = snapshot_index;
        core.state.log = log;
        core.last_heartbeat = Instant::now();
        core.apply_committed();

        info!(
            "Node {} recovered term {} with {} log entries, applied through {}",
            self.id,
            core.state.current_term,
            core.state.log.len(),
            core.state.last_applied
        );
        self.publish(&core);
        Ok(())
    }

    async fn run_election_timer(self) {
        while self.is_running() {
            let timeout = self.config.random_election_timeout();
            let deadline = {
                let core = self.core.lock().await;
                if core.state.is_leader() {
                    Instant::now() + self.config.max_election_timeout()
                } else {
                    core.last_heartbeat + timeout
                }
            };
            time::sleep_until(deadline).await;
            if !self.is_running() {
                break;
            }

            let result = {
                let mut core = self.core.lock().await;
                if core.state.is_leader() {
                    self.check_quorum(&mut core).await.map(|_| false)
                } else {
                    Ok(core.last_heartbeat + timeout <= Instant::now())
                }
            };

            match result {
                Ok(true) => {
                    if let Err(e) = self.start_election().await {
                        error!("Election failed on node {}: {}", self.id, e);
                    }
                }
                Ok(false) => {}
                Err(e) => error!("Leader check failed on node {}: {}", self.id, e),
            }
        }
        debug!("Election timer on node {} exited", self.id);
    }

    /// A leader that cannot hear from a majority steps down so clients stop
    /// sending it writes it can never commit.
    async fn check_quorum(&self, core: &mut Core<S, M>) -> Result<(), RaftError> {
        let window = self.config.max_election_timeout();
        let reachable = core
            .last_ack
            .values()
            .filter(|at| at.elapsed() < window)
            .count()
            + 1;
        if reachable >= core.state.quorum_size() {
            return Ok(());
        }

        warn!(
            "Leader {} reached only {} of {} nodes, stepping down",
            self.id,
            reachable,
            core.state.cluster_size()
        );
        let before = Transition::of(&core.state);
        let term = core.state.current_term;
        core.state.become_follower(term, None);
        self.after_transition(core, before).await
    }

    async fn start_election(&self) -> Result<(), RaftError> {
        let (request, peers) = {
            let mut core = self.core.lock().await;
            if core.state.is_leader() {
                return Ok(());
            }

            let before = Transition::of(&core.state);
            let request = core.state.become_candidate();
            core.last_heartbeat = Instant::now();
            info!("Node {} starting election for term {}", self.id, request.term);
            core.persist_hard_state().await?;

            if core.state.has_quorum() {
                core.state.become_leader();
                self.on_elected(&mut core).await?;
            }
            self.after_transition(&mut core, before).await?;
            (request, core.state.peers.clone())
        };

        for peer_id in peers {
            let node = self.clone();
            let request = request.clone();

            tokio::spawn(async move {
                let sent = time::timeout(node.config.rpc(), node.network.request_vote(peer_id, request)).await;
                match sent {
                    Ok(Ok(resp)) => {
                        if let Err(e) = node.handle_vote_response(peer_id, resp).await {
                            error!("Failed to handle vote from {}: {}", peer_id, e);
                        }
                    }
                    Ok(Err(e)) => debug!("Vote request to {} failed: {}", peer_id, e),
                    Err(_) => debug!("Vote request to {} timed out", peer_id),
                }
            });
        }

        Ok(())
    }

    async fn handle_vote_response(&self, from: NodeId, resp: VoteResponse) -> Result<(), RaftError> {
        let mut core = self.core.lock().await;
        let before = Transition::of(&core.state);

        if core.state.handle_vote_response(from, &resp) == VoteOutcome::Elected {
            info!("Node {} elected leader for term {}", self.id, core.state.current_term);
            self.on_elected(&mut core).await?;
        }

        self.after_transition(&mut core, before).await
    }

    /// New leader: append a no-op for its term (so earlier entries can
    /// commit) and start one replication task per peer.
    async fn on_elected(&self, core: &mut Core<S, M>) -> Result<(), RaftError> {
        let term = core.state.current_term;
        let entry = LogEntry::noop(core.state.last_log_index() + 1, term);
        core.storage.append_log(std::slice::from_ref(&entry)).await?;
        core.state.log.append(entry);

        let now = Instant::now();
        core.last_ack = core.state.peers.iter().map(|peer| (*peer, now)).collect();

        for peer_id in core.state.peers.clone() {
            let node = self.clone();
            tokio::spawn(async move {
                node.run_replicator(peer_id, term).await;
            });
        }

        if core.state.advance_commit_index() {
            self.apply_and_persist(core).await?;
        }
        Ok(())
    }

    /// Persist and report whatever changed between `before` and now. Losing
    /// leadership fails every waiting proposal.
    async fn after_transition(&self, core: &mut Core<S, M>, before: Transition) -> Result<(), RaftError> {
        let after = Transition::of(&core.state);

        if after.term != before.term || after.voted_for != before.voted_for {
            core.persist_hard_state().await?;
        }
        if after.term > before.term {
            debug!("Node {} moved from term {} to {}", self.id, before.term, after.term);
        }
        if before.role == NodeState::Leader && after.role != NodeState::Leader {
            info!("Node {} stepping down in term {}", self.id, after.term);
            let leader_hint = core.state.leader_id;
            core.fail_pending(RaftError::NotLeader { leader_hint });
            core.last_heartbeat = Instant::now();
        }

        self.publish(core);
        Ok(())
    }

    async fn apply_and_persist(&self, core: &mut Core<S, M>) -> Result<(), RaftError> {
        if core.apply_committed() {
            core.persist_hard_state().await?;
            self.maybe_snapshot(core).await?;
        }
        self.publish(core);
        Ok(())
    }

    async fn maybe_snapshot(&self, core: &mut Core<S, M>) -> Result<(), RaftError> {
        let applied = core.state.last_applied;
        if applied - core.state.log.snapshot_index() < self.config.snapshot_threshold {
            return Ok(());
        }

        let term = core
            .state
            .log
            .term_at(applied)
            .ok_or_else(|| RaftError::Storage(format!("no term for applied index {}", applied)))?;
        let snapshot = Snapshot {
            last_included_index: applied,
            last_included_term: term,
            data: core.machine.snapshot()?,
        };
        core.storage.save_snapshot(&snapshot).await?;
        core.state.log.compact_to(applied, term);

        info!("Node {} compacted log through index {}", self.id, applied);
        Ok(())
    }

    async fn run_replicator(self, peer_id: NodeId, term: Term) {
        let signal = match self.signals.get(&peer_id) {
            Some(signal) => Arc::clone(signal),
            None => return,
        };
        debug!("Replicating to {} for term {}", peer_id, term);

        while self.is_running() {
            let send_again = match self.replicate_once(peer_id, term).await {
                Ok(Some(more)) => more,
                Ok(None) => break,
                Err(e) => {
                    debug!("Replication to {} failed: {}", peer_id, e);
                    false
                }
            };
            if send_again {
                continue;
            }

            tokio::select! {
                _ = signal.notified() => {}
                _ = time::sleep(self.config.heartbeat()) => {}
            }
        }
        debug!("Replicator for {} in term {} exited", peer_id, term);
    }

    /// One round trip to a follower. `Ok(None)` means this node is no longer
    /// leader for `term`; `Ok(Some(true))` asks for an immediate resend.
    async fn replicate_once(&self, peer_id: NodeId, term: Term) -> Result<Option<bool>, RaftError> {
        let outgoing = {
            let core = self.core.lock().await;
            if !core.state.is_leader() || core.state.current_term != term {
                return Ok(None);
            }
            match core.state.replication_request(peer_id, self.config.max_entries_per_append) {
                ReplicationRequest::Append(req) => Outgoing::Append(req),
                ReplicationRequest::Snapshot => {
                    let snapshot = core
                        .storage
                        .get_snapshot()
                        .await?
                        .ok_or_else(|| RaftError::Storage("log compacted without a snapshot".into()))?;
                    Outgoing::Snapshot(InstallSnapshotRequest {
                        term,
                        leader_id: self.id,
                        last_included_index: snapshot.last_included_index,
                        last_included_term: snapshot.last_included_term,
                        data: snapshot.data,
                    })
                }
            }
        };

        match outgoing {
            Outgoing::Append(req) => {
                let resp = time::timeout(self.config.rpc(), self.network.append_entries(peer_id, req))
                    .await
                    .map_err(|_| RaftError::Network(format!("append to {} timed out", peer_id)))??;

                let mut core = self.core.lock().await;
                let before = Transition::of(&core.state);
                core.last_ack.insert(peer_id, Instant::now());

                let more = match core.state.handle_append_response(peer_id, &resp) {
                    ReplicationOutcome::Accepted { committed } => {
                        if committed {
                            self.apply_and_persist(&mut core).await?;
                        }
                        let matched = core.state.match_index.get(&peer_id).copied().unwrap_or(0);
                        matched < core.state.last_log_index()
                    }
                    ReplicationOutcome::Backtrack => {
                        debug!("Follower {} rejected append, backing up", peer_id);
                        true
                    }
                    ReplicationOutcome::SteppedDown | ReplicationOutcome::Ignored => false,
                };

                self.after_transition(&mut core, before).await?;
                Ok(Some(more))
            }
            Outgoing::Snapshot(req) => {
                let last_included_index = req.last_included_index;
                info!("Sending snapshot through {} to {}", last_included_index, peer_id);
                let resp = time::timeout(self.config.rpc() * 10, self.network.install_snapshot(peer_id, req))
                    .await
                    .map_err(|_| RaftError::Network(format!("snapshot to {} timed out", peer_id)))??;

                let mut core = self.core.lock().await;
                let before = Transition::of(&core.state);
                core.last_ack.insert(peer_id, Instant::now());

                if resp.term > core.state.current_term {
                    core.state.become_follower(resp.term, None);
                } else if core.state.is_leader() && core.state.current_term == term {
                    core.state.snapshot_installed(peer_id, last_included_index);
                }

                self.after_transition(&mut core, before).await?;
                Ok(Some(true))
            }
        }
    }

    /// Append an entry as leader and wait until a majority stores it and it
    /// has been applied locally.
    ///
    /// A `NotLeader` error after the entry was appended means the outcome is
    /// unknown: a later leader may still commit it.
    pub async fn propose(&self, kind: EntryKind, payload: Vec<u8>) -> Result<Index, RaftError> {
        self.ensure_running()?;

        let (index, rx) = {
            let mut core = self.core.lock().await;
            if !core.state.is_leader() {
                return Err(RaftError::NotLeader {
                    leader_hint: core.state.leader_id,
                });
            }

            let index = core.state.last_log_index() + 1;
            let term = core.state.current_term;
            let entry = LogEntry::new(index, term, kind, payload);
            core.storage.append_log(std::slice::from_ref(&entry)).await?;
            core.state.log.append(entry);

            let (tx, rx) = oneshot::channel();
            core.pending.insert(index, PendingProposal { term, tx });

            if core.state.advance_commit_index() {
                self.apply_and_persist(&mut core).await?;
            }
            self.publish(&core);
            (index, rx)
        };

        self.signal_replication();

        match time::timeout(self.config.propose(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::NotLeader { leader_hint: None }),
            Err(_) => {
                self.core.lock().await.pending.remove(&index);
                warn!("Proposal {} timed out waiting for a majority", index);
                Err(RaftError::QuorumUnavailable {
                    retry_after: self.config.max_election_timeout(),
                })
            }
        }
    }
}

#[async_trait]
impl<S, N, M> RaftService for RaftNode<S, N, M>
where
    S: Storage,
    N: Network,
    M: StateMachine,
{
    async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.ensure_running()?;
        let mut core = self.core.lock().await;
        let before = Transition::of(&core.state);

        let resp = core.state.handle_vote_request(&req);
        if resp.vote_granted {
            core.last_heartbeat = Instant::now();
            debug!("Node {} voted for {} in term {}", self.id, req.candidate_id, req.term);
        }

        self.after_transition(&mut core, before).await?;
        Ok(resp)
    }

    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        self.ensure_running()?;
        let mut core = self.core.lock().await;
        let before = Transition::of(&core.state);

        let result = core.state.handle_append_entries(req);
        if result.from_current_leader {
            core.last_heartbeat = Instant::now();
        }
        if let Some(from_index) = result.truncated_from {
            core.storage.truncate_log(from_index).await?;
        }
        if !result.appended.is_empty() {
            core.storage.append_log(&result.appended).await?;
        }

        self.after_transition(&mut core, before).await?;
        self.apply_and_persist(&mut core).await?;
        Ok(result.response)
    }

    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        self.ensure_running()?;
        let mut core = self.core.lock().await;
        let before = Transition::of(&core.state);

        if req.term < core.state.current_term {
            return Ok(InstallSnapshotResponse {
                term: core.state.current_term,
            });
        }

        core.state.become_follower(req.term, Some(req.leader_id));
        core.last_heartbeat = Instant::now();

        if req.last_included_index > core.state.commit_index {
            let keeps_suffix = core.state.log.term_at(req.last_included_index) == Some(req.last_included_term);
            let snapshot = Snapshot {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                data: req.data.clone(),
            };
            // The machine never runs ahead of what a restart recovers.
            core.storage.save_snapshot(&snapshot).await?;
            if !keeps_suffix {
                core.storage.truncate_log(req.last_included_index + 1).await?;
            }
            core.machine.restore(&req.data)?;
            core.state.accept_snapshot(&req);
            core.persist_hard_state().await?;
            info!("Node {} installed snapshot through {}", self.id, req.last_included_index);
        }

        self.after_transition(&mut core, before).await?;
        Ok(InstallSnapshotResponse {
            term: core.state.current_term,
        })
    }
}
