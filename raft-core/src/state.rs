use crate::log::RaftLog;
use serde::{Deserialize, Serialize};
use shared::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, VoteRequest, VoteResponse,
};
use shared::types::{Index, LogEntry, NodeId, Term};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

/// Outcome of feeding a vote response to a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Pending,
    Elected,
    SteppedDown,
    Ignored,
}

/// Outcome of feeding an append response to a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// Peer accepted; `committed` tells whether the commit index moved.
    Accepted { committed: bool },
    /// Peer rejected on log matching; `next_index` was moved back.
    Backtrack,
    SteppedDown,
    Ignored,
}

/// Log mutations a follower must persist before answering `AppendEntries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendResult {
    pub response: AppendEntriesResponse,
    pub truncated_from: Option<Index>,
    pub appended: Vec<LogEntry>,
    /// The sender is a legitimate leader for our term.
    pub from_current_leader: bool,
}

/// What the leader should send to a peer next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationRequest {
    Append(AppendEntriesRequest),
    /// The peer needs entries at or below this snapshot boundary.
    Snapshot,
}

/// Per-node consensus state. Everything here is mutated only by the methods
/// below, which the node calls while holding its single state lock.
pub struct RaftState {
    pub node_id: NodeId,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub log: RaftLog,
    pub commit_index: Index,
    pub last_applied: Index,
    pub state: NodeState,
    pub peers: Vec<NodeId>,
    pub leader_id: Option<NodeId>,
    pub votes_received: BTreeSet<NodeId>,

    // Leader state
    pub next_index: HashMap<NodeId, Index>,
    pub match_index: HashMap<NodeId, Index>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != node_id).collect();
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();

        for peer_id in &peers {
            next_index.insert(*peer_id, 1);
            match_index.insert(*peer_id, 0);
        }

        Self {
            node_id,
            current_term: 0,
            voted_for: None,
            log: RaftLog::new(),
            commit_index: 0,
            last_applied: 0,
            state: NodeState::Follower,
            peers,
            leader_id: None,
            votes_received: BTreeSet::new(),
            next_index,
            match_index,
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn quorum_size(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn last_log_index(&self) -> Index {
        self.log.last_index()
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    /// Step down (or stay) as follower. Moving to a higher term clears the vote.
    pub fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.leader_id = leader;
        self.votes_received.clear();
    }

    pub fn become_candidate(&mut self) -> VoteRequest {
        self.current_term += 1;
        self.state = NodeState::Candidate;
        self.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.votes_received.clear();
        self.votes_received.insert(self.node_id);

        VoteRequest {
            term: self.current_term,
            candidate_id: self.node_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        let last_index = self.last_log_index();

        for peer_id in &self.peers {
            self.next_index.insert(*peer_id, last_index + 1);
            self.match_index.insert(*peer_id, 0);
        }
    }

    /// Raft's up-to-date check: later last term wins, then longer log.
    pub fn is_log_up_to_date(&self, last_log_index: Index, last_log_term: Term) -> bool {
        last_log_term > self.last_log_term()
            || (last_log_term == self.last_log_term() && last_log_index >= self.last_log_index())
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if req.term < self.current_term {
            return VoteResponse {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if req.term > self.current_term {
            self.become_follower(req.term, None);
        }

        let vote_granted = (self.voted_for.is_none() || self.voted_for == Some(req.candidate_id))
            && self.is_log_up_to_date(req.last_log_index, req.last_log_term);

        if vote_granted {
            self.voted_for = Some(req.candidate_id);
        }

        VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    pub fn handle_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> VoteOutcome {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return VoteOutcome::SteppedDown;
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            return VoteOutcome::Ignored;
        }
        if resp.vote_granted {
            self.votes_received.insert(from);
        }
        if self.has_quorum() {
            self.become_leader();
            VoteOutcome::Elected
        } else {
            VoteOutcome::Pending
        }
    }

    pub fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendResult {
        if req.term < self.current_term {
            return AppendResult {
                response: self.append_response(false, 0, None),
                truncated_from: None,
                appended: Vec::new(),
                from_current_leader: false,
            };
        }

        self.become_follower(req.term, Some(req.leader_id));

        // Log matching on the entry preceding the batch. Anything at or below
        // the snapshot boundary is committed and therefore matches.
        if req.prev_log_index > self.log.last_index() {
            let hint = self.log.last_index() + 1;
            return self.reject(hint);
        }
        if req.prev_log_index > self.log.snapshot_index() {
            match self.log.term_at(req.prev_log_index) {
                Some(term) if term == req.prev_log_term => {}
                Some(term) => {
                    let hint = self.log.first_index_of_term(term, req.prev_log_index);
                    return self.reject(hint);
                }
                None => {
                    let hint = self.log.last_index() + 1;
                    return self.reject(hint);
                }
            }
        }

        let last_new_index = req.prev_log_index + req.entries.len() as Index;
        let mut truncated_from = None;
        let mut appended = Vec::new();

        for entry in req.entries {
            if entry.index <= self.log.snapshot_index() {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    if entry.index <= self.commit_index {
                        error!(
                            index = entry.index,
                            commit_index = self.commit_index,
                            "leader tried to overwrite a committed entry"
                        );
                        return self.reject(self.commit_index + 1);
                    }
                    debug!(from = entry.index, "truncating conflicting log suffix");
                    self.log.truncate_from(entry.index);
                    truncated_from = Some(entry.index);
                    appended.push(entry.clone());
                    self.log.append(entry);
                }
                None => {
                    appended.push(entry.clone());
                    self.log.append(entry);
                }
            }
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(last_new_index).max(self.commit_index);
        }

        AppendResult {
            response: self.append_response(true, last_new_index, None),
            truncated_from,
            appended,
            from_current_leader: true,
        }
    }

    fn reject(&self, conflict_index: Index) -> AppendResult {
        AppendResult {
            response: self.append_response(false, 0, Some(conflict_index.max(1))),
            truncated_from: None,
            appended: Vec::new(),
            from_current_leader: true,
        }
    }

    fn append_response(&self, success: bool, match_index: Index, conflict_index: Option<Index>) -> AppendEntriesResponse {
        AppendEntriesResponse {
            term: self.current_term,
            success,
            match_index,
            conflict_index,
        }
    }

    pub fn handle_append_response(&mut self, from: NodeId, resp: &AppendEntriesResponse) -> ReplicationOutcome {
        if resp.term > self.current_term {
            self.become_follower(resp.term, None);
            return ReplicationOutcome::SteppedDown;
        }
        if !self.is_leader() || resp.term != self.current_term {
            return ReplicationOutcome::Ignored;
        }

        if resp.success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(resp.match_index);
            let next = *matched + 1;
            self.next_index.insert(from, next);
            ReplicationOutcome::Accepted {
                committed: self.advance_commit_index(),
            }
        } else {
            let current = self.next_index.get(&from).copied().unwrap_or(1);
            let next = resp
                .conflict_index
                .unwrap_or_else(|| current.saturating_sub(1))
                .min(current.saturating_sub(1).max(1))
                .max(1);
            self.next_index.insert(from, next);
            ReplicationOutcome::Backtrack
        }
    }

    /// Move the commit index to the highest index stored on a majority, but
    /// only when that entry belongs to the current term.
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }

        let mut matched: Vec<Index> = self
            .peers
            .iter()
            .map(|p| self.match_index.get(p).copied().unwrap_or(0))
            .collect();
        matched.push(self.last_log_index());
        matched.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = matched[self.quorum_size() - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            true
        } else {
            false
        }
    }

    pub fn replication_request(&self, peer: NodeId, max_entries: usize) -> ReplicationRequest {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.last_log_index() + 1)
            .max(1);

        let prev_log_index = next - 1;
        let prev_log_term = match self.log.term_at(prev_log_index) {
            Some(term) => term,
            None => return ReplicationRequest::Snapshot,
        };

        ReplicationRequest::Append(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.node_id,
            prev_log_index,
            prev_log_term,
            entries: self.log.entries_from(next, max_entries),
            leader_commit: self.commit_index,
        })
    }

    /// Accept a snapshot boundary from the leader. Returns false when the
    /// snapshot is stale and the caller should not restore it.
    pub fn accept_snapshot(&mut self, req: &InstallSnapshotRequest) -> bool {
        if req.last_included_index <= self.commit_index {
            return false;
        }
        if self.log.term_at(req.last_included_index) == Some(req.last_included_term) {
            self.log.compact_to(req.last_included_index, req.last_included_term);
        } else {
            self.log.reset_to_snapshot(req.last_included_index, req.last_included_term);
        }
        self.commit_index = req.last_included_index;
        self.last_applied = req.last_included_index;
        true
    }

    pub fn snapshot_installed(&mut self, peer: NodeId, last_included_index: Index) {
        let matched = self.match_index.entry(peer).or_insert(0);
        *matched = (*matched).max(last_included_index);
        let next = *matched + 1;
        self.next_index.insert(peer, next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::EntryKind;

    fn entry(index: Index, term: Term) -> LogEntry {
        LogEntry::new(index, term, EntryKind::TaskAssignment, vec![index as u8])
    }

    fn node_with_log(id: NodeId, terms: &[Term]) -> RaftState {
        let mut state = RaftState::new(id, vec![1, 2, 3]);
        for (i, term) in terms.iter().enumerate() {
            state.log.append(entry(i as Index + 1, *term));
        }
        state.current_term = terms.last().copied().unwrap_or(0);
        state
    }

    fn append_req(term: Term, prev: Index, prev_term: Term, entries: Vec<LogEntry>, commit: Index) -> AppendEntriesRequest {
        AppendEntriesRequest {
            term,
            leader_id: 1,
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: commit,
        }
    }

    #[test]
    fn new_node_starts_as_follower() {
        let state = RaftState::new(1, vec![1, 2, 3]);
        assert_eq!(state.state, NodeState::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.peers, vec![2, 3]);
        assert_eq!(state.quorum_size(), 2);
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(RaftState::new(1, vec![1]).quorum_size(), 1);
        assert_eq!(RaftState::new(1, vec![1, 2, 3, 4, 5]).quorum_size(), 3);
        assert_eq!(RaftState::new(1, vec![1, 2, 3, 4]).quorum_size(), 3);
    }

    #[test]
    fn candidate_votes_for_itself() {
        let mut state = RaftState::new(1, vec![1, 2, 3]);
        let req = state.become_candidate();
        assert_eq!(req.term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.state, NodeState::Candidate);
        assert!(state.votes_received.contains(&1));
    }

    #[test]
    fn grants_one_vote_per_term() {
        let mut voter = RaftState::new(3, vec![1, 2, 3]);
        let first = voter.handle_vote_request(&VoteRequest { term: 1, candidate_id: 1, last_log_index: 0, last_log_term: 0 });
        assert!(first.vote_granted);

        let second = voter.handle_vote_request(&VoteRequest { term: 1, candidate_id: 2, last_log_index: 0, last_log_term: 0 });
        assert!(!second.vote_granted);

        // Repeating the request from the same candidate is idempotent.
        let repeat = voter.handle_vote_request(&VoteRequest { term: 1, candidate_id: 1, last_log_index: 0, last_log_term: 0 });
        assert!(repeat.vote_granted);
    }

    #[test]
    fn rejects_stale_term_vote() {
        let mut voter = RaftState::new(3, vec![1, 2, 3]);
        voter.current_term = 5;
        let resp = voter.handle_vote_request(&VoteRequest { term: 4, candidate_id: 1, last_log_index: 10, last_log_term: 4 });
        assert!(!resp.vote_granted);
        assert_eq!(resp.term, 5);
    }

    #[test]
    fn denies_vote_to_less_up_to_date_log() {
        let mut voter = node_with_log(3, &[1, 2, 2]);
        // Higher index but older last term loses.
        let resp = voter.handle_vote_request(&VoteRequest { term: 3, candidate_id: 1, last_log_index: 5, last_log_term: 1 });
        assert!(!resp.vote_granted);
        // Same last term but shorter log loses.
        let resp = voter.handle_vote_request(&VoteRequest { term: 3, candidate_id: 1, last_log_index: 2, last_log_term: 2 });
        assert!(!resp.vote_granted);
        // Newer last term wins even with a shorter log.
        let resp = voter.handle_vote_request(&VoteRequest { term: 3, candidate_id: 1, last_log_index: 1, last_log_term: 3 });
        assert!(resp.vote_granted);
        assert_eq!(voter.current_term, 3);
    }

    #[test]
    fn candidate_elected_with_majority() {
        let mut state = RaftState::new(1, vec![1, 2, 3]);
        state.become_candidate();
        let outcome = state.handle_vote_response(2, &VoteResponse { term: 1, vote_granted: true });
        assert_eq!(outcome, VoteOutcome::Elected);
        assert!(state.is_leader());
        assert_eq!(state.leader_id, Some(1));
    }

    #[test]
    fn candidate_steps_down_on_higher_term() {
        let mut state = RaftState::new(1, vec![1, 2, 3]);
        state.become_candidate();
        let outcome = state.handle_vote_response(2, &VoteResponse { term: 4, vote_granted: false });
        assert_eq!(outcome, VoteOutcome::SteppedDown);
        assert_eq!(state.state, NodeState::Follower);
        assert_eq!(state.current_term, 4);
        assert_eq!(state.voted_for, None);
    }

    #[test]
    fn late_vote_ignored_after_election() {
        let mut state = RaftState::new(1, vec![1, 2, 3, 4, 5]);
        state.become_candidate();
        state.handle_vote_response(2, &VoteResponse { term: 1, vote_granted: true });
        assert_eq!(state.handle_vote_response(3, &VoteResponse { term: 1, vote_granted: true }), VoteOutcome::Elected);
        assert_eq!(state.handle_vote_response(4, &VoteResponse { term: 1, vote_granted: true }), VoteOutcome::Ignored);
    }

    #[test]
    fn append_rejects_stale_leader() {
        let mut follower = node_with_log(2, &[1, 2]);
        let result = follower.handle_append_entries(append_req(1, 0, 0, vec![], 0));
        assert!(!result.response.success);
        assert!(!result.from_current_leader);
        assert_eq!(result.response.term, 2);
    }

    #[test]
    fn append_rejects_missing_prev_entry() {
        let mut follower = node_with_log(2, &[1]);
        let result = follower.handle_append_entries(append_req(1, 3, 1, vec![entry(4, 1)], 0));
        assert!(!result.response.success);
        assert_eq!(result.response.conflict_index, Some(2));
    }

    #[test]
    fn append_rejects_term_mismatch_with_hint() {
        let mut follower = node_with_log(2, &[1, 2, 2]);
        let result = follower.handle_append_entries(append_req(3, 3, 3, vec![], 0));
        assert!(!result.response.success);
        assert_eq!(result.response.conflict_index, Some(2));
    }

    #[test]
    fn append_truncates_conflicting_suffix() {
        let mut follower = node_with_log(2, &[1, 1, 2, 2]);
        let result = follower.handle_append_entries(append_req(3, 2, 1, vec![entry(3, 3)], 0));
        assert!(result.response.success);
        assert_eq!(result.truncated_from, Some(3));
        assert_eq!(result.appended, vec![entry(3, 3)]);
        assert_eq!(follower.log.last_index(), 3);
        assert_eq!(follower.log.last_term(), 3);
    }

    #[test]
    fn append_is_idempotent_for_duplicates() {
        let mut follower = node_with_log(2, &[1, 1]);
        let result = follower.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1), entry(2, 1)], 0));
        assert!(result.response.success);
        assert!(result.appended.is_empty());
        assert_eq!(result.truncated_from, None);
        assert_eq!(result.response.match_index, 2);
    }

    #[test]
    fn stale_retransmission_does_not_drop_newer_entries() {
        let mut follower = node_with_log(2, &[1, 1, 1]);
        let result = follower.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1)], 0));
        assert!(result.response.success);
        assert_eq!(follower.log.last_index(), 3);
    }

    #[test]
    fn follower_commit_bounded_by_new_entries() {
        let mut follower = RaftState::new(2, vec![1, 2, 3]);
        let result = follower.handle_append_entries(append_req(1, 0, 0, vec![entry(1, 1)], 5));
        assert!(result.response.success);
        assert_eq!(follower.commit_index, 1);
    }

    #[test]
    fn leader_commits_only_current_term_entries() {
        let mut leader = node_with_log(1, &[1, 1]);
        leader.current_term = 2;
        leader.state = NodeState::Leader;
        leader.become_leader();

        // Majority holds index 2, but it is from term 1.
        leader.match_index.insert(2, 2);
        assert!(!leader.advance_commit_index());
        assert_eq!(leader.commit_index, 0);

        leader.log.append(entry(3, 2));
        leader.match_index.insert(2, 3);
        assert!(leader.advance_commit_index());
        assert_eq!(leader.commit_index, 3);
    }

    #[test]
    fn leader_backtracks_on_rejection() {
        let mut leader = node_with_log(1, &[1, 1, 1]);
        leader.become_leader();
        assert_eq!(leader.next_index[&2], 4);

        let resp = AppendEntriesResponse { term: 1, success: false, match_index: 0, conflict_index: Some(2) };
        assert_eq!(leader.handle_append_response(2, &resp), ReplicationOutcome::Backtrack);
        assert_eq!(leader.next_index[&2], 2);

        let resp = AppendEntriesResponse { term: 1, success: false, match_index: 0, conflict_index: None };
        leader.handle_append_response(2, &resp);
        assert_eq!(leader.next_index[&2], 1);
    }

    #[test]
    fn leader_steps_down_on_higher_term_response() {
        let mut leader = node_with_log(1, &[1]);
        leader.become_leader();
        let resp = AppendEntriesResponse { term: 7, success: false, match_index: 0, conflict_index: None };
        assert_eq!(leader.handle_append_response(2, &resp), ReplicationOutcome::SteppedDown);
        assert_eq!(leader.state, NodeState::Follower);
        assert_eq!(leader.current_term, 7);
    }

    #[test]
    fn replication_request_falls_back_to_snapshot() {
        let mut leader = node_with_log(1, &[1, 1, 1, 1]);
        leader.log.compact_to(3, 1);
        leader.become_leader();
        leader.next_index.insert(2, 2);
        assert_eq!(leader.replication_request(2, 10), ReplicationRequest::Snapshot);

        leader.next_index.insert(2, 4);
        match leader.replication_request(2, 10) {
            ReplicationRequest::Append(req) => {
                assert_eq!(req.prev_log_index, 3);
                assert_eq!(req.prev_log_term, 1);
                assert_eq!(req.entries.len(), 1);
            }
            other => panic!("expected append, got {:?}", other),
        }
    }
}
