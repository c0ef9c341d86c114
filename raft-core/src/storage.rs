use async_trait::async_trait;
use crate::error::RaftError;
use serde::{Deserialize, Serialize};
use shared::types::{Index, LogEntry, NodeId, Term};

/// State that must survive a restart before a node answers any RPC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    pub commit_index: Index,
}

/// Compacted state-machine image plus the log position it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_included_index: Index,
    pub last_included_term: Term,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn get_hard_state(&self) -> Result<HardState, RaftError>;
    async fn set_hard_state(&mut self, state: HardState) -> Result<(), RaftError>;

    async fn get_log(&self) -> Result<Vec<LogEntry>, RaftError>;
    async fn append_log(&mut self, entries: &[LogEntry]) -> Result<(), RaftError>;
    /// Remove every entry at or after `from_index`.
    async fn truncate_log(&mut self, from_index: Index) -> Result<(), RaftError>;

    async fn get_snapshot(&self) -> Result<Option<Snapshot>, RaftError>;
    /// Persist the snapshot and drop log entries it covers.
    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), RaftError>;
}

#[derive(Debug, Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_hard_state(&self) -> Result<HardState, RaftError> {
        Ok(self.hard_state)
    }

    async fn set_hard_state(&mut self, state: HardState) -> Result<(), RaftError> {
        self.hard_state = state;
        Ok(())
    }

    async fn get_log(&self) -> Result<Vec<LogEntry>, RaftError> {
        Ok(self.log.clone())
    }

    async fn append_log(&mut self, entries: &[LogEntry]) -> Result<(), RaftError> {
        self.log.extend_from_slice(entries);
        Ok(())
    }

    async fn truncate_log(&mut self, from_index: Index) -> Result<(), RaftError> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    async fn get_snapshot(&self) -> Result<Option<Snapshot>, RaftError> {
        Ok(self.snapshot.clone())
    }

    async fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), RaftError> {
        self.log.retain(|e| e.index > snapshot.last_included_index);
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
