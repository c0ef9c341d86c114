use shared::types::{Index, NodeId, Term};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("Not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("Quorum unavailable, retry after {retry_after:?}")]
    QuorumUnavailable { retry_after: Duration },

    #[error("Stale term {term}, observed {observed}")]
    StaleTerm { term: Term, observed: Term },

    #[error("Log inconsistency at index {index}")]
    LogInconsistency { index: Index },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Log corruption: {0}")]
    Corruption(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Node stopped")]
    Stopped,
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RaftError {
    fn from(err: serde_json::Error) -> Self {
        RaftError::Serialization(err.to_string())
    }
}
