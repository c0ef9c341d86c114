use raft_core::RaftError;
use shared::types::{AgentId, NodeId, TaskId, WorkflowId};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("Not leader (leader hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    #[error("Quorum unavailable, retry after {retry_after:?}")]
    QuorumUnavailable { retry_after: Duration },

    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("Agent {agent_id} unreachable for {silent_for:?}")]
    AgentUnreachable { agent_id: AgentId, silent_for: Duration },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(WorkflowId),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Consensus error: {0}")]
    Consensus(RaftError),
}

impl From<RaftError> for OrchestratorError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_hint } => OrchestratorError::NotLeader { leader_hint },
            RaftError::QuorumUnavailable { retry_after } => OrchestratorError::QuorumUnavailable { retry_after },
            other => OrchestratorError::Consensus(other),
        }
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leadership_errors_keep_their_shape() {
        let err: OrchestratorError = RaftError::NotLeader { leader_hint: Some(3) }.into();
        assert_eq!(err, OrchestratorError::NotLeader { leader_hint: Some(3) });

        let err: OrchestratorError = RaftError::QuorumUnavailable { retry_after: Duration::from_millis(300) }.into();
        assert!(matches!(err, OrchestratorError::QuorumUnavailable { .. }));

        let err: OrchestratorError = RaftError::Stopped.into();
        assert_eq!(err, OrchestratorError::Consensus(RaftError::Stopped));
    }
}
