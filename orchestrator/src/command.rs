use crate::error::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{AgentId, AgentStatus, ClusterSettings, EntryKind, TaskId, TaskResult, WorkflowSpec};
use std::collections::BTreeSet;

/// Payload of a replicated log entry.
///
/// Commands carry every input the state machine needs, including the
/// leader's wall clock at proposal time, so applying them is deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    RegisterAgent {
        agent_id: AgentId,
        endpoint: String,
        capabilities: BTreeSet<String>,
        at: DateTime<Utc>,
    },
    SetAgentStatus {
        agent_id: AgentId,
        status: AgentStatus,
        at: DateTime<Utc>,
    },
    DeregisterAgent {
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    SubmitWorkflow {
        spec: WorkflowSpec,
        at: DateTime<Utc>,
    },
    AssignTask {
        task_id: TaskId,
        agent_id: AgentId,
        /// Set when the task moves between agents during rebalancing.
        previous: Option<AgentId>,
        at: DateTime<Utc>,
    },
    StartTask {
        task_id: TaskId,
        agent_id: AgentId,
        at: DateTime<Utc>,
    },
    CompleteTask {
        result: TaskResult,
        at: DateTime<Utc>,
    },
    UpdateSettings {
        settings: ClusterSettings,
    },
}

impl Command {
    pub fn kind(&self) -> EntryKind {
        match self {
            Command::RegisterAgent { .. } | Command::SetAgentStatus { .. } | Command::DeregisterAgent { .. } => {
                EntryKind::Membership
            }
            Command::SubmitWorkflow { .. }
            | Command::AssignTask { .. }
            | Command::StartTask { .. }
            | Command::CompleteTask { .. } => EntryKind::TaskAssignment,
            Command::UpdateSettings { .. } => EntryKind::Configuration,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, OrchestratorError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, OrchestratorError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
