use serde::{Deserialize, Serialize};
use crate::types::{AgentId, AgentStatus, Index, TaskId, TaskStatus, WorkflowId, WorkflowStatus};

/// State change produced by applying a committed log entry. Every node emits
/// the same sequence of decisions for the same log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Decision {
    AgentRegistered { index: Index, agent_id: AgentId },
    AgentStatusChanged { index: Index, agent_id: AgentId, from: AgentStatus, to: AgentStatus },
    AgentRemoved { index: Index, agent_id: AgentId },
    WorkflowAccepted { index: Index, workflow_id: WorkflowId },
    WorkflowFinished { index: Index, workflow_id: WorkflowId, status: WorkflowStatus },
    TaskAssigned { index: Index, task_id: TaskId, agent_id: AgentId, previous: Option<AgentId> },
    TaskStarted { index: Index, task_id: TaskId, agent_id: AgentId },
    TaskRequeued { index: Index, task_id: TaskId, from: AgentId },
    TaskFinished { index: Index, task_id: TaskId, status: TaskStatus },
    SettingsUpdated { index: Index },
}

impl Decision {
    pub fn index(&self) -> Index {
        match self {
            Decision::AgentRegistered { index, .. }
            | Decision::AgentStatusChanged { index, .. }
            | Decision::AgentRemoved { index, .. }
            | Decision::WorkflowAccepted { index, .. }
            | Decision::WorkflowFinished { index, .. }
            | Decision::TaskAssigned { index, .. }
            | Decision::TaskStarted { index, .. }
            | Decision::TaskRequeued { index, .. }
            | Decision::TaskFinished { index, .. }
            | Decision::SettingsUpdated { index } => *index,
        }
    }
}
