use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

pub type NodeId = u64;
pub type Term = u64;
pub type Index = u64;
pub type AgentId = Uuid;
pub type TaskId = String;
pub type WorkflowId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Membership,
    TaskAssignment,
    Heartbeat,
    Configuration,
}

/// One record of the replicated log. Whether it is committed is derived from
/// the node's commit index and never stored on the entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: Index, term: Term, kind: EntryKind, payload: Vec<u8>) -> Self {
        Self { index, term, kind, payload }
    }

    pub fn noop(index: Index, term: Term) -> Self {
        Self::new(index, term, EntryKind::Heartbeat, Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    Alive,
    Suspected,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: AgentId,
    pub endpoint: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_load: u32,
    pub registered_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub excluded_until: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(
        id: AgentId,
        endpoint: String,
        capabilities: BTreeSet<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            endpoint,
            capabilities,
            status: AgentStatus::Alive,
            last_heartbeat: at,
            current_load: 0,
            registered_at: at,
            status_changed_at: at,
            consecutive_failures: 0,
            excluded_until: None,
        }
    }

    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Assigned and running tasks count toward an agent's load.
    pub fn is_held(self) -> bool {
        matches!(self, TaskStatus::Assigned | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub workflow_id: WorkflowId,
    pub required_capabilities: BTreeSet<String>,
    pub priority: i32,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentId>,
    pub payload: serde_json::Value,
    pub depends_on: BTreeSet<TaskId>,
    pub attempts: u32,
    /// Submission order of the owning workflow.
    pub sequence: u64,
    /// Position of the task inside its workflow.
    pub position: usize,
    pub last_error: Option<String>,
}

/// A task as described by the submitter, before it enters the task table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub required_capabilities: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// `task` may only start once `depends_on` has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub task: TaskId,
    pub depends_on: TaskId,
}

/// Workflow submission as received from a client. The id is client-assigned
/// when present, which makes resubmission idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSubmission {
    #[serde(default)]
    pub id: Option<WorkflowId>,
    pub tasks: Vec<TaskSpec>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSpec {
    pub id: WorkflowId,
    pub tasks: Vec<TaskSpec>,
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    pub id: WorkflowId,
    pub tasks: Vec<TaskId>,
    pub dependencies: Vec<Dependency>,
    pub status: WorkflowStatus,
    pub submitted_at: DateTime<Utc>,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub success: bool,
    #[serde(default)]
    pub output: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Cluster-wide tunables, replicated through `Configuration` entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub rebalance_threshold: f64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,
    pub max_task_attempts: u32,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            rebalance_threshold: 1.5,
            circuit_failure_threshold: 3,
            circuit_cooldown_secs: 60,
            max_task_attempts: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_match_is_subset() {
        let caps: BTreeSet<String> = ["rust", "python"].iter().map(|s| s.to_string()).collect();
        let agent = Agent::new(Uuid::new_v4(), "http://a".into(), caps, Utc::now());

        let wanted: BTreeSet<String> = ["rust".to_string()].into_iter().collect();
        assert!(agent.has_capabilities(&wanted));
        assert!(agent.has_capabilities(&BTreeSet::new()));

        let missing: BTreeSet<String> = ["go".to_string()].into_iter().collect();
        assert!(!agent.has_capabilities(&missing));
    }

    #[test]
    fn submission_defaults_optional_fields() {
        let json = r#"{"tasks":[{"id":"a"}]}"#;
        let submission: WorkflowSubmission = serde_json::from_str(json).unwrap();
        assert_eq!(submission.id, None);
        assert!(submission.dependencies.is_empty());
        assert_eq!(submission.tasks[0].priority, 0);
        assert!(submission.tasks[0].required_capabilities.is_empty());
    }

    #[test]
    fn held_and_terminal_statuses() {
        assert!(TaskStatus::Assigned.is_held());
        assert!(TaskStatus::Running.is_held());
        assert!(!TaskStatus::Pending.is_held());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }
}
