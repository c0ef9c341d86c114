use crate::circuit_breaker;
use crate::command::Command;
use crate::registry::AgentRegistry;
use crate::workflow::TaskTable;
use chrono::{DateTime, Utc};
use raft_core::{RaftError, StateMachine};
use serde::{Deserialize, Serialize};
use shared::events::Decision;
use shared::types::{
    Agent, AgentId, AgentStatus, ClusterSettings, EntryKind, Index, LogEntry, TaskId, TaskResult, TaskStatus,
    WorkflowSpec, WorkflowStatus,
};
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

const DECISION_CHANNEL_CAPACITY: usize = 1024;

/// The replicated orchestration state: agents, workflows, tasks and
/// settings. Changes only by applying committed log entries, and every
/// change is announced as a [`Decision`].
pub struct ClusterState {
    registry: AgentRegistry,
    tasks: TaskTable,
    settings: ClusterSettings,
    events: broadcast::Sender<Decision>,
}

#[derive(Serialize)]
struct ImageRef<'a> {
    registry: &'a AgentRegistry,
    tasks: &'a TaskTable,
    settings: &'a ClusterSettings,
}

#[derive(Deserialize)]
struct Image {
    registry: AgentRegistry,
    tasks: TaskTable,
    settings: ClusterSettings,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterState {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(DECISION_CHANNEL_CAPACITY);
        Self {
            registry: AgentRegistry::new(),
            tasks: TaskTable::new(),
            settings: ClusterSettings::default(),
            events,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn tasks(&self) -> &TaskTable {
        &self.tasks
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Decision> {
        self.events.subscribe()
    }

    fn emit(&self, decision: Decision) {
        debug!("Decision {:?}", decision);
        // No subscribers is fine.
        let _ = self.events.send(decision);
    }

    pub fn execute(&mut self, index: Index, command: Command) {
        match command {
            Command::RegisterAgent { agent_id, endpoint, capabilities, at } => {
                self.register_agent(index, agent_id, endpoint, capabilities, at)
            }
            Command::SetAgentStatus { agent_id, status, at } => self.set_agent_status(index, agent_id, status, at),
            Command::DeregisterAgent { agent_id, .. } => self.deregister_agent(index, agent_id),
            Command::SubmitWorkflow { spec, at } => self.submit_workflow(index, spec, at),
            Command::AssignTask { task_id, agent_id, previous, at } => {
                self.assign_task(index, task_id, agent_id, previous, at)
            }
            Command::StartTask { task_id, agent_id, .. } => self.start_task(index, task_id, agent_id),
            Command::CompleteTask { result, at } => self.complete_task(index, result, at),
            Command::UpdateSettings { settings } => {
                self.settings = settings;
                info!("Cluster settings updated at index {}", index);
                self.emit(Decision::SettingsUpdated { index });
            }
        }
    }

    fn register_agent(
        &mut self,
        index: Index,
        agent_id: AgentId,
        endpoint: String,
        capabilities: BTreeSet<String>,
        at: DateTime<Utc>,
    ) {
        if !self.registry.register(Agent::new(agent_id, endpoint, capabilities, at)) {
            debug!("Agent {} already registered", agent_id);
            return;
        }
        info!("Agent {} registered", agent_id);
        self.emit(Decision::AgentRegistered { index, agent_id });
    }

    fn set_agent_status(&mut self, index: Index, agent_id: AgentId, status: AgentStatus, at: DateTime<Utc>) {
        let from = match self.registry.set_status(&agent_id, status, at) {
            Some(from) => from,
            None => return,
        };
        info!("Agent {} is now {:?} (was {:?})", agent_id, status, from);
        self.emit(Decision::AgentStatusChanged { index, agent_id, from, to: status });

        if status == AgentStatus::Dead {
            self.requeue_held(index, agent_id);
        }
    }

    fn deregister_agent(&mut self, index: Index, agent_id: AgentId) {
        if !self.registry.contains(&agent_id) {
            return;
        }
        self.requeue_held(index, agent_id);
        self.registry.remove(&agent_id);
        info!("Agent {} removed", agent_id);
        self.emit(Decision::AgentRemoved { index, agent_id });
    }

    /// Put every task held by `agent_id` back into the pending pool.
    fn requeue_held(&mut self, index: Index, agent_id: AgentId) {
        for task in self.tasks.held_by(&agent_id) {
            if let Some(task) = self.tasks.task_mut(&task.id) {
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
            }
            self.registry.release(&agent_id);
            warn!("Task {} requeued from agent {}", task.id, agent_id);
            self.emit(Decision::TaskRequeued { index, task_id: task.id, from: agent_id });
        }
    }

    fn submit_workflow(&mut self, index: Index, spec: WorkflowSpec, at: DateTime<Utc>) {
        if self.tasks.workflow(&spec.id).is_some() {
            debug!("Workflow {} already accepted", spec.id);
            return;
        }
        if let Err(e) = self.tasks.validate(&spec) {
            warn!("Dropping workflow {} at index {}: {}", spec.id, index, e);
            return;
        }
        self.tasks.insert(&spec, at);
        info!("Workflow {} accepted with {} tasks", spec.id, spec.tasks.len());
        self.emit(Decision::WorkflowAccepted { index, workflow_id: spec.id });
    }

    fn assign_task(
        &mut self,
        index: Index,
        task_id: TaskId,
        agent_id: AgentId,
        previous: Option<AgentId>,
        at: DateTime<Utc>,
    ) {
        // The plan was made against an older state; re-check it.
        let task = match self.tasks.task(&task_id) {
            Some(task) => task,
            None => return,
        };
        let plan_holds = match previous {
            None => self.tasks.is_ready(task),
            Some(prev) => task.status == TaskStatus::Assigned && task.assigned_agent == Some(prev) && prev != agent_id,
        };
        let agent_fits = self
            .registry
            .get(&agent_id)
            .map(|agent| AgentRegistry::is_eligible(agent, &task.required_capabilities, &self.settings, at))
            .unwrap_or(false);
        if !plan_holds || !agent_fits {
            debug!("Stale assignment of task {} to {} ignored", task_id, agent_id);
            return;
        }

        let workflow_id = task.workflow_id.clone();
        if let Some(prev) = previous {
            self.registry.release(&prev);
        }
        if let Some(task) = self.tasks.task_mut(&task_id) {
            task.status = TaskStatus::Assigned;
            task.assigned_agent = Some(agent_id);
        }
        self.registry.acquire(&agent_id);

        info!("Task {} assigned to agent {}", task_id, agent_id);
        self.emit(Decision::TaskAssigned { index, task_id, agent_id, previous });
        self.refresh_workflow(index, &workflow_id);
    }

    fn start_task(&mut self, index: Index, task_id: TaskId, agent_id: AgentId) {
        let task = match self.tasks.task_mut(&task_id) {
            Some(task) if task.status == TaskStatus::Assigned && task.assigned_agent == Some(agent_id) => task,
            _ => return,
        };
        task.status = TaskStatus::Running;
        let workflow_id = task.workflow_id.clone();

        self.emit(Decision::TaskStarted { index, task_id, agent_id });
        self.refresh_workflow(index, &workflow_id);
    }

    fn complete_task(&mut self, index: Index, result: TaskResult, at: DateTime<Utc>) {
        let agent_id = result.agent_id;
        let task = match self.tasks.task(&result.task_id) {
            Some(task) => task,
            None => return,
        };
        if !task.status.is_held() || task.assigned_agent != Some(agent_id) {
            debug!("Result for task {} from {} ignored", result.task_id, agent_id);
            return;
        }
        let workflow_id = task.workflow_id.clone();
        let attempts = task.attempts + 1;
        self.registry.release(&agent_id);

        if result.success {
            if let Some(agent) = self.registry.get_mut(&agent_id) {
                circuit_breaker::record_success(agent);
            }
            if let Some(task) = self.tasks.task_mut(&result.task_id) {
                task.status = TaskStatus::Completed;
                task.attempts = attempts;
                task.last_error = None;
            }
            info!("Task {} completed by agent {}", result.task_id, agent_id);
            self.emit(Decision::TaskFinished { index, task_id: result.task_id, status: TaskStatus::Completed });
        } else {
            if let Some(agent) = self.registry.get_mut(&agent_id) {
                if circuit_breaker::record_failure(agent, &self.settings, at) {
                    warn!("Circuit opened for agent {}", agent_id);
                }
            }
            let exhausted = attempts >= self.settings.max_task_attempts;
            if let Some(task) = self.tasks.task_mut(&result.task_id) {
                task.attempts = attempts;
                task.assigned_agent = None;
                task.last_error = result.error.clone();
                task.status = if exhausted { TaskStatus::Failed } else { TaskStatus::Pending };
            }

            if exhausted {
                warn!("Task {} failed after {} attempts", result.task_id, attempts);
                self.emit(Decision::TaskFinished {
                    index,
                    task_id: result.task_id.clone(),
                    status: TaskStatus::Failed,
                });
                self.fail_dependents(index, &result.task_id);
            } else {
                warn!("Task {} failed on agent {}, retrying ({} attempts)", result.task_id, agent_id, attempts);
                self.emit(Decision::TaskRequeued { index, task_id: result.task_id, from: agent_id });
            }
        }

        self.refresh_workflow(index, &workflow_id);
    }

    /// A permanently failed task can never satisfy its dependents.
    fn fail_dependents(&mut self, index: Index, task_id: &str) {
        for dependent in self.tasks.dependents(task_id) {
            let released = match self.tasks.task_mut(&dependent) {
                Some(task) if !task.status.is_terminal() => {
                    let held = task.status.is_held().then_some(task.assigned_agent).flatten();
                    task.status = TaskStatus::Failed;
                    task.assigned_agent = None;
                    task.last_error = Some(format!("dependency {} failed", task_id));
                    held
                }
                _ => continue,
            };
            if let Some(agent_id) = released {
                self.registry.release(&agent_id);
            }
            self.emit(Decision::TaskFinished { index, task_id: dependent, status: TaskStatus::Failed });
        }
    }

    fn refresh_workflow(&mut self, index: Index, workflow_id: &str) {
        if let Some(status) = self.tasks.refresh(workflow_id) {
            if status.is_terminal() {
                info!("Workflow {} finished as {:?}", workflow_id, status);
                self.emit(Decision::WorkflowFinished {
                    index,
                    workflow_id: workflow_id.to_string(),
                    status,
                });
            } else if status == WorkflowStatus::Running {
                debug!("Workflow {} running", workflow_id);
            }
        }
    }
}

impl StateMachine for ClusterState {
    fn apply(&mut self, entry: &LogEntry) {
        if entry.kind == EntryKind::Heartbeat {
            return;
        }
        match Command::decode(&entry.payload) {
            Ok(command) => self.execute(entry.index, command),
            Err(e) => error!("Skipping undecodable entry {}: {}", entry.index, e),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, RaftError> {
        let image = ImageRef {
            registry: &self.registry,
            tasks: &self.tasks,
            settings: &self.settings,
        };
        Ok(serde_json::to_vec(&image)?)
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), RaftError> {
        let image: Image = serde_json::from_slice(data)?;
        self.registry = image.registry;
        self.tasks = image.tasks;
        self.settings = image.settings;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{Dependency, TaskSpec};
    use uuid::Uuid;

    struct Harness {
        state: ClusterState,
        index: Index,
        now: DateTime<Utc>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                state: ClusterState::new(),
                index: 0,
                now: Utc::now(),
            }
        }

        fn run(&mut self, command: Command) {
            self.index += 1;
            let entry = LogEntry::new(self.index, 1, command.kind(), command.encode().unwrap());
            self.state.apply(&entry);
        }

        fn agent(&mut self, caps: &[&str]) -> AgentId {
            let agent_id = Uuid::new_v4();
            self.run(Command::RegisterAgent {
                agent_id,
                endpoint: format!("http://{}", agent_id),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                at: self.now,
            });
            agent_id
        }

        fn workflow(&mut self, id: &str, tasks: &[&str], deps: &[(&str, &str)]) {
            let spec = WorkflowSpec {
                id: id.into(),
                tasks: tasks
                    .iter()
                    .map(|t| TaskSpec {
                        id: t.to_string(),
                        required_capabilities: BTreeSet::new(),
                        priority: 0,
                        payload: serde_json::Value::Null,
                    })
                    .collect(),
                dependencies: deps
                    .iter()
                    .map(|(t, on)| Dependency { task: t.to_string(), depends_on: on.to_string() })
                    .collect(),
            };
            self.run(Command::SubmitWorkflow { spec, at: self.now });
        }

        fn assign(&mut self, task: &str, agent_id: AgentId) {
            self.run(Command::AssignTask { task_id: task.into(), agent_id, previous: None, at: self.now });
        }

        fn finish(&mut self, task: &str, agent_id: AgentId, success: bool) {
            self.run(Command::CompleteTask {
                result: TaskResult {
                    task_id: task.into(),
                    agent_id,
                    success,
                    output: None,
                    error: (!success).then(|| "boom".to_string()),
                },
                at: self.now,
            });
        }

        fn status(&self, task: &str) -> TaskStatus {
            self.state.tasks().task(task).unwrap().status
        }

        fn load(&self, agent_id: AgentId) -> u32 {
            self.state.registry().get(&agent_id).unwrap().current_load
        }
    }

    #[test]
    fn assignment_tracks_load_and_workflow_status() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        h.workflow("w", &["t1"], &[]);
        h.assign("t1", a);

        assert_eq!(h.status("t1"), TaskStatus::Assigned);
        assert_eq!(h.load(a), 1);
        assert_eq!(h.state.tasks().workflow("w").unwrap().status, WorkflowStatus::Running);

        h.finish("t1", a, true);
        assert_eq!(h.status("t1"), TaskStatus::Completed);
        assert_eq!(h.load(a), 0);
        assert_eq!(h.state.tasks().workflow("w").unwrap().status, WorkflowStatus::Completed);
    }

    #[test]
    fn assignment_before_dependencies_is_ignored() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        h.workflow("w", &["t1", "t2"], &[("t2", "t1")]);
        h.assign("t2", a);
        assert_eq!(h.status("t2"), TaskStatus::Pending);
        assert_eq!(h.load(a), 0);
    }

    #[test]
    fn dead_agent_releases_its_tasks() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        h.workflow("w", &["t1", "t2"], &[]);
        h.assign("t1", a);
        h.assign("t2", a);
        h.run(Command::StartTask { task_id: "t1".into(), agent_id: a, at: h.now });
        assert_eq!(h.status("t1"), TaskStatus::Running);

        let mut decisions = h.state.subscribe();
        h.run(Command::SetAgentStatus { agent_id: a, status: AgentStatus::Dead, at: h.now });

        assert_eq!(h.status("t1"), TaskStatus::Pending);
        assert_eq!(h.status("t2"), TaskStatus::Pending);
        assert_eq!(h.load(a), 0);
        assert!(matches!(decisions.try_recv().unwrap(), Decision::AgentStatusChanged { to: AgentStatus::Dead, .. }));
        assert!(matches!(decisions.try_recv().unwrap(), Decision::TaskRequeued { .. }));
    }

    #[test]
    fn failures_retry_then_cascade() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        let b = h.agent(&[]);
        h.workflow("w", &["t1", "t2", "t3"], &[("t2", "t1"), ("t3", "t2")]);

        h.assign("t1", a);
        h.finish("t1", a, false);
        assert_eq!(h.status("t1"), TaskStatus::Pending);
        assert_eq!(h.state.tasks().task("t1").unwrap().attempts, 1);

        h.assign("t1", b);
        h.finish("t1", b, false);
        h.assign("t1", a);
        h.finish("t1", a, false);

        assert_eq!(h.status("t1"), TaskStatus::Failed);
        assert_eq!(h.status("t2"), TaskStatus::Failed);
        assert_eq!(h.status("t3"), TaskStatus::Failed);
        assert_eq!(h.state.tasks().workflow("w").unwrap().status, WorkflowStatus::Failed);
    }

    #[test]
    fn repeated_failures_open_the_circuit() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        let tasks = ["t1", "t2", "t3", "t4"];
        h.workflow("w", &tasks, &[]);
        for task in &tasks[..3] {
            h.assign(task, a);
            h.finish(task, a, false);
        }

        h.assign("t4", a);
        assert_eq!(h.status("t4"), TaskStatus::Pending, "open circuit must block assignment");
    }

    #[test]
    fn results_for_finished_tasks_are_ignored() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        h.workflow("w", &["t1"], &[]);
        h.assign("t1", a);
        h.finish("t1", a, true);
        h.finish("t1", a, false);
        assert_eq!(h.status("t1"), TaskStatus::Completed);
        assert_eq!(h.state.registry().get(&a).unwrap().consecutive_failures, 0);
    }

    #[test]
    fn rebalance_moves_only_assigned_tasks() {
        let mut h = Harness::new();
        let a = h.agent(&[]);
        let b = h.agent(&[]);
        h.workflow("w", &["t1", "t2"], &[]);
        h.assign("t1", a);
        h.assign("t2", a);
        h.run(Command::StartTask { task_id: "t2".into(), agent_id: a, at: h.now });

        h.run(Command::AssignTask { task_id: "t1".into(), agent_id: b, previous: Some(a), at: h.now });
        h.run(Command::AssignTask { task_id: "t2".into(), agent_id: b, previous: Some(a), at: h.now });

        assert_eq!(h.state.tasks().task("t1").unwrap().assigned_agent, Some(b));
        assert_eq!(h.state.tasks().task("t2").unwrap().assigned_agent, Some(a));
        assert_eq!(h.load(a), 1);
        assert_eq!(h.load(b), 1);
    }

    #[test]
    fn snapshot_restores_into_fresh_state() {
        let mut h = Harness::new();
        let a = h.agent(&["rust"]);
        h.workflow("w", &["t1"], &[]);
        h.assign("t1", a);

        let image = h.state.snapshot().unwrap();
        let mut restored = ClusterState::new();
        restored.restore(&image).unwrap();

        assert_eq!(restored.registry(), h.state.registry());
        assert_eq!(restored.tasks(), h.state.tasks());
        assert_eq!(restored.settings(), h.state.settings());
    }

    #[test]
    fn garbage_entries_are_skipped() {
        let mut h = Harness::new();
        h.state.apply(&LogEntry::new(1, 1, EntryKind::Membership, b"{".to_vec()));
        h.state.apply(&LogEntry::noop(2, 1));
        assert!(h.state.registry().is_empty());
    }
}
