use crate::error::OrchestratorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{AgentId, Task, TaskId, TaskStatus, Workflow, WorkflowId, WorkflowSpec, WorkflowStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

/// Replicated table of workflows and their tasks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    workflows: BTreeMap<WorkflowId, Workflow>,
    next_sequence: u64,
}

impl TaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn workflow(&self, id: &str) -> Option<&Workflow> {
        self.workflows.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn workflows(&self) -> impl Iterator<Item = &Workflow> {
        self.workflows.values()
    }

    /// Tasks of a workflow, in submission order.
    pub fn workflow_tasks(&self, id: &str) -> Vec<Task> {
        self.workflows
            .get(id)
            .map(|wf| wf.tasks.iter().filter_map(|t| self.tasks.get(t)).cloned().collect())
            .unwrap_or_default()
    }

    /// Check a submission against this table: it needs at least one task,
    /// unique task ids not used by any other workflow, dependencies between
    /// its own tasks only, and no cycles.
    pub fn validate(&self, spec: &WorkflowSpec) -> Result<(), OrchestratorError> {
        if spec.id.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow("workflow id is empty".into()));
        }
        if spec.tasks.is_empty() {
            return Err(OrchestratorError::InvalidWorkflow("workflow has no tasks".into()));
        }

        let mut ids = BTreeSet::new();
        for task in &spec.tasks {
            if task.id.is_empty() {
                return Err(OrchestratorError::InvalidWorkflow("task id is empty".into()));
            }
            if !ids.insert(task.id.as_str()) {
                return Err(OrchestratorError::InvalidWorkflow(format!("duplicate task id {}", task.id)));
            }
            if self.tasks.contains_key(&task.id) {
                return Err(OrchestratorError::InvalidWorkflow(format!("task id {} already in use", task.id)));
            }
        }

        for dep in &spec.dependencies {
            for id in [&dep.task, &dep.depends_on] {
                if !ids.contains(id.as_str()) {
                    return Err(OrchestratorError::InvalidWorkflow(format!(
                        "dependency references unknown task {}",
                        id
                    )));
                }
            }
            if dep.task == dep.depends_on {
                return Err(OrchestratorError::InvalidWorkflow(format!("task {} depends on itself", dep.task)));
            }
        }

        // Kahn's algorithm; anything left over sits on a cycle.
        let mut indegree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for dep in &spec.dependencies {
            edges.entry(dep.depends_on.as_str()).or_default().push(dep.task.as_str());
            *indegree.entry(dep.task.as_str()).or_default() += 1;
        }
        let mut queue: VecDeque<&str> = indegree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| *id).collect();
        let mut visited = 0;
        while let Some(id) = queue.pop_front() {
            visited += 1;
            for next in edges.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(*next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(*next);
                    }
                }
            }
        }
        if visited != ids.len() {
            return Err(OrchestratorError::InvalidWorkflow("dependency graph has a cycle".into()));
        }

        Ok(())
    }

    /// Add a validated workflow. Returns false when the id already exists.
    pub fn insert(&mut self, spec: &WorkflowSpec, at: DateTime<Utc>) -> bool {
        if self.workflows.contains_key(&spec.id) {
            return false;
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        for (position, task) in spec.tasks.iter().enumerate() {
            let depends_on = spec
                .dependencies
                .iter()
                .filter(|dep| dep.task == task.id)
                .map(|dep| dep.depends_on.clone())
                .collect();
            self.tasks.insert(
                task.id.clone(),
                Task {
                    id: task.id.clone(),
                    workflow_id: spec.id.clone(),
                    required_capabilities: task.required_capabilities.clone(),
                    priority: task.priority,
                    status: TaskStatus::Pending,
                    assigned_agent: None,
                    payload: task.payload.clone(),
                    depends_on,
                    attempts: 0,
                    sequence,
                    position,
                    last_error: None,
                },
            );
        }

        self.workflows.insert(
            spec.id.clone(),
            Workflow {
                id: spec.id.clone(),
                tasks: spec.tasks.iter().map(|t| t.id.clone()).collect(),
                dependencies: spec.dependencies.clone(),
                status: WorkflowStatus::Pending,
                submitted_at: at,
                sequence,
            },
        );
        true
    }

    /// All predecessors completed.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on
            .iter()
            .all(|dep| self.tasks.get(dep).map(|t| t.status == TaskStatus::Completed).unwrap_or(false))
    }

    pub fn is_ready(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending && self.dependencies_met(task)
    }

    pub fn ready_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(move |task| self.is_ready(task))
    }

    pub fn held_by(&self, agent: &AgentId) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.status.is_held() && t.assigned_agent.as_ref() == Some(agent))
            .cloned()
            .collect()
    }

    /// Every task that transitively depends on `id`, in task-id order.
    pub fn dependents(&self, id: &str) -> Vec<TaskId> {
        let workflow_id = match self.tasks.get(id) {
            Some(task) => task.workflow_id.clone(),
            None => return Vec::new(),
        };
        let siblings: Vec<&Task> = self
            .workflows
            .get(&workflow_id)
            .map(|wf| wf.tasks.iter().filter_map(|t| self.tasks.get(t)).collect())
            .unwrap_or_default();

        let mut found = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for task in &siblings {
                if task.depends_on.contains(&current) && found.insert(task.id.clone()) {
                    frontier.push(task.id.clone());
                }
            }
        }
        found.into_iter().collect()
    }

    /// Recompute a workflow's status from its tasks. Returns the new status
    /// when it changed.
    pub fn refresh(&mut self, id: &str) -> Option<WorkflowStatus> {
        let statuses: Vec<TaskStatus> = self.workflow_tasks(id).iter().map(|t| t.status).collect();
        let workflow = self.workflows.get_mut(id)?;
        if workflow.status.is_terminal() {
            return None;
        }

        let next = if statuses.iter().all(|s| *s == TaskStatus::Completed) {
            WorkflowStatus::Completed
        } else if statuses.iter().all(|s| s.is_terminal()) {
            WorkflowStatus::Failed
        } else if statuses.iter().any(|s| *s != TaskStatus::Pending) {
            WorkflowStatus::Running
        } else {
            WorkflowStatus::Pending
        };

        if next == workflow.status {
            return None;
        }
        workflow.status = next;
        Some(next)
    }
}
