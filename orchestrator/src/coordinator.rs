use crate::command::Command;
use crate::distributor::{self, Assignment};
use crate::error::OrchestratorError;
use crate::monitor::{FaultMonitor, MonitorAction, MonitorConfig};
use crate::state::ClusterState;
use chrono::{DateTime, Utc};
use raft_core::{ConsensusStatus, Network, NodeState, RaftError, RaftNode, Storage};
use serde::Serialize;
use shared::events::Decision;
use shared::types::{
    Agent, AgentId, AgentStatus, ClusterSettings, Index, Task, TaskResult, TaskStatus, Term, Workflow,
    WorkflowId, WorkflowSpec, WorkflowSubmission,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on the wait between proposal retries.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Exponential backoff for the given retry, capped at [`MAX_RETRY_BACKOFF`].
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_BACKOFF, |delay| delay.min(MAX_RETRY_BACKOFF))
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub monitor: MonitorConfig,
    pub distribution_interval: Duration,
    /// Extra attempts for a proposal that timed out waiting for a majority.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            distribution_interval: Duration::from_millis(500),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub workflow: Workflow,
    pub tasks: Vec<Task>,
}

/// Transport-independent entry point for agents and clients.
///
/// Writes go through the local consensus node and only succeed on the
/// leader. Reads are served from this node's applied state, which on a
/// follower may trail the leader slightly.
pub struct Coordinator<S, N> {
    node: RaftNode<S, N, ClusterState>,
    config: Arc<CoordinatorConfig>,
    monitor: Arc<Mutex<FaultMonitor>>,
    pass_lock: Arc<Mutex<()>>,
}

impl<S, N> Clone for Coordinator<S, N> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            config: Arc::clone(&self.config),
            monitor: Arc::clone(&self.monitor),
            pass_lock: Arc::clone(&self.pass_lock),
        }
    }
}

impl<S, N> Coordinator<S, N>
where
    S: Storage,
    N: Network,
{
    pub fn new(node: RaftNode<S, N, ClusterState>, config: CoordinatorConfig) -> Self {
        let monitor = FaultMonitor::new(config.monitor.clone());
        Self {
            node,
            config: Arc::new(config),
            monitor: Arc::new(Mutex::new(monitor)),
            pass_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn node(&self) -> &RaftNode<S, N, ClusterState> {
        &self.node
    }

    /// Start consensus and the leader-side background loops.
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        self.node.start().await?;

        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.monitor_loop().await });
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.distribution_loop().await });
        let coordinator = self.clone();
        tokio::spawn(async move { coordinator.leadership_watcher().await });

        info!("Coordinator started on node {}", self.node.id());
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }

    fn require_leader(&self) -> Result<Term, OrchestratorError> {
        let status = self.node.status();
        if status.role == NodeState::Leader {
            Ok(status.term)
        } else {
            Err(OrchestratorError::NotLeader {
                leader_hint: status.leader_id,
            })
        }
    }

    /// Every command is idempotent on apply, so a proposal that timed out
    /// can be retried even if the first copy later commits.
    async fn propose(&self, command: Command) -> Result<Index, OrchestratorError> {
        let payload = command.encode()?;
        let mut attempt = 0;
        loop {
            match self.node.propose(command.kind(), payload.clone()).await {
                Ok(index) => return Ok(index),
                Err(RaftError::QuorumUnavailable { retry_after }) if attempt < self.config.max_retries => {
                    let backoff = retry_delay(self.config.retry_backoff, attempt);
                    warn!(
                        "No quorum for proposal (attempt {}), retrying in {:?} (hint {:?})",
                        attempt + 1,
                        backoff,
                        retry_after
                    );
                    time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn kick_distribution(&self) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_distribution_pass().await {
                debug!("Distribution pass failed: {}", e);
            }
        });
    }

    // ---- agent registry ----

    pub async fn register_agent(
        &self,
        endpoint: String,
        capabilities: BTreeSet<String>,
    ) -> Result<AgentId, OrchestratorError> {
        self.require_leader()?;
        let agent_id = Uuid::new_v4();
        self.propose(Command::RegisterAgent {
            agent_id,
            endpoint,
            capabilities,
            at: Utc::now(),
        })
        .await?;

        self.monitor.lock().await.record_heartbeat(agent_id, Instant::now());
        self.kick_distribution();
        Ok(agent_id)
    }

    /// Record liveness. Only a status change reaches the log.
    pub async fn heartbeat(
        &self,
        agent_id: AgentId,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<AgentStatus, OrchestratorError> {
        let term = self.require_leader()?;
        let status = self
            .node
            .read(|s| s.registry().get(&agent_id).map(|a| a.status))
            .await
            .ok_or(OrchestratorError::AgentNotFound(agent_id))?;

        let now = Instant::now();
        {
            let mut monitor = self.monitor.lock().await;
            monitor.observe_term(term, now);
            monitor.record_heartbeat(agent_id, now);
        }
        if let Some(sent) = timestamp {
            debug!("Heartbeat from {} sent at {}", agent_id, sent);
        }

        if status != AgentStatus::Alive {
            info!("Agent {} is back ({:?} -> Alive)", agent_id, status);
            self.propose(Command::SetAgentStatus {
                agent_id,
                status: AgentStatus::Alive,
                at: Utc::now(),
            })
            .await?;
            self.kick_distribution();
        }
        Ok(AgentStatus::Alive)
    }

    pub async fn deregister_agent(&self, agent_id: AgentId) -> Result<(), OrchestratorError> {
        self.require_leader()?;
        if !self.node.read(|s| s.registry().contains(&agent_id)).await {
            return Err(OrchestratorError::AgentNotFound(agent_id));
        }
        self.propose(Command::DeregisterAgent { agent_id, at: Utc::now() }).await?;
        self.monitor.lock().await.forget(&agent_id);
        self.kick_distribution();
        Ok(())
    }

    /// Agents as replicated. On the leader `last_heartbeat` reflects the
    /// local liveness table.
    pub async fn list_agents(&self) -> Vec<Agent> {
        let mut agents = self.node.read(|s| s.registry().list()).await;
        if self.node.is_leader() {
            let monitor = self.monitor.lock().await;
            let now = Instant::now();
            let wall = Utc::now();
            for agent in &mut agents {
                let silent = chrono::Duration::from_std(monitor.silent_for(&agent.id, now))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                agent.last_heartbeat = agent.last_heartbeat.max(wall - silent);
            }
        }
        agents
    }

    pub async fn get_agent(&self, agent_id: AgentId) -> Result<Agent, OrchestratorError> {
        self.node
            .read(|s| s.registry().get(&agent_id).cloned())
            .await
            .ok_or(OrchestratorError::AgentNotFound(agent_id))
    }

    pub async fn agent_tasks(&self, agent_id: AgentId) -> Result<Vec<Task>, OrchestratorError> {
        self.node
            .read(|s| {
                if s.registry().contains(&agent_id) {
                    Ok(s.tasks().held_by(&agent_id))
                } else {
                    Err(OrchestratorError::AgentNotFound(agent_id))
                }
            })
            .await
    }

    // ---- workflows and tasks ----

    /// Accept a workflow. Resubmitting an id that is already known is a
    /// no-op that returns the same id.
    pub async fn submit_workflow(&self, submission: WorkflowSubmission) -> Result<WorkflowId, OrchestratorError> {
        self.require_leader()?;
        let spec = WorkflowSpec {
            id: submission.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            tasks: submission.tasks,
            dependencies: submission.dependencies,
        };
        let id = spec.id.clone();

        let known = self
            .node
            .read(|s| {
                if s.tasks().workflow(&spec.id).is_some() {
                    Ok(true)
                } else {
                    s.tasks().validate(&spec).map(|_| false)
                }
            })
            .await?;
        if known {
            info!("Workflow {} already submitted", id);
            return Ok(id);
        }

        self.propose(Command::SubmitWorkflow { spec, at: Utc::now() }).await?;

        // A concurrent submission may have claimed the same task ids first.
        if !self.node.read(|s| s.tasks().workflow(&id).is_some()).await {
            return Err(OrchestratorError::InvalidWorkflow(format!(
                "workflow {} conflicts with a concurrent submission",
                id
            )));
        }
        self.kick_distribution();
        Ok(id)
    }

    pub async fn workflow_status(&self, workflow_id: &str) -> Result<WorkflowView, OrchestratorError> {
        self.node
            .read(|s| {
                s.tasks().workflow(workflow_id).cloned().map(|workflow| WorkflowView {
                    tasks: s.tasks().workflow_tasks(workflow_id),
                    workflow,
                })
            })
            .await
            .ok_or_else(|| OrchestratorError::WorkflowNotFound(workflow_id.to_string()))
    }

    pub async fn task_status(&self, task_id: &str) -> Result<Task, OrchestratorError> {
        self.node
            .read(|s| s.tasks().task(task_id).cloned())
            .await
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))
    }

    pub async fn start_task(&self, task_id: &str, agent_id: AgentId) -> Result<(), OrchestratorError> {
        self.require_leader()?;
        let task = self.task_status(task_id).await?;
        match (task.status, task.assigned_agent) {
            (TaskStatus::Running, Some(holder)) if holder == agent_id => return Ok(()),
            (TaskStatus::Assigned, Some(holder)) if holder == agent_id => {}
            (status, _) => {
                return Err(OrchestratorError::Conflict(format!(
                    "task {} is {:?} and not assigned to {}",
                    task_id, status, agent_id
                )))
            }
        }

        self.propose(Command::StartTask {
            task_id: task_id.to_string(),
            agent_id,
            at: Utc::now(),
        })
        .await?;
        Ok(())
    }

    /// Record a task outcome. Returns false when the task had already
    /// finished and the result was ignored.
    pub async fn report_result(&self, result: TaskResult) -> Result<bool, OrchestratorError> {
        self.require_leader()?;
        let task = self.task_status(&result.task_id).await?;
        if task.status.is_terminal() {
            info!("Ignoring result for finished task {}", result.task_id);
            return Ok(false);
        }
        if !task.status.is_held() || task.assigned_agent != Some(result.agent_id) {
            return Err(OrchestratorError::Conflict(format!(
                "task {} is not held by agent {}",
                result.task_id, result.agent_id
            )));
        }

        self.propose(Command::CompleteTask { result, at: Utc::now() }).await?;
        self.kick_distribution();
        Ok(true)
    }

    // ---- settings and status ----

    pub async fn settings(&self) -> ClusterSettings {
        self.node.read(|s| s.settings().clone()).await
    }

    pub async fn update_settings(&self, settings: ClusterSettings) -> Result<(), OrchestratorError> {
        if !settings.rebalance_threshold.is_finite() || settings.rebalance_threshold < 1.0 {
            return Err(OrchestratorError::InvalidSettings("rebalanceThreshold must be at least 1.0".into()));
        }
        if settings.circuit_failure_threshold == 0 {
            return Err(OrchestratorError::InvalidSettings("circuitFailureThreshold must be positive".into()));
        }
        if settings.max_task_attempts == 0 {
            return Err(OrchestratorError::InvalidSettings("maxTaskAttempts must be positive".into()));
        }
        self.require_leader()?;
        self.propose(Command::UpdateSettings { settings }).await?;
        Ok(())
    }

    pub fn consensus_status(&self) -> ConsensusStatus {
        self.node.status()
    }

    pub async fn subscribe(&self) -> broadcast::Receiver<Decision> {
        self.node.read(|s| s.subscribe()).await
    }

    // ---- leader duties ----

    /// Assign ready tasks, then rebalance. No-op on followers.
    pub async fn run_distribution_pass(&self) -> Result<usize, OrchestratorError> {
        if !self.node.is_leader() {
            return Ok(0);
        }
        let _pass = self.pass_lock.lock().await;

        let now = Utc::now();
        let plan = self.node.read(|s| distributor::plan_assignments(s, now)).await;
        let mut proposed = self.propose_plan(plan, now).await?;

        let moves = self.node.read(|s| distributor::plan_rebalance(s, now)).await;
        if !moves.is_empty() {
            info!("Rebalancing {} tasks", moves.len());
        }
        proposed += self.propose_plan(moves, now).await?;
        Ok(proposed)
    }

    async fn propose_plan(&self, plan: Vec<Assignment>, at: DateTime<Utc>) -> Result<usize, OrchestratorError> {
        let count = plan.len();
        for assignment in plan {
            self.propose(Command::AssignTask {
                task_id: assignment.task_id,
                agent_id: assignment.agent_id,
                previous: assignment.previous,
                at,
            })
            .await?;
        }
        Ok(count)
    }

    /// Detect failed agents, replicate their new status and migrate their
    /// work in the same cycle.
    pub async fn run_monitor_scan(&self) -> Result<usize, OrchestratorError> {
        let status = self.node.status();
        if status.role != NodeState::Leader {
            return Ok(0);
        }

        let agents = self.node.read(|s| s.registry().list()).await;
        let actions = {
            let mut monitor = self.monitor.lock().await;
            let now = Instant::now();
            monitor.observe_term(status.term, now);
            monitor.scan(&agents, now)
        };

        for action in &actions {
            match action {
                MonitorAction::SetStatus { agent_id, status } => {
                    self.propose(Command::SetAgentStatus {
                        agent_id: *agent_id,
                        status: *status,
                        at: Utc::now(),
                    })
                    .await?;
                }
                MonitorAction::Remove { agent_id } => {
                    self.propose(Command::DeregisterAgent {
                        agent_id: *agent_id,
                        at: Utc::now(),
                    })
                    .await?;
                    self.monitor.lock().await.forget(agent_id);
                }
            }
        }

        if !actions.is_empty() {
            self.run_distribution_pass().await?;
        }
        Ok(actions.len())
    }

    async fn monitor_loop(self) {
        let mut ticker = time::interval(self.config.monitor.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.node.is_running() {
            ticker.tick().await;
            match self.run_monitor_scan().await {
                Ok(0) => {}
                Ok(n) => debug!("Monitor scan produced {} actions", n),
                Err(OrchestratorError::NotLeader { .. }) => {}
                Err(e) => warn!("Monitor scan failed: {}", e),
            }
        }
    }

    async fn distribution_loop(self) {
        let mut ticker = time::interval(self.config.distribution_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        while self.node.is_running() {
            ticker.tick().await;
            match self.run_distribution_pass().await {
                Ok(_) | Err(OrchestratorError::NotLeader { .. }) => {}
                Err(e) => warn!("Distribution pass failed: {}", e),
            }
        }
    }

    async fn leadership_watcher(self) {
        let mut status_rx = self.node.subscribe();
        let mut leading = false;
        while status_rx.changed().await.is_ok() && self.node.is_running() {
            let status = status_rx.borrow_and_update().clone();
            let now_leading = status.role == NodeState::Leader;
            if now_leading && !leading {
                info!("Node {} took leadership in term {}", status.node_id, status.term);
                self.monitor.lock().await.observe_term(status.term, Instant::now());
                self.kick_distribution();
            } else if !now_leading && leading {
                info!("Node {} lost leadership in term {}", status.node_id, status.term);
            }
            leading = now_leading;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_then_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_delay(base, 0), base);
        assert_eq!(retry_delay(base, 3), Duration::from_millis(800));
        assert_eq!(retry_delay(base, 10), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(base, 40), MAX_RETRY_BACKOFF);
        assert_eq!(retry_delay(Duration::MAX, 1), MAX_RETRY_BACKOFF);
    }
}
