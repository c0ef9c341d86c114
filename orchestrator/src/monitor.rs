use crate::error::OrchestratorError;
use shared::types::{Agent, AgentId, AgentStatus, Term};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Interval agents are expected to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Missed intervals before an agent is suspected.
    pub suspect_after_missed: u32,
    /// Silence after which an agent is declared dead.
    pub dead_after: Duration,
    /// How long a dead agent stays registered before removal.
    pub removal_grace: Duration,
    pub scan_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            suspect_after_missed: 3,
            dead_after: Duration::from_secs(10),
            removal_grace: Duration::from_secs(60),
            scan_interval: Duration::from_secs(1),
        }
    }
}

impl MonitorConfig {
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.suspect_after_missed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorAction {
    SetStatus { agent_id: AgentId, status: AgentStatus },
    Remove { agent_id: AgentId },
}

/// Leader-local failure detector.
///
/// Liveness is tracked with the monotonic clock and never replicated; only
/// the resulting status changes go through the log. The table restarts
/// from "now" each time this node begins a new leadership term, so a fresh
/// leader never condemns agents it simply has not heard from yet.
#[derive(Debug)]
pub struct FaultMonitor {
    config: MonitorConfig,
    term: Option<Term>,
    since: Instant,
    last_seen: HashMap<AgentId, Instant>,
    dead_since: HashMap<AgentId, Instant>,
}

impl FaultMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            term: None,
            since: Instant::now(),
            last_seen: HashMap::new(),
            dead_since: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Reset the table when leadership passes to a new term.
    pub fn observe_term(&mut self, term: Term, now: Instant) {
        if self.term == Some(term) {
            return;
        }
        info!("Fault monitor starting fresh for term {}", term);
        self.term = Some(term);
        self.since = now;
        self.last_seen.clear();
        self.dead_since.clear();
    }

    pub fn record_heartbeat(&mut self, agent_id: AgentId, now: Instant) {
        self.last_seen.insert(agent_id, now);
        self.dead_since.remove(&agent_id);
    }

    pub fn forget(&mut self, agent_id: &AgentId) {
        self.last_seen.remove(agent_id);
        self.dead_since.remove(agent_id);
    }

    pub fn last_seen(&self, agent_id: &AgentId) -> Instant {
        self.last_seen.get(agent_id).copied().unwrap_or(self.since)
    }

    pub fn silent_for(&self, agent_id: &AgentId, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen(agent_id))
    }

    /// Classify an agent that has missed its heartbeat window.
    pub fn check(&self, agent_id: &AgentId, now: Instant) -> Result<(), OrchestratorError> {
        let silent_for = self.silent_for(agent_id, now);
        if silent_for >= self.config.suspect_after() {
            return Err(OrchestratorError::AgentUnreachable {
                agent_id: *agent_id,
                silent_for,
            });
        }
        Ok(())
    }

    fn target_status(&self, silent_for: Duration) -> AgentStatus {
        if silent_for >= self.config.dead_after {
            AgentStatus::Dead
        } else if silent_for >= self.config.suspect_after() {
            AgentStatus::Suspected
        } else {
            AgentStatus::Alive
        }
    }

    /// Compare every agent's replicated status with what the heartbeats say.
    /// Scans only escalate; a dead agent's removal grace runs from the first
    /// scan of the current term that saw it dead.
    pub fn scan(&mut self, agents: &[Agent], now: Instant) -> Vec<MonitorAction> {
        let mut actions = Vec::new();

        for agent in agents {
            let silent_for = self.silent_for(&agent.id, now);
            if let Err(e) = self.check(&agent.id, now) {
                debug!("{}", e);
            }

            let target = self.target_status(silent_for);
            let heard_from = self.last_seen.contains_key(&agent.id);
            match (agent.status, target) {
                // The heartbeat handler is already replicating the revival.
                (AgentStatus::Dead, AgentStatus::Alive) if heard_from => {}
                (AgentStatus::Dead, _) => {
                    let dead_since = *self.dead_since.entry(agent.id).or_insert(now);
                    if now.saturating_duration_since(dead_since) >= self.config.removal_grace {
                        info!("Removing agent {} after grace period", agent.id);
                        actions.push(MonitorAction::Remove { agent_id: agent.id });
                    }
                }
                // Only a heartbeat brings an agent back to Alive.
                (_, AgentStatus::Alive) => {}
                (current, target) if current != target => {
                    if target == AgentStatus::Dead {
                        warn!("Agent {} silent for {:?}, declaring dead", agent.id, silent_for);
                    } else {
                        debug!("Agent {} moving {:?} -> {:?}", agent.id, current, target);
                    }
                    actions.push(MonitorAction::SetStatus {
                        agent_id: agent.id,
                        status: target,
                    });
                }
                _ => {}
            }
        }

        let known: Vec<AgentId> = agents.iter().map(|a| a.id).collect();
        self.last_seen.retain(|id, _| known.contains(id));
        self.dead_since.retain(|id, _| known.contains(id));
        actions
    }
}
