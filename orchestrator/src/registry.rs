use crate::circuit_breaker;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::types::{Agent, AgentId, AgentStatus, ClusterSettings};
use std::collections::{BTreeMap, BTreeSet};

/// Replicated view of every registered agent. Only the cluster state machine
/// mutates it, while applying committed entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRegistry {
    agents: BTreeMap<AgentId, Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &AgentId) -> Option<&Agent> {
        self.agents.get(id)
    }

    pub fn get_mut(&mut self, id: &AgentId) -> Option<&mut Agent> {
        self.agents.get_mut(id)
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    /// Agents ordered by id.
    pub fn list(&self) -> Vec<Agent> {
        self.agents.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Returns false if the id is already taken.
    pub fn register(&mut self, agent: Agent) -> bool {
        if self.agents.contains_key(&agent.id) {
            return false;
        }
        self.agents.insert(agent.id, agent);
        true
    }

    /// Returns the previous status when it changed.
    pub fn set_status(&mut self, id: &AgentId, status: AgentStatus, at: DateTime<Utc>) -> Option<AgentStatus> {
        let agent = self.agents.get_mut(id)?;
        if agent.status == status {
            return None;
        }
        let previous = agent.status;
        agent.status = status;
        agent.status_changed_at = at;
        if status == AgentStatus::Alive {
            agent.last_heartbeat = at;
        }
        Some(previous)
    }

    pub fn remove(&mut self, id: &AgentId) -> Option<Agent> {
        self.agents.remove(id)
    }

    pub fn acquire(&mut self, id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.current_load = agent.current_load.saturating_add(1);
        }
    }

    pub fn release(&mut self, id: &AgentId) {
        if let Some(agent) = self.agents.get_mut(id) {
            agent.current_load = agent.current_load.saturating_sub(1);
        }
    }

    /// Whether `agent` may receive a task needing `required` right now.
    pub fn is_eligible(agent: &Agent, required: &BTreeSet<String>, settings: &ClusterSettings, now: DateTime<Utc>) -> bool {
        agent.status == AgentStatus::Alive
            && agent.has_capabilities(required)
            && circuit_breaker::is_available(agent, settings, now)
    }

    pub fn eligible<'a>(
        &'a self,
        required: &'a BTreeSet<String>,
        settings: &'a ClusterSettings,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &'a Agent> + 'a {
        self.agents
            .values()
            .filter(move |agent| Self::is_eligible(agent, required, settings, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn caps(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn register_is_idempotent_per_id() {
        let mut registry = AgentRegistry::new();
        let agent = Agent::new(Uuid::new_v4(), "http://a".into(), caps(&["rust"]), Utc::now());
        assert!(registry.register(agent.clone()));
        assert!(!registry.register(agent));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn status_change_reports_previous() {
        let mut registry = AgentRegistry::new();
        let id = Uuid::new_v4();
        let start = Utc::now();
        registry.register(Agent::new(id, "http://a".into(), BTreeSet::new(), start));

        let later = start + chrono::Duration::seconds(5);
        assert_eq!(registry.set_status(&id, AgentStatus::Suspected, later), Some(AgentStatus::Alive));
        assert_eq!(registry.set_status(&id, AgentStatus::Suspected, later), None);
        assert_eq!(registry.get(&id).unwrap().status_changed_at, later);
        assert_eq!(registry.get(&id).unwrap().last_heartbeat, start);

        assert_eq!(registry.set_status(&id, AgentStatus::Alive, later), Some(AgentStatus::Suspected));
        assert_eq!(registry.get(&id).unwrap().last_heartbeat, later);
    }

    #[test]
    fn eligibility_needs_alive_and_capable() {
        let mut registry = AgentRegistry::new();
        let now = Utc::now();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        registry.register(Agent::new(a, "http://a".into(), caps(&["rust", "gpu"]), now));
        registry.register(Agent::new(b, "http://b".into(), caps(&["rust"]), now));
        registry.register(Agent::new(c, "http://c".into(), caps(&["rust", "gpu"]), now));
        registry.set_status(&c, AgentStatus::Suspected, now);

        let settings = ClusterSettings::default();
        let wanted = caps(&["gpu"]);
        let ids: Vec<AgentId> = registry.eligible(&wanted, &settings, now).map(|agent| agent.id).collect();
        assert_eq!(ids, vec![a]);
    }

    #[test]
    fn load_never_underflows() {
        let mut registry = AgentRegistry::new();
        let id = Uuid::new_v4();
        registry.register(Agent::new(id, "http://a".into(), BTreeSet::new(), Utc::now()));
        registry.release(&id);
        assert_eq!(registry.get(&id).unwrap().current_load, 0);
        registry.acquire(&id);
        registry.acquire(&id);
        registry.release(&id);
        assert_eq!(registry.get(&id).unwrap().current_load, 1);
    }
}
