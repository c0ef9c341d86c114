//! Per-agent circuit breaker.
//!
//! An agent that fails `circuit_failure_threshold` tasks in a row is skipped
//! by the distributor for `circuit_cooldown_secs`. After the cooldown the
//! circuit is half-open: the agent may take work again, a success closes
//! the circuit and a single further failure reopens it.
//!
//! The counters live on the replicated [`Agent`] record and every transition
//! is driven by the timestamp carried in the committed command, so all nodes
//! agree on the circuit state.

use chrono::{DateTime, Duration, Utc};
use shared::types::{Agent, ClusterSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub fn state(agent: &Agent, settings: &ClusterSettings, now: DateTime<Utc>) -> CircuitState {
    if agent.consecutive_failures < settings.circuit_failure_threshold {
        return CircuitState::Closed;
    }
    match agent.excluded_until {
        Some(until) if now < until => CircuitState::Open,
        _ => CircuitState::HalfOpen,
    }
}

pub fn is_available(agent: &Agent, settings: &ClusterSettings, now: DateTime<Utc>) -> bool {
    state(agent, settings, now) != CircuitState::Open
}

/// Returns true when this failure opened the circuit.
pub fn record_failure(agent: &mut Agent, settings: &ClusterSettings, at: DateTime<Utc>) -> bool {
    agent.consecutive_failures = agent.consecutive_failures.saturating_add(1);
    if agent.consecutive_failures >= settings.circuit_failure_threshold {
        let cooldown = Duration::seconds(settings.circuit_cooldown_secs.min(i64::MAX as u64) as i64);
        agent.excluded_until = Some(at + cooldown);
        return true;
    }
    false
}

pub fn record_success(agent: &mut Agent) {
    agent.consecutive_failures = 0;
    agent.excluded_until = None;
}
