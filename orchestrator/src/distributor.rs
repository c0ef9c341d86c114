//! Assignment planning.
//!
//! Planning is pure and reads only the applied state. The coordinator turns
//! each [`Assignment`] into an `AssignTask` proposal, and the state machine
//! re-checks every guard on apply, so a plan computed against a slightly
//! older state can never produce an invalid assignment.

use crate::registry::AgentRegistry;
use crate::state::ClusterState;
use chrono::{DateTime, Utc};
use shared::types::{Agent, AgentId, AgentStatus, Task, TaskId, TaskStatus};
use std::cmp::Reverse;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub previous: Option<AgentId>,
}

/// Higher priority first, then earlier workflow, then workflow order.
fn dispatch_key(task: &Task) -> (Reverse<i32>, u64, usize, &str) {
    (Reverse(task.priority), task.sequence, task.position, task.id.as_str())
}

fn least_loaded<'a>(
    candidates: impl Iterator<Item = &'a Agent>,
    planned: &BTreeMap<AgentId, u32>,
) -> Option<AgentId> {
    candidates
        .map(|agent| (planned.get(&agent.id).copied().unwrap_or(agent.current_load), agent.id))
        .min()
        .map(|(_, id)| id)
}

/// Match every ready task to the least-loaded eligible agent.
pub fn plan_assignments(state: &ClusterState, now: DateTime<Utc>) -> Vec<Assignment> {
    let registry = state.registry();
    let settings = state.settings();

    let mut ready: Vec<&Task> = state.tasks().ready_tasks().collect();
    ready.sort_by(|a, b| dispatch_key(a).cmp(&dispatch_key(b)));

    let mut planned: BTreeMap<AgentId, u32> = BTreeMap::new();
    let mut plan = Vec::new();
    for task in ready {
        let chosen = least_loaded(registry.eligible(&task.required_capabilities, settings, now), &planned);
        if let Some(agent_id) = chosen {
            let load = planned
                .entry(agent_id)
                .or_insert_with(|| registry.get(&agent_id).map(|a| a.current_load).unwrap_or(0));
            *load += 1;
            plan.push(Assignment {
                task_id: task.id.clone(),
                agent_id,
                previous: None,
            });
        }
    }
    plan
}

/// Move assigned-but-not-started work off agents whose load exceeds
/// `rebalance_threshold` times the cluster average.
pub fn plan_rebalance(state: &ClusterState, now: DateTime<Utc>) -> Vec<Assignment> {
    let registry = state.registry();
    let settings = state.settings();

    let alive: Vec<&Agent> = registry.iter().filter(|a| a.status == AgentStatus::Alive).collect();
    if alive.len() < 2 {
        return Vec::new();
    }
    let total: u32 = alive.iter().map(|a| a.current_load).sum();
    let average = f64::from(total) / alive.len() as f64;
    let limit = settings.rebalance_threshold * average;

    let mut planned: BTreeMap<AgentId, u32> = alive.iter().map(|a| (a.id, a.current_load)).collect();
    let mut plan = Vec::new();

    let mut donors: Vec<&Agent> = alive
        .iter()
        .copied()
        .filter(|a| f64::from(a.current_load) > limit)
        .collect();
    donors.sort_by_key(|a| (Reverse(a.current_load), a.id));

    for donor in donors {
        // Give away the least urgent work first.
        let mut movable: Vec<Task> = state
            .tasks()
            .held_by(&donor.id)
            .into_iter()
            .filter(|t| t.status == TaskStatus::Assigned)
            .collect();
        movable.sort_by(|a, b| dispatch_key(b).cmp(&dispatch_key(a)));

        for task in movable {
            let donor_load = planned.get(&donor.id).copied().unwrap_or(0);
            if f64::from(donor_load) <= average.ceil() {
                break;
            }

            let receivers = alive.iter().copied().filter(|a| {
                a.id != donor.id
                    && AgentRegistry::is_eligible(a, &task.required_capabilities, settings, now)
                    && planned.get(&a.id).copied().unwrap_or(0) + 1 < donor_load
            });
            let chosen = least_loaded(receivers, &planned);

            if let Some(agent_id) = chosen {
                *planned.entry(agent_id).or_insert(0) += 1;
                *planned.entry(donor.id).or_insert(0) -= 1;
                plan.push(Assignment {
                    task_id: task.id.clone(),
                    agent_id,
                    previous: Some(donor.id),
                });
            }
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use raft_core::StateMachine;
    use shared::types::{LogEntry, TaskSpec, WorkflowSpec};
    use uuid::Uuid;

    struct Fixture {
        state: ClusterState,
        index: u64,
        now: DateTime<Utc>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                state: ClusterState::new(),
                index: 0,
                now: Utc::now(),
            }
        }

        fn run(&mut self, command: Command) {
            self.index += 1;
            self.state
                .apply(&LogEntry::new(self.index, 1, command.kind(), command.encode().unwrap()));
        }

        fn agent_with_id(&mut self, agent_id: AgentId, caps: &[&str]) -> AgentId {
            let at = self.now;
            self.run(Command::RegisterAgent {
                agent_id,
                endpoint: "http://agent".into(),
                capabilities: caps.iter().map(|c| c.to_string()).collect(),
                at,
            });
            agent_id
        }

        fn agent(&mut self, caps: &[&str]) -> AgentId {
            self.agent_with_id(Uuid::new_v4(), caps)
        }

        fn workflow(&mut self, id: &str, tasks: &[(&str, i32, &[&str])]) {
            let at = self.now;
            let spec = WorkflowSpec {
                id: id.into(),
                tasks: tasks
                    .iter()
                    .map(|(t, priority, caps)| TaskSpec {
                        id: t.to_string(),
                        required_capabilities: caps.iter().map(|c| c.to_string()).collect(),
                        priority: *priority,
                        payload: serde_json::Value::Null,
                    })
                    .collect(),
                dependencies: Vec::new(),
            };
            self.run(Command::SubmitWorkflow { spec, at });
        }

        fn apply_plan(&mut self, plan: &[Assignment]) {
            for a in plan {
                let at = self.now;
                self.run(Command::AssignTask {
                    task_id: a.task_id.clone(),
                    agent_id: a.agent_id,
                    previous: a.previous,
                    at,
                });
            }
        }
    }

    #[test]
    fn higher_priority_and_older_workflows_go_first() {
        let mut f = Fixture::new();
        f.workflow("w1", &[("low", 0, &[]), ("high", 5, &[])]);
        f.workflow("w2", &[("later", 5, &[])]);
        let only = f.agent(&[]);

        let plan = f.state.tasks().ready_tasks().count();
        assert_eq!(plan, 3);

        let plan = plan_assignments(&f.state, f.now);
        let order: Vec<&str> = plan.iter().map(|a| a.task_id.as_str()).collect();
        assert_eq!(order, vec!["high", "later", "low"]);
        assert!(plan.iter().all(|a| a.agent_id == only));
    }

    #[test]
    fn spreads_work_by_load_with_id_tiebreak() {
        let mut f = Fixture::new();
        let a = f.agent_with_id(Uuid::from_u128(1), &[]);
        let b = f.agent_with_id(Uuid::from_u128(2), &[]);
        f.workflow("w", &[("t1", 0, &[]), ("t2", 0, &[]), ("t3", 0, &[])]);

        let plan = plan_assignments(&f.state, f.now);
        let targets: Vec<AgentId> = plan.iter().map(|p| p.agent_id).collect();
        assert_eq!(targets, vec![a, b, a]);
    }

    #[test]
    fn capability_mismatch_leaves_task_pending() {
        let mut f = Fixture::new();
        let rust = f.agent(&["rust"]);
        f.workflow("w", &[("gpu-job", 0, &["gpu"]), ("build", 0, &["rust"])]);

        let plan = plan_assignments(&f.state, f.now);
        assert_eq!(
            plan,
            vec![Assignment {
                task_id: "build".into(),
                agent_id: rust,
                previous: None
            }]
        );
    }

    #[test]
    fn overloaded_agent_sheds_assigned_work() {
        let mut f = Fixture::new();
        let busy = f.agent(&[]);
        f.workflow("w", &[("t1", 0, &[]), ("t2", 0, &[]), ("t3", 0, &[]), ("t4", 0, &[])]);
        let plan = plan_assignments(&f.state, f.now);
        f.apply_plan(&plan);
        assert_eq!(f.state.registry().get(&busy).unwrap().current_load, 4);

        let idle = f.agent(&[]);
        let moves = plan_rebalance(&f.state, f.now);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.agent_id == idle && m.previous == Some(busy)));

        f.apply_plan(&moves);
        assert_eq!(f.state.registry().get(&busy).unwrap().current_load, 2);
        assert_eq!(f.state.registry().get(&idle).unwrap().current_load, 2);
        assert!(plan_rebalance(&f.state, f.now).is_empty());
    }

    #[test]
    fn balanced_cluster_needs_no_moves() {
        let mut f = Fixture::new();
        f.agent(&[]);
        f.agent(&[]);
        f.workflow("w", &[("t1", 0, &[]), ("t2", 0, &[])]);
        let plan = plan_assignments(&f.state, f.now);
        f.apply_plan(&plan);
        assert!(plan_rebalance(&f.state, f.now).is_empty());
    }
}
