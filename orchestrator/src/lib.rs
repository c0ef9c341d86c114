pub mod circuit_breaker;
pub mod command;
pub mod coordinator;
pub mod distributor;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod state;
pub mod workflow;

pub use circuit_breaker::CircuitState;
pub use command::Command;
pub use coordinator::{Coordinator, CoordinatorConfig, WorkflowView};
pub use distributor::Assignment;
pub use error::OrchestratorError;
pub use monitor::{FaultMonitor, MonitorAction, MonitorConfig};
pub use registry::AgentRegistry;
pub use state::ClusterState;
pub use workflow::TaskTable;
