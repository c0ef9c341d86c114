pub mod config;
pub mod error;
pub mod file_storage;
pub mod log;
pub mod network;
pub mod raft;
pub mod state;
pub mod state_machine;
pub mod storage;

pub use config::RaftConfig;
pub use error::RaftError;
pub use file_storage::FileStorage;
pub use log::RaftLog;
pub use network::{InMemoryNetwork, InMemoryRouter, Network, RaftService};
pub use raft::{ConsensusStatus, RaftNode};
pub use state::{NodeState, RaftState};
pub use state_machine::StateMachine;
pub use storage::{HardState, InMemoryStorage, Snapshot, Storage};
