use crate::error::RaftError;
use shared::types::LogEntry;

/// Deterministic consumer of committed entries.
///
/// Every node applies the same entries in the same order, so `apply` must not
/// read clocks, randomness or node-local state.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&mut self, entry: &LogEntry);

    fn snapshot(&self) -> Result<Vec<u8>, RaftError>;

    fn restore(&mut self, data: &[u8]) -> Result<(), RaftError>;
}
