use crate::error::RaftError;
use rand::Rng;
use std::time::Duration;

const ELECTION_TIMEOUT_MIN: u64 = 150;
const ELECTION_TIMEOUT_MAX: u64 = 300;
const HEARTBEAT_INTERVAL: u64 = 50;
const SNAPSHOT_THRESHOLD: u64 = 10_000;

/// Timing and sizing knobs for a consensus node. All durations are in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaftConfig {
    pub election_timeout_min: u64,
    pub election_timeout_max: u64,
    pub heartbeat_interval: u64,
    /// Upper bound on a single node-to-node RPC.
    pub rpc_timeout: u64,
    /// How long `propose` waits for a majority before giving up.
    pub propose_timeout: u64,
    pub max_entries_per_append: usize,
    /// Applied entries kept in the log before a snapshot is taken.
    pub snapshot_threshold: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: ELECTION_TIMEOUT_MIN,
            election_timeout_max: ELECTION_TIMEOUT_MAX,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            rpc_timeout: 100,
            propose_timeout: 2_000,
            max_entries_per_append: 256,
            snapshot_threshold: SNAPSHOT_THRESHOLD,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), RaftError> {
        if self.election_timeout_min == 0 || self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::Configuration(format!(
                "election timeout range {}..{} is empty",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::Configuration(format!(
                "heartbeat interval {}ms must be below the minimum election timeout {}ms",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        if self.max_entries_per_append == 0 {
            return Err(RaftError::Configuration("max_entries_per_append must be positive".into()));
        }
        if self.snapshot_threshold == 0 {
            return Err(RaftError::Configuration("snapshot_threshold must be positive".into()));
        }
        Ok(())
    }

    pub fn random_election_timeout(&self) -> Duration {
        let millis = rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(millis)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn max_election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max)
    }

    pub fn rpc(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn propose(&self) -> Duration {
        Duration::from_millis(self.propose_timeout)
    }
}
