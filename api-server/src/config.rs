use clap::Parser;
use orchestrator::{CoordinatorConfig, MonitorConfig};
use raft_core::RaftConfig;
use shared::types::NodeId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "api-server", about = "Consensus-backed agent orchestration node")]
pub struct Config {
    /// Identifier of this node within the cluster.
    #[arg(long, env = "NODE_ID")]
    pub node_id: NodeId,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: SocketAddr,

    /// Cluster members as `id=url`, comma separated. May include this node.
    #[arg(long, env = "PEERS", value_delimiter = ',', value_parser = parse_peer)]
    pub peers: Vec<(NodeId, String)>,

    /// Directory holding the durable log and snapshots.
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    #[arg(long, env = "ELECTION_TIMEOUT_MIN_MS", default_value_t = 150)]
    pub election_timeout_min_ms: u64,

    #[arg(long, env = "ELECTION_TIMEOUT_MAX_MS", default_value_t = 300)]
    pub election_timeout_max_ms: u64,

    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value_t = 50)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, env = "RPC_TIMEOUT_MS", default_value_t = 100)]
    pub rpc_timeout_ms: u64,

    #[arg(long, env = "PROPOSE_TIMEOUT_MS", default_value_t = 2000)]
    pub propose_timeout_ms: u64,

    /// Applied entries kept before the log is compacted into a snapshot.
    #[arg(long, env = "SNAPSHOT_THRESHOLD", default_value_t = 10_000)]
    pub snapshot_threshold: u64,

    #[arg(long, env = "AGENT_HEARTBEAT_INTERVAL_MS", default_value_t = 1000)]
    pub agent_heartbeat_interval_ms: u64,

    #[arg(long, env = "SUSPECT_AFTER_MISSED", default_value_t = 3)]
    pub suspect_after_missed: u32,

    #[arg(long, env = "DEAD_AFTER_MS", default_value_t = 10_000)]
    pub dead_after_ms: u64,

    #[arg(long, env = "REMOVAL_GRACE_MS", default_value_t = 60_000)]
    pub removal_grace_ms: u64,

    #[arg(long, env = "SCAN_INTERVAL_MS", default_value_t = 1000)]
    pub scan_interval_ms: u64,

    #[arg(long, env = "DISTRIBUTION_INTERVAL_MS", default_value_t = 500)]
    pub distribution_interval_ms: u64,
}

fn parse_peer(raw: &str) -> Result<(NodeId, String), String> {
    let (id, url) = raw
        .split_once('=')
        .ok_or_else(|| format!("peer `{}` must look like id=url", raw))?;
    let id = id
        .trim()
        .parse::<NodeId>()
        .map_err(|e| format!("bad peer id in `{}`: {}", raw, e))?;
    let url = url.trim().trim_end_matches('/').to_string();
    if url.is_empty() {
        return Err(format!("peer {} has no url", id));
    }
    Ok((id, url))
}

impl Config {
    pub fn raft_config(&self) -> RaftConfig {
        RaftConfig {
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            heartbeat_interval: self.heartbeat_interval_ms,
            rpc_timeout: self.rpc_timeout_ms,
            propose_timeout: self.propose_timeout_ms,
            snapshot_threshold: self.snapshot_threshold,
            ..RaftConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            monitor: MonitorConfig {
                heartbeat_interval: Duration::from_millis(self.agent_heartbeat_interval_ms),
                suspect_after_missed: self.suspect_after_missed,
                dead_after: Duration::from_millis(self.dead_after_ms),
                removal_grace: Duration::from_millis(self.removal_grace_ms),
                scan_interval: Duration::from_millis(self.scan_interval_ms),
            },
            distribution_interval: Duration::from_millis(self.distribution_interval_ms),
            ..CoordinatorConfig::default()
        }
    }

    /// Base URLs of the other members.
    pub fn peer_urls(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .filter(|(id, _)| *id != self.node_id)
            .cloned()
            .collect()
    }

    /// Every voting member, this node included.
    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.peers.iter().map(|(id, _)| *id).collect();
        members.push(self.node_id);
        members.sort_unstable();
        members.dedup();
        members
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_peer_list_and_defaults() {
        let config = Config::try_parse_from([
            "api-server",
            "--node-id",
            "2",
            "--peers",
            "1=http://n1:3000/,2=http://n2:3000,3=http://n3:3000",
        ])
        .unwrap();

        assert_eq!(config.members(), vec![1, 2, 3]);
        let urls = config.peer_urls();
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[&1], "http://n1:3000");
        assert_eq!(config.raft_config(), RaftConfig::default());
        assert_eq!(config.coordinator_config().monitor, MonitorConfig::default());
    }

    #[test]
    fn rejects_malformed_peers() {
        assert!(parse_peer("http://n1").is_err());
        assert!(parse_peer("x=http://n1").is_err());
        assert!(parse_peer("1=").is_err());
    }
}
