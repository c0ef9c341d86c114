use async_trait::async_trait;
use raft_core::{Network, RaftError};
use serde::{de::DeserializeOwned, Serialize};
use shared::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use shared::types::NodeId;
use std::collections::HashMap;
use std::time::Duration;

/// Node-to-node RPC over the peers' `/raft/*` HTTP routes.
pub struct HttpNetwork {
    client: reqwest::Client,
    peers: HashMap<NodeId, String>,
}

impl HttpNetwork {
    /// `timeout` caps every request; callers apply tighter per-RPC limits.
    pub fn new(peers: HashMap<NodeId, String>, timeout: Duration) -> Result<Self, RaftError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RaftError::Network(e.to_string()))?;
        Ok(Self { client, peers })
    }

    async fn call<Req, Resp>(&self, target: NodeId, rpc: &str, req: &Req) -> Result<Resp, RaftError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let base = self
            .peers
            .get(&target)
            .ok_or_else(|| RaftError::Network(format!("unknown peer {}", target)))?;
        let response = self
            .client
            .post(format!("{}/raft/{}", base, rpc))
            .json(req)
            .send()
            .await
            .map_err(|e| RaftError::Network(format!("{} to {}: {}", rpc, target, e)))?;

        if !response.status().is_success() {
            return Err(RaftError::Network(format!(
                "{} to {} answered {}",
                rpc,
                target,
                response.status()
            )));
        }
        response
            .json::<Resp>()
            .await
            .map_err(|e| RaftError::Network(format!("{} from {}: {}", rpc, target, e)))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse, RaftError> {
        self.call(target, "vote", &req).await
    }

    async fn append_entries(&self, target: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        self.call(target, "append", &req).await
    }

    async fn install_snapshot(&self, target: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        self.call(target, "snapshot", &req).await
    }
}
