use async_trait::async_trait;
use crate::error::RaftError;
use shared::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use shared::types::NodeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Client side of the node-to-node RPCs.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse, RaftError>;
    async fn append_entries(&self, target: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError>;
    async fn install_snapshot(&self, target: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError>;
}

/// Server side of the node-to-node RPCs.
#[async_trait]
pub trait RaftService: Send + Sync + 'static {
    async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse, RaftError>;
    async fn handle_append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError>;
    async fn handle_install_snapshot(&self, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError>;
}

/// In-process message fabric used by tests and single-binary clusters.
/// Links can be cut to simulate partitions and nodes taken down to simulate
/// crashes.
#[derive(Default)]
pub struct InMemoryRouter {
    nodes: RwLock<HashMap<NodeId, Arc<dyn RaftService>>>,
    down: RwLock<HashSet<NodeId>>,
    cut_links: RwLock<HashSet<(NodeId, NodeId)>>,
}

impl InMemoryRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, node_id: NodeId, service: Arc<dyn RaftService>) {
        self.nodes.write().await.insert(node_id, service);
        self.down.write().await.remove(&node_id);
    }

    /// Stop delivering anything to or from `node_id`.
    pub async fn take_down(&self, node_id: NodeId) {
        self.down.write().await.insert(node_id);
    }

    pub async fn bring_up(&self, node_id: NodeId) {
        self.down.write().await.remove(&node_id);
    }

    /// Cut every link between the two groups.
    pub async fn partition(&self, left: &[NodeId], right: &[NodeId]) {
        let mut cut = self.cut_links.write().await;
        for a in left {
            for b in right {
                cut.insert((*a, *b));
                cut.insert((*b, *a));
            }
        }
    }

    pub async fn heal(&self) {
        self.cut_links.write().await.clear();
    }

    async fn route(&self, from: NodeId, to: NodeId) -> Result<Arc<dyn RaftService>, RaftError> {
        {
            let down = self.down.read().await;
            if down.contains(&from) || down.contains(&to) {
                return Err(RaftError::Network(format!("node {} unreachable", to)));
            }
        }
        if self.cut_links.read().await.contains(&(from, to)) {
            return Err(RaftError::Network(format!("link {} -> {} is cut", from, to)));
        }
        self.nodes
            .read()
            .await
            .get(&to)
            .cloned()
            .ok_or_else(|| RaftError::Network(format!("unknown node {}", to)))
    }

    pub fn network(self: &Arc<Self>, from: NodeId) -> InMemoryNetwork {
        InMemoryNetwork {
            from,
            router: Arc::clone(self),
        }
    }
}

pub struct InMemoryNetwork {
    from: NodeId,
    router: Arc<InMemoryRouter>,
}

#[async_trait]
impl Network for InMemoryNetwork {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse, RaftError> {
        let service = self.router.route(self.from, target).await?;
        let resp = service.handle_request_vote(req).await?;
        // Replies cross the same link, so a partition formed mid-call drops them.
        self.router.route(target, self.from).await?;
        Ok(resp)
    }

    async fn append_entries(&self, target: NodeId, req: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let service = self.router.route(self.from, target).await?;
        let resp = service.handle_append_entries(req).await?;
        self.router.route(target, self.from).await?;
        Ok(resp)
    }

    async fn install_snapshot(&self, target: NodeId, req: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let service = self.router.route(self.from, target).await?;
        let resp = service.handle_install_snapshot(req).await?;
        self.router.route(target, self.from).await?;
        Ok(resp)
    }
}
