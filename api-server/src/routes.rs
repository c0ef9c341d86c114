use crate::error::ApiError;
use axum::{
    extract::{OriginalUri, Path, State},
    http::{StatusCode, Uri},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use orchestrator::{Coordinator, OrchestratorError, WorkflowView};
use raft_core::{ConsensusStatus, Network, RaftService, Storage};
use serde::{Deserialize, Serialize};
use shared::messages::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use shared::types::{
    Agent, AgentId, AgentStatus, ClusterSettings, NodeId, Task, TaskResult, WorkflowId, WorkflowSubmission,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub struct AppState<S, N> {
    coordinator: Coordinator<S, N>,
    peer_urls: Arc<HashMap<NodeId, String>>,
}

impl<S, N> Clone for AppState<S, N> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            peer_urls: Arc::clone(&self.peer_urls),
        }
    }
}

impl<S, N> AppState<S, N>
where
    S: Storage,
    N: Network,
{
    pub fn new(coordinator: Coordinator<S, N>, peer_urls: HashMap<NodeId, String>) -> Self {
        Self {
            coordinator,
            peer_urls: Arc::new(peer_urls),
        }
    }

    /// Point a rejected write at the same path on the leader.
    fn reject(&self, err: OrchestratorError, uri: &Uri) -> ApiError {
        match ApiError::from(err) {
            ApiError::NotLeader { leader_hint, .. } => {
                let location = leader_hint.and_then(|id| self.peer_urls.get(&id)).map(|base| {
                    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
                    format!("{}{}", base, path)
                });
                ApiError::NotLeader { leader_hint, location }
            }
            other => other,
        }
    }
}

pub fn router<S, N>(state: AppState<S, N>) -> Router
where
    S: Storage,
    N: Network,
{
    Router::new()
        .route("/agents/register", post(register_agent::<S, N>))
        .route("/agents", get(list_agents::<S, N>))
        .route("/agents/:id", get(get_agent::<S, N>).delete(deregister_agent::<S, N>))
        .route("/agents/:id/heartbeat", post(heartbeat::<S, N>))
        .route("/agents/:id/tasks", get(agent_tasks::<S, N>))
        .route("/workflows", post(submit_workflow::<S, N>))
        .route("/workflows/:id", get(workflow_status::<S, N>))
        .route("/tasks/:id", get(task_status::<S, N>))
        .route("/tasks/:id/start", post(start_task::<S, N>))
        .route("/tasks/:id/result", post(report_result::<S, N>))
        .route("/settings", get(get_settings::<S, N>).put(update_settings::<S, N>))
        .route("/consensus/status", get(consensus_status::<S, N>))
        .route("/health", get(health_check::<S, N>))
        .route("/raft/vote", post(raft_vote::<S, N>))
        .route("/raft/append", post(raft_append::<S, N>))
        .route("/raft/snapshot", post(raft_snapshot::<S, N>))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterRequest {
    endpoint: String,
    #[serde(default)]
    capabilities: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterResponse {
    agent_id: AgentId,
}

#[derive(Deserialize, Default)]
struct HeartbeatRequest {
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct HeartbeatResponse {
    status: AgentStatus,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    workflow_id: WorkflowId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    agent_id: AgentId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultRequest {
    agent_id: AgentId,
    success: bool,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct ResultResponse {
    recorded: bool,
}

/// Partial settings update; omitted fields keep their replicated value.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SettingsPatch {
    rebalance_threshold: Option<f64>,
    circuit_failure_threshold: Option<u32>,
    circuit_cooldown_secs: Option<u64>,
    max_task_attempts: Option<u32>,
}

impl SettingsPatch {
    fn merge_into(self, mut settings: ClusterSettings) -> ClusterSettings {
        if let Some(v) = self.rebalance_threshold {
            settings.rebalance_threshold = v;
        }
        if let Some(v) = self.circuit_failure_threshold {
            settings.circuit_failure_threshold = v;
        }
        if let Some(v) = self.circuit_cooldown_secs {
            settings.circuit_cooldown_secs = v;
        }
        if let Some(v) = self.max_task_attempts {
            settings.max_task_attempts = v;
        }
        settings
    }
}

async fn health_check<S: Storage, N: Network>(State(state): State<AppState<S, N>>) -> Json<serde_json::Value> {
    let status = state.coordinator.consensus_status();
    Json(serde_json::json!({
        "status": "healthy",
        "nodeId": status.node_id,
        "role": status.role,
    }))
}

async fn register_agent<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if req.endpoint.trim().is_empty() {
        return Err(ApiError::BadRequest("endpoint is required".into()));
    }
    let agent_id = state
        .coordinator
        .register_agent(req.endpoint, req.capabilities)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { agent_id })))
}

async fn list_agents<S: Storage, N: Network>(State(state): State<AppState<S, N>>) -> Json<Vec<Agent>> {
    Json(state.coordinator.list_agents().await)
}

async fn get_agent<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Path(id): Path<AgentId>,
) -> Result<Json<Agent>, ApiError> {
    Ok(Json(state.coordinator.get_agent(id).await?))
}

async fn deregister_agent<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<AgentId>,
) -> Result<StatusCode, ApiError> {
    state
        .coordinator
        .deregister_agent(id)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<AgentId>,
    body: Option<Json<HeartbeatRequest>>,
) -> Result<Json<HeartbeatResponse>, ApiError> {
    let timestamp = body.and_then(|Json(req)| req.timestamp);
    let status = state
        .coordinator
        .heartbeat(id, timestamp)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok(Json(HeartbeatResponse { status }))
}

async fn agent_tasks<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Path(id): Path<AgentId>,
) -> Result<Json<Vec<Task>>, ApiError> {
    Ok(Json(state.coordinator.agent_tasks(id).await?))
}

async fn submit_workflow<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Json(req): Json<WorkflowSubmission>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let workflow_id = state
        .coordinator
        .submit_workflow(req)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { workflow_id })))
}

async fn workflow_status<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Path(id): Path<String>,
) -> Result<Json<WorkflowView>, ApiError> {
    Ok(Json(state.coordinator.workflow_status(&id).await?))
}

async fn task_status<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Path(id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.coordinator.task_status(&id).await?))
}

async fn start_task<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<String>,
    Json(req): Json<StartRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .coordinator
        .start_task(&id, req.agent_id)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn report_result<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Path(id): Path<String>,
    Json(req): Json<ResultRequest>,
) -> Result<Json<ResultResponse>, ApiError> {
    let result = TaskResult {
        task_id: id,
        agent_id: req.agent_id,
        success: req.success,
        output: req.output,
        error: req.error,
    };
    let recorded = state
        .coordinator
        .report_result(result)
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok(Json(ResultResponse { recorded }))
}

async fn get_settings<S: Storage, N: Network>(State(state): State<AppState<S, N>>) -> Json<ClusterSettings> {
    Json(state.coordinator.settings().await)
}

async fn update_settings<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    OriginalUri(uri): OriginalUri,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<ClusterSettings>, ApiError> {
    let settings = patch.merge_into(state.coordinator.settings().await);
    state
        .coordinator
        .update_settings(settings.clone())
        .await
        .map_err(|e| state.reject(e, &uri))?;
    Ok(Json(settings))
}

async fn consensus_status<S: Storage, N: Network>(State(state): State<AppState<S, N>>) -> Json<ConsensusStatus> {
    Json(state.coordinator.consensus_status())
}

async fn raft_vote<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Json(req): Json<VoteRequest>,
) -> Result<Json<VoteResponse>, ApiError> {
    Ok(Json(state.coordinator.node().handle_request_vote(req).await?))
}

async fn raft_append<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Json(req): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, ApiError> {
    Ok(Json(state.coordinator.node().handle_append_entries(req).await?))
}

async fn raft_snapshot<S: Storage, N: Network>(
    State(state): State<AppState<S, N>>,
    Json(req): Json<InstallSnapshotRequest>,
) -> Result<Json<InstallSnapshotResponse>, ApiError> {
    Ok(Json(state.coordinator.node().handle_install_snapshot(req).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use orchestrator::{ClusterState, CoordinatorConfig};
    use raft_core::{InMemoryNetwork, InMemoryRouter, InMemoryStorage, RaftConfig, RaftNode};
    use std::time::Duration;
    use tower::ServiceExt;

    type TestState = AppState<InMemoryStorage, InMemoryNetwork>;

    async fn cluster(size: u64) -> Vec<TestState> {
        let router = InMemoryRouter::new();
        let ids: Vec<NodeId> = (1..=size).collect();
        let urls: HashMap<NodeId, String> = ids.iter().map(|id| (*id, format!("http://node{}:3000", id))).collect();

        let mut states = Vec::new();
        for id in &ids {
            let node = RaftNode::new(
                *id,
                ids.clone(),
                RaftConfig::default(),
                InMemoryStorage::new(),
                router.network(*id),
                ClusterState::new(),
            );
            router.register(*id, Arc::new(node.clone()) as Arc<dyn RaftService>).await;
            let coordinator = Coordinator::new(node, CoordinatorConfig::default());
            coordinator.start().await.unwrap();
            states.push(AppState::new(coordinator, urls.clone()));
        }
        states
    }

    async fn leader_of(states: &[TestState]) -> TestState {
        loop {
            if let Some(state) = states.iter().find(|s| s.coordinator.node().is_leader()) {
                // Let followers learn who leads.
                tokio::time::sleep(Duration::from_millis(200)).await;
                return state.clone();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn register_submit_and_inspect() {
        let states = cluster(1).await;
        let leader = leader_of(&states).await;
        let app = router(leader.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/agents/register",
                serde_json::json!({ "endpoint": "http://worker", "capabilities": ["etl"] }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let agent_id = body_json(response).await["agentId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/workflows",
                serde_json::json!({
                    "id": "wf-1",
                    "tasks": [{ "id": "extract", "requiredCapabilities": ["etl"], "priority": 2 }],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["workflowId"], "wf-1");

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/workflows/wf-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let view = body_json(response).await;
        assert_eq!(view["workflow"]["id"], "wf-1");
        assert_eq!(view["tasks"][0]["id"], "extract");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/agents/{}/heartbeat", agent_id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "Alive");

        let response = app
            .oneshot(Request::builder().uri("/consensus/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = body_json(response).await;
        assert_eq!(status["leaderId"], 1);
        assert_eq!(status["clusterSize"], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_resources_are_not_found() {
        let states = cluster(1).await;
        let app = router(leader_of(&states).await);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/tasks/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(json_request(
                "POST",
                &format!("/agents/{}/heartbeat", uuid::Uuid::new_v4()),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn cyclic_workflow_is_a_bad_request() {
        let states = cluster(1).await;
        let app = router(leader_of(&states).await);

        let response = app
            .oneshot(json_request(
                "POST",
                "/workflows",
                serde_json::json!({
                    "tasks": [{ "id": "a" }, { "id": "b" }],
                    "dependencies": [
                        { "task": "a", "dependsOn": "b" },
                        { "task": "b", "dependsOn": "a" }
                    ],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_redirects_writes_to_leader() {
        let states = cluster(3).await;
        let leader = leader_of(&states).await;
        let leader_id = leader.coordinator.node().id();
        let follower = states
            .iter()
            .find(|s| s.coordinator.node().id() != leader_id)
            .unwrap()
            .clone();

        let response = router(follower)
            .oneshot(json_request(
                "POST",
                "/agents/register",
                serde_json::json!({ "endpoint": "http://worker" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            format!("http://node{}:3000/agents/register", leader_id).as_str()
        );
        assert_eq!(body_json(response).await["leaderHint"], leader_id);
    }

    #[tokio::test(start_paused = true)]
    async fn settings_round_trip_through_the_log() {
        let states = cluster(1).await;
        let app = router(leader_of(&states).await);

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/settings", serde_json::json!({ "rebalanceThreshold": 2.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/settings", serde_json::json!({ "maxTaskAttempts": 7 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["rebalanceThreshold"], 2.0);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/settings").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let settings = body_json(response).await;
        assert_eq!(settings["maxTaskAttempts"], 7);
        assert_eq!(settings["rebalanceThreshold"], 2.0);
        assert_eq!(settings["circuitFailureThreshold"], 3);

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/settings", serde_json::json!({ "maxTaskAttempts": 0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(json_request("PUT", "/settings", serde_json::json!({ "maxAttempts": 9 })))
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }
}
