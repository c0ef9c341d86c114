use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use orchestrator::OrchestratorError;
use raft_core::RaftError;
use shared::types::NodeId;
use std::time::Duration;
use thiserror::Error;

const NO_LEADER_RETRY: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("not the leader")]
    NotLeader {
        leader_hint: Option<NodeId>,
        location: Option<String>,
    },

    #[error("quorum unavailable")]
    QuorumUnavailable { retry_after: Duration },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotLeader { leader_hint } => ApiError::NotLeader {
                leader_hint,
                location: None,
            },
            OrchestratorError::QuorumUnavailable { retry_after } => ApiError::QuorumUnavailable { retry_after },
            OrchestratorError::AgentNotFound(_)
            | OrchestratorError::WorkflowNotFound(_)
            | OrchestratorError::TaskNotFound(_) => ApiError::NotFound(err.to_string()),
            OrchestratorError::InvalidWorkflow(_) | OrchestratorError::InvalidSettings(_) => {
                ApiError::BadRequest(err.to_string())
            }
            OrchestratorError::Conflict(_) => ApiError::Conflict(err.to_string()),
            OrchestratorError::Consensus(inner) => inner.into(),
            OrchestratorError::AgentUnreachable { .. } | OrchestratorError::Serialization(_) => {
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl From<RaftError> for ApiError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { leader_hint } => ApiError::NotLeader {
                leader_hint,
                location: None,
            },
            RaftError::QuorumUnavailable { retry_after } => ApiError::QuorumUnavailable { retry_after },
            RaftError::Stopped => ApiError::QuorumUnavailable {
                retry_after: NO_LEADER_RETRY,
            },
            other => ApiError::Internal(other.to_string()),
        }
    }
}

fn retry_after_header(after: Duration) -> HeaderValue {
    let secs = after.as_secs() + u64::from(after.subsec_nanos() > 0);
    HeaderValue::from(secs.max(1))
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotLeader {
                leader_hint,
                location: Some(location),
            } => {
                let body = Json(serde_json::json!({
                    "error": "not the leader",
                    "leaderHint": leader_hint,
                    "location": location,
                }));
                let mut response = (StatusCode::TEMPORARY_REDIRECT, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&location) {
                    response.headers_mut().insert(header::LOCATION, value);
                }
                response
            }
            // No known leader yet: an election is in progress.
            ApiError::NotLeader { leader_hint, location: None } => {
                let body = Json(serde_json::json!({
                    "error": "no leader available",
                    "leaderHint": leader_hint,
                }));
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, retry_after_header(NO_LEADER_RETRY));
                response
            }
            ApiError::QuorumUnavailable { retry_after } => {
                let body = Json(serde_json::json!({
                    "error": "quorum unavailable",
                    "retryAfterMs": retry_after.as_millis() as u64,
                }));
                let mut response = (StatusCode::SERVICE_UNAVAILABLE, body).into_response();
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, retry_after_header(retry_after));
                response
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": message }))).into_response(),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": message }))).into_response()
            }
            ApiError::Conflict(message) => (StatusCode::CONFLICT, Json(serde_json::json!({ "error": message }))).into_response(),
            ApiError::Internal(message) => {
                tracing::error!("Request failed: {}", message);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::json!({ "error": message }))).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_carries_location() {
        let response = ApiError::NotLeader {
            leader_hint: Some(2),
            location: Some("http://n2:3000/workflows".into()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "http://n2:3000/workflows");
    }

    #[test]
    fn quorum_loss_sets_retry_after() {
        let response = ApiError::QuorumUnavailable {
            retry_after: Duration::from_millis(2500),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn domain_errors_map_to_client_statuses() {
        let not_found: ApiError = OrchestratorError::TaskNotFound("t".into()).into();
        assert_eq!(not_found.into_response().status(), StatusCode::NOT_FOUND);

        let invalid: ApiError = OrchestratorError::InvalidWorkflow("cycle".into()).into();
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

        let leaderless: ApiError = OrchestratorError::NotLeader { leader_hint: None }.into();
        assert_eq!(leaderless.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
