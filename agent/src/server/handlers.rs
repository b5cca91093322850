//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Maps [`AgentError`] onto an HTTP status
pub struct ApiError(AgentError);

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AgentError::NotFound(_) => StatusCode::NOT_FOUND,
            AgentError::Conflict(_) => StatusCode::CONFLICT,
            AgentError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AgentError::NotConnected | AgentError::Timeout(_) | AgentError::MqttError(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub broker_connected: bool,
    pub online_branches: usize,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "patch-coordinator".to_string(),
        version: version.version,
        broker_connected: state.transport.is_connected(),
        online_branches: state.presence.online_branches().len(),
    })
}

/// Multi-branch deploy request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub branch_ids: Vec<String>,
    pub patch_id: String,
    pub user_id: String,
}

/// Deploy handler
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<DeployRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.branch_ids.is_empty() {
        return Err(AgentError::ValidationError("branchIds must not be empty".to_string()).into());
    }

    let summary = state
        .coordinator
        .deploy_many(&request.branch_ids, &request.patch_id, &request.user_id)
        .await;
    Ok(Json(summary))
}

/// Schedule request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub branch_id: String,
    pub patch_id: String,
    pub user_id: String,
    pub scheduled_at: DateTime<Utc>,
}

/// Schedule handler
pub async fn schedule_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ScheduleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let enrollment = state
        .coordinator
        .schedule(
            &request.branch_id,
            &request.patch_id,
            &request.user_id,
            request.scheduled_at,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(enrollment)))
}

/// Job handler
pub async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state
        .coordinator
        .store()
        .get_job(&job_id)
        .await?
        .ok_or_else(|| AgentError::NotFound(format!("Job {}", job_id)))?;
    Ok(Json(job))
}

/// Enrollment handler
pub async fn enrollment_handler(
    State(state): State<Arc<ServerState>>,
    Path((branch_id, patch_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let enrollment = state
        .coordinator
        .store()
        .get_enrollment(&branch_id, &patch_id)
        .await?
        .ok_or_else(|| AgentError::NotFound(format!("Enrollment {}/{}", branch_id, patch_id)))?;
    Ok(Json(enrollment))
}
