use crate::domain::outbox::OutboxDeadLetter;
use crate::infrastructure::cdc_health::{CdcHealthMonitor, CdcStatus};
use crate::infrastructure::distributed_lock::{DistributedLockManager, LockMetricsSnapshot};
use crate::infrastructure::outbox::{DeadLetterResolution, OutboxRepository};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct AdminState {
    pub outbox: Arc<dyn OutboxRepository>,
    pub cdc: Arc<CdcHealthMonitor>,
    pub locks: Arc<DistributedLockManager>,
    pub instance_id: String,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal(e) => {
                error!(error = %format!("{:#}", e), "Admin request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };

        let body = Json(serde_json::json!({ "error": error_message }));
        (status, body).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub instance_id: String,
    pub locks: LockMetricsSnapshot,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    pub resolved: Option<bool>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResolveDeadLetterRequest {
    #[validate(length(min = 1, max = 100, message = "resolved_by must be 1-100 characters"))]
    pub resolved_by: String,
    #[validate(length(max = 2000, message = "note must be at most 2000 characters"))]
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DeadLettersResponse {
    pub count: usize,
    pub dead_letters: Vec<OutboxDeadLetter>,
}

pub async fn health(State(state): State<AdminState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        instance_id: state.instance_id.clone(),
        locks: state.locks.metrics(),
    })
}

pub async fn list_dead_letters(
    State(state): State<AdminState>,
    Query(query): Query<DeadLetterQuery>,
) -> Result<Json<DeadLettersResponse>, ApiError> {
    let dead_letters = state.outbox.list_dead_letters(query.resolved).await?;
    Ok(Json(DeadLettersResponse {
        count: dead_letters.len(),
        dead_letters,
    }))
}

pub async fn resolve_dead_letter(
    State(state): State<AdminState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ResolveDeadLetterRequest>,
) -> Result<Json<OutboxDeadLetter>, ApiError> {
    request
        .validate()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let resolved_by = request.resolved_by.trim();
    if resolved_by.is_empty() {
        return Err(ApiError::Validation("resolved_by must not be blank".to_string()));
    }

    match state
        .outbox
        .resolve_dead_letter(id, resolved_by, request.note.as_deref(), Utc::now())
        .await?
    {
        DeadLetterResolution::Resolved(letter) => {
            info!(dead_letter_id = %id, saga_id = %letter.saga_id, resolved_by, "Dead letter resolved");
            Ok(Json(letter))
        }
        DeadLetterResolution::AlreadyResolved(letter) => Err(ApiError::Conflict(format!(
            "Dead letter {} was already resolved by {}",
            id,
            letter.resolved_by.as_deref().unwrap_or("unknown")
        ))),
        DeadLetterResolution::NotFound => {
            Err(ApiError::NotFound(format!("Dead letter {} not found", id)))
        }
    }
}

pub async fn cdc_status(State(state): State<AdminState>) -> Json<CdcStatus> {
    Json(state.cdc.get_cdc_status().await)
}
