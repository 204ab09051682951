use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use uuid::Uuid;

use crate::accounts::NewProvider;
use crate::api::error::ApiError;
use crate::queue::SubmitOutcome;
use crate::AppState;

fn submission(outcome: SubmitOutcome) -> serde_json::Value {
    match outcome {
        SubmitOutcome::Enqueued(job_id) => json!({"status": "enqueued", "jobId": job_id}),
        SubmitOutcome::Duplicate => json!({"status": "duplicate"}),
    }
}

/// POST /providers
pub async fn connect(
    State(state): State<AppState>,
    Json(input): Json<NewProvider>,
) -> Result<Response, ApiError> {
    let connected = state.accounts.connect_provider(input).await?;
    let body = json!({
        "provider": connected.provider,
        "subscription": connected.subscription,
        "initialSync": connected.initial_sync.map(submission),
    });
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

/// DELETE /providers/{id}
pub async fn disconnect(
    State(state): State<AppState>,
    Path(provider_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let stats = state
        .accounts
        .disconnect_provider(provider_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("provider {} not found", provider_id)))?;
    Ok(Json(json!({
        "subscriptionsRemoved": stats.subscriptions_removed,
        "linksKept": stats.links_kept,
        "linksDropped": stats.links_dropped,
    }))
    .into_response())
}

/// POST /providers/{id}/sync
pub async fn trigger_sync(
    State(state): State<AppState>,
    Path(provider_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let outcome = state
        .scheduler
        .trigger_manual(provider_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no active provider {}", provider_id)))?;
    Ok((StatusCode::ACCEPTED, Json(submission(outcome))).into_response())
}

/// POST /providers/{id}/folders/sync
pub async fn trigger_folder_sync(
    State(state): State<AppState>,
    Path(provider_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let outcome = state
        .scheduler
        .trigger_folder_sync(provider_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no active provider {}", provider_id)))?;
    Ok((StatusCode::ACCEPTED, Json(submission(outcome))).into_response())
}
