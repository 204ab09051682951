use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::webhook::{gmail_notification, GraphNotificationBatch, PubSubEnvelope};
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlookQuery {
    pub validation_token: Option<String>,
}

/// POST /webhooks/outlook
///
/// Graph validates a new notification URL by posting a `validationToken`
/// that must be echoed back as plain text within ten seconds.
pub async fn outlook(
    State(state): State<AppState>,
    Query(query): Query<OutlookQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if let Some(token) = query.validation_token {
        tracing::info!("Answering Graph subscription validation");
        return Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            token,
        )
            .into_response());
    }

    let batch: GraphNotificationBatch = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed notification batch: {}", e)))?;
    let notifications = batch.value.into_iter().map(Into::into).collect();
    let outcome = state.webhooks.handle_notifications(notifications).await?;
    tracing::debug!(?outcome, "Graph notifications handled");
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Deserialize)]
pub struct GmailQuery {
    pub token: Option<String>,
}

/// POST /webhooks/gmail
pub async fn gmail(
    State(state): State<AppState>,
    Query(query): Query<GmailQuery>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let envelope: PubSubEnvelope = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("malformed push envelope: {}", e)))?;

    // Undecodable pushes are acknowledged so Pub/Sub stops redelivering them.
    let Some(notification) = gmail_notification(&envelope, query.token) else {
        tracing::warn!(
            message_id = ?envelope.message.message_id,
            "Dropping undecodable Gmail push"
        );
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    let outcome = state
        .webhooks
        .handle_notifications(vec![notification])
        .await?;
    tracing::debug!(?outcome, "Gmail push handled");
    Ok(StatusCode::NO_CONTENT.into_response())
}
