//! Notification scheduling routes.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;

use herald_common::error::AppError;
use herald_common::types::UpdateNotification;

use crate::state::AppState;
use crate::validation::{
    CreateNotificationRequest, CreateNotificationResponse, NotificationStatusResponse, parse_id,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/notify", post(create_notification))
        .route(
            "/notify/{id}",
            get(get_notification_status).delete(cancel_notification),
        )
}

/// POST /notify: Schedule a notification.
async fn create_notification(
    State(state): State<AppState>,
    payload: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> Result<Json<CreateNotificationResponse>, AppError> {
    let Json(request) = payload.map_err(|e| AppError::Validation(e.body_text()))?;
    let new = request.into_new(Utc::now())?;

    let notification_id = state.service.create_notification(new).await?;
    Ok(Json(CreateNotificationResponse { notification_id }))
}

/// GET /notify/{id}: Current status of a notification.
async fn get_notification_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<NotificationStatusResponse>, AppError> {
    let id = parse_id(&id)?;
    let notification_status = state.service.get_notification_status(id).await?;
    Ok(Json(NotificationStatusResponse {
        notification_status,
    }))
}

/// DELETE /notify/{id}: Cancel a scheduled notification.
async fn cancel_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let id = parse_id(&id)?;
    state
        .service
        .update_notification(&UpdateNotification::cancelled(id))
        .await?;

    tracing::info!(notification_id = id, "Notification cancelled");
    Ok(Json(json!({ "message": "notification cancelled" })))
}
