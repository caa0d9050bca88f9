use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::db::models::{Notification, NotificationStatus};
use crate::db::repository::NotificationRepository;
use crate::error::{AppError, AppResult};
use crate::routes::auth::AuthUser;
use crate::services::dispatcher::{BatchOptions, DispatchOutcome};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_notifications))
        .route("/dispatch", post(dispatch_notification))
        .route("/batch", post(dispatch_batch))
        .route("/:id/read", post(mark_read))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNotificationsQuery {
    pub status: Option<NotificationStatus>,
    pub notification_type: Option<String>,
    /// Opaque `created_at_ms:id` pair from the previous page.
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsListResponse {
    pub items: Vec<Notification>,
    pub next_cursor: Option<String>,
    pub unread_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification: Option<Notification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub user_ids: Vec<String>,
    pub template: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub options: BatchOptions,
}

fn parse_cursor(cursor: &str) -> AppResult<(i64, String)> {
    let (ms, id) = cursor
        .split_once(':')
        .ok_or_else(|| AppError::BadRequest("malformed cursor".to_string()))?;
    let ms = ms
        .parse()
        .map_err(|_| AppError::BadRequest("malformed cursor".to_string()))?;
    Ok((ms, id.to_string()))
}

// ============================================================================
// Handlers
// ============================================================================

/// Newest-first notification log for the current user.
async fn list_notifications(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListNotificationsQuery>,
) -> AppResult<Json<NotificationsListResponse>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let cursor = query.cursor.as_deref().map(parse_cursor).transpose()?;

    let items = NotificationRepository::find_by_user(
        &state.db,
        &user_id,
        query.status,
        query.notification_type.as_deref(),
        cursor,
        limit,
    )
    .await?;

    let next_cursor = (items.len() as i64 == limit)
        .then(|| items.last().map(|n| format!("{}:{}", n.created_at_ms, n.id)))
        .flatten();
    let unread_count = NotificationRepository::count_unread(&state.db, &user_id).await?;

    Ok(Json(NotificationsListResponse {
        items,
        next_cursor,
        unread_count,
    }))
}

/// Entry point for the rest of the backend to dispatch a notification.
async fn dispatch_notification(
    State(state): State<Arc<AppState>>,
    AuthUser(_caller): AuthUser,
    Json(request): Json<crate::db::models::NotificationRequest>,
) -> AppResult<Json<DispatchResponse>> {
    let outcome = state.dispatcher.send(request).await?;

    Ok(Json(match outcome {
        DispatchOutcome::Dispatched(notification) => DispatchResponse {
            status: "dispatched",
            notification: Some(notification),
            scheduled_for_ms: None,
        },
        DispatchOutcome::Scheduled { scheduled_for_ms } => DispatchResponse {
            status: "scheduled",
            notification: None,
            scheduled_for_ms: Some(scheduled_for_ms),
        },
    }))
}

async fn dispatch_batch(
    State(state): State<Arc<AppState>>,
    AuthUser(_caller): AuthUser,
    Json(request): Json<BatchRequest>,
) -> AppResult<Json<crate::db::models::NotificationBatch>> {
    if request.user_ids.is_empty() {
        return Err(AppError::BadRequest("userIds must not be empty".to_string()));
    }

    let batch = state
        .dispatcher
        .send_batch(
            &request.user_ids,
            &request.template,
            request.data,
            request.options,
        )
        .await?;
    Ok(Json(batch))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> AppResult<Json<Notification>> {
    let notification = state.dispatcher.mark_read(&user_id, &id).await?;
    Ok(Json(notification))
}
