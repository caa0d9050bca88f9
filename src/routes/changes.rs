use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::Deserialize;

use crate::db::models::SyncChange;
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/changes", post(publish_change))
}

/// A mutation the external CRUD API already persisted and authorized,
/// published here for realtime fan-out and offline reconciliation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishChangeBody {
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub change: SyncChange,
}

async fn publish_change(
    State(state): State<Arc<AppState>>,
    AuthUser(_caller): AuthUser,
    Json(body): Json<PublishChangeBody>,
) -> AppResult<Json<serde_json::Value>> {
    let delta = state
        .sync
        .publish(&body.user_id, body.device_id.as_deref(), body.change)
        .await?;

    Ok(Json(serde_json::json!({
        "changeId": delta.change_id,
        "serverTimestamp": delta.server_timestamp_ms,
    })))
}
