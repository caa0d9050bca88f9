use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Bookkeeping for one batch dispatch: the user list is sharded onto the
/// jobs queue and workers fold their per-user outcomes into these counters.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub id: String,
    pub template: String,
    pub total: i64,
    pub sent_count: i64,
    pub delivered_count: i64,
    pub failed_count: i64,
    pub read_count: i64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}
