use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One durable queue message. A message is visible to `receive` when its
/// `visible_at_ms` has passed; claiming pushes the deadline out by the
/// queue's visibility timeout and stamps a fresh receipt handle.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub queue: String,
    pub body: String,
    pub enqueued_at_ms: i64,
    pub visible_at_ms: i64,
    pub delivery_count: i64,
    pub receipt_handle: Option<String>,
    pub last_error: Option<String>,
}

/// A message moved to the terminal queue after exceeding redelivery.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub source_queue: String,
    pub body: String,
    pub last_error: Option<String>,
    pub delivery_count: i64,
    pub enqueued_at_ms: i64,
    pub dead_at_ms: i64,
}
