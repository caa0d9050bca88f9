use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::ChannelKind;

/// Outcome of a single channel delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// Accepted by an asynchronous provider; final disposition unknown.
    Sent,
    /// Confirmed on at least one endpoint.
    Delivered,
    Failed,
    /// Provider-reported hard failure; never retried.
    Bounced,
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Sent | DeliveryOutcome::Delivered)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub id: String,
    pub notification_id: String,
    pub channel: ChannelKind,
    pub status: DeliveryOutcome,
    pub error: Option<String>,
    pub sent_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct CreateDeliveryLog {
    pub notification_id: String,
    pub channel: ChannelKind,
    pub status: DeliveryOutcome,
    pub error: Option<String>,
}
