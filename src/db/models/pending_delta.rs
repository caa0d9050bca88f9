use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::Create => "create",
            SyncOperation::Update => "update",
            SyncOperation::Delete => "delete",
        }
    }
}

/// A client-originated mutation intent. The change id is client-assigned and
/// unique per (user, device); the server stamps the authoritative timestamp
/// on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncChange {
    pub change_id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: SyncOperation,

    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(rename = "clientTimestamp")]
    pub client_timestamp_ms: i64,
}

/// Server-authoritative record of an accepted change, kept until the
/// retention bound so other devices can reconcile. Ordered per user by
/// server timestamp.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PendingDelta {
    pub id: String,
    pub user_id: String,
    pub change_id: String,
    pub device_id: String,
    pub entity_kind: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: String,
    pub client_timestamp_ms: i64,
    pub server_timestamp_ms: i64,
}

impl PendingDelta {
    pub fn payload_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or_else(|_| serde_json::json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_change_parses_wire_payload() {
        let change: SyncChange = serde_json::from_value(serde_json::json!({
            "changeId": "c-1",
            "entityKind": "entry",
            "entityId": "E1",
            "operation": "update",
            "payload": { "title": "x" },
            "clientTimestamp": 1750000000000i64
        }))
        .unwrap();

        assert_eq!(change.operation, SyncOperation::Update);
        assert_eq!(change.client_timestamp_ms, 1750000000000);
        assert_eq!(change.payload["title"], "x");
    }
}
