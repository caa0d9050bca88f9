use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    System,
    Sync,
    Presence,
    Notification,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAction {
    Subscribe,
    Unsubscribe,
    Sync,
    Presence,
    Create,
    Update,
    Delete,
    Ping,
    Pong,
    Ack,
    Error,
}

/// The single message shape on the live transport, in both directions.
/// Server-initiated data broadcasts additionally carry the originating
/// user in `userId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub action: MessageAction,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Envelope {
    pub fn server(kind: MessageKind, action: MessageAction, payload: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            kind,
            action,
            payload,
            timestamp: Utc::now(),
            correlation_id: None,
            user_id: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn with_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn ack(correlation_id: &str, payload: serde_json::Value) -> Self {
        Self::server(MessageKind::System, MessageAction::Ack, payload)
            .with_correlation(correlation_id)
    }

    pub fn error(correlation_id: &str, code: &str, message: &str) -> Self {
        Self::server(
            MessageKind::System,
            MessageAction::Error,
            serde_json::json!({ "code": code, "message": message }),
        )
        .with_correlation(correlation_id)
    }

    pub fn pong(correlation_id: &str) -> Self {
        Self::server(MessageKind::System, MessageAction::Pong, serde_json::json!({}))
            .with_correlation(correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_wire_shape() {
        let parsed: Envelope = serde_json::from_value(serde_json::json!({
            "id": "m-1",
            "type": "data",
            "action": "update",
            "payload": { "entityKind": "entry", "entityId": "E1" },
            "timestamp": "2026-03-01T12:00:00Z",
            "correlationId": "c-9"
        }))
        .unwrap();

        assert_eq!(parsed.kind, MessageKind::Data);
        assert_eq!(parsed.action, MessageAction::Update);
        assert_eq!(parsed.correlation_id.as_deref(), Some("c-9"));

        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["type"], "data");
        assert_eq!(out["correlationId"], "c-9");
        // Absent optionals stay off the wire.
        assert!(out.get("userId").is_none());
    }

    #[test]
    fn ack_builder_carries_correlation() {
        let ack = Envelope::ack("m-1", serde_json::json!({ "success": true }));
        assert_eq!(ack.kind, MessageKind::System);
        assert_eq!(ack.action, MessageAction::Ack);
        assert_eq!(ack.correlation_id.as_deref(), Some("m-1"));
    }
}
