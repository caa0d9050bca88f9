use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Delivery transports a notification can go out on. Distinct from
/// subscription rooms, which route live-session broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChannelKind {
    InApp,
    Email,
    Push,
    Sms,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::InApp => "in_app",
            ChannelKind::Email => "email",
            ChannelKind::Push => "push",
            ChannelKind::Sms => "sms",
        }
    }

    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::InApp,
        ChannelKind::Email,
        ChannelKind::Push,
        ChannelKind::Sms,
    ];
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Delivered,
    Read,
    Expired,
    Failed,
}

impl NotificationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NotificationStatus::Read | NotificationStatus::Expired | NotificationStatus::Failed
        )
    }

    /// Allowed status graph: pending -> delivered -> read, with expired and
    /// failed reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: NotificationStatus) -> bool {
        match next {
            NotificationStatus::Pending => false,
            NotificationStatus::Delivered => *self == NotificationStatus::Pending,
            NotificationStatus::Read => *self == NotificationStatus::Delivered,
            NotificationStatus::Expired | NotificationStatus::Failed => !self.is_terminal(),
        }
    }
}

/// One stored notification. Appended on create; status advances
/// monotonically along the allowed graph.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub notification_type: String,

    /// Primary channel the notification actually went out on, once known.
    pub channel: Option<ChannelKind>,

    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,

    /// Free-form JSON payload rendered into templates and shipped to clients.
    pub data: String,

    /// JSON array of action descriptors, when the caller supplied any.
    pub actions: Option<String>,

    pub expires_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub delivered_at_ms: Option<i64>,
    pub read_at_ms: Option<i64>,
}

impl Notification {
    pub fn data_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or_else(|_| serde_json::json!({}))
    }
}

/// Inbound dispatch request, as accepted over HTTP and on the scheduled
/// notifications queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub user_id: String,
    pub notification_type: String,

    /// Requested channels, in the caller's order. The dispatcher never
    /// reorders them by priority.
    pub channels: Vec<ChannelKind>,

    #[serde(default = "default_priority")]
    pub priority: NotificationPriority,

    pub title: String,
    pub message: String,

    #[serde(default)]
    pub data: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for_ms: Option<i64>,
}

fn default_priority() -> NotificationPriority {
    NotificationPriority::Medium
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_graph_allows_only_documented_transitions() {
        use NotificationStatus::*;

        assert!(Pending.can_transition_to(Delivered));
        assert!(Delivered.can_transition_to(Read));
        assert!(Pending.can_transition_to(Expired));
        assert!(Pending.can_transition_to(Failed));
        assert!(Delivered.can_transition_to(Failed));

        // Terminal states never move again.
        for terminal in [Read, Expired, Failed] {
            for next in [Pending, Delivered, Read, Expired, Failed] {
                assert!(!terminal.can_transition_to(next), "{:?} -> {:?}", terminal, next);
            }
        }

        // Nothing goes back to pending, and read requires delivered first.
        assert!(!Delivered.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Read));
    }

    #[test]
    fn request_accepts_wire_shape() {
        let req: NotificationRequest = serde_json::from_value(serde_json::json!({
            "userId": "u1",
            "notificationType": "security_alert",
            "channels": ["in_app", "email"],
            "priority": "urgent",
            "title": "New login",
            "message": "A new device signed in"
        }))
        .unwrap();

        assert_eq!(req.priority, NotificationPriority::Urgent);
        assert_eq!(req.channels, vec![ChannelKind::InApp, ChannelKind::Email]);
        assert!(req.scheduled_for_ms.is_none());
    }
}
