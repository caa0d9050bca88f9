use std::sync::Arc;

use async_trait::async_trait;

use crate::db::models::{ChannelKind, DeliveryOutcome, Notification, Preferences};
use crate::error::AppResult;
use crate::protocol::{Envelope, MessageAction, MessageKind};
use crate::services::channels::{ChannelAdapter, DeliveryReport};
use crate::services::registry::ConnectionRegistry;
use crate::services::templates::{RenderedPayload, TemplateRenderer};

/// Delivers over the live connection. With no open session the attempt
/// fails with `offline`; the notification stays queryable and shows up in
/// the client's unread set on its next connect.
pub struct InAppAdapter {
    registry: Arc<ConnectionRegistry>,
    renderer: Arc<TemplateRenderer>,
}

impl InAppAdapter {
    pub fn new(registry: Arc<ConnectionRegistry>, renderer: Arc<TemplateRenderer>) -> Self {
        Self { registry, renderer }
    }
}

#[async_trait]
impl ChannelAdapter for InAppAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _preferences: &Preferences,
    ) -> AppResult<DeliveryReport> {
        if self.registry.active_device_count(&notification.user_id) == 0 {
            return Ok(DeliveryReport::failed("offline"));
        }

        let (title, body, data) = match self.renderer.render(notification, ChannelKind::InApp)? {
            RenderedPayload::InApp { title, body, data } => (title, body, data),
            _ => unreachable!("in-app render always yields an in-app payload"),
        };

        let envelope = Envelope::server(
            MessageKind::Notification,
            MessageAction::Create,
            serde_json::json!({
                "notificationId": notification.id,
                "notificationType": notification.notification_type,
                "priority": notification.priority,
                "title": title,
                "message": body,
                "data": data,
                "actions": notification
                    .actions
                    .as_deref()
                    .and_then(|a| serde_json::from_str::<serde_json::Value>(a).ok()),
            }),
        )
        .with_user(&notification.user_id);

        let accepted = self
            .registry
            .broadcast_to_user(&notification.user_id, &envelope, None);

        if accepted > 0 {
            Ok(DeliveryReport::ok(DeliveryOutcome::Delivered))
        } else {
            Ok(DeliveryReport::failed("offline"))
        }
    }
}
