use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::models::{
    ChannelKind, DeliveryOutcome, Notification, NotificationPriority, Preferences,
};
use crate::error::{AppError, AppResult};
use crate::services::channels::{ChannelAdapter, DeliveryReport};
use crate::services::templates::{RenderedPayload, TemplateRenderer};

/// Submits a short text summary to the SMS gateway. Urgent notifications
/// go out on the transactional class, everything else promotional.
pub struct SmsAdapter {
    client: reqwest::Client,
    base_url: String,
    renderer: Arc<TemplateRenderer>,
}

impl SmsAdapter {
    pub fn new(base_url: &str, timeout: Duration, renderer: Arc<TemplateRenderer>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            renderer,
        }
    }

    fn message_class(priority: NotificationPriority) -> &'static str {
        if priority == NotificationPriority::Urgent {
            "transactional"
        } else {
            "promotional"
        }
    }
}

#[async_trait]
impl ChannelAdapter for SmsAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Sms
    }

    async fn deliver(
        &self,
        notification: &Notification,
        preferences: &Preferences,
    ) -> AppResult<DeliveryReport> {
        let Some(phone) = preferences.sms_phone_number.as_deref() else {
            return Ok(DeliveryReport::failed("no phone number configured"));
        };

        let text = match self.renderer.render(notification, ChannelKind::Sms)? {
            RenderedPayload::Sms { text } => text,
            _ => unreachable!("sms render always yields an sms payload"),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(&serde_json::json!({
                "idempotencyKey": notification.id,
                "to": phone,
                "text": text,
                "class": Self::message_class(notification.priority),
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(DeliveryReport::ok(DeliveryOutcome::Sent))
        } else if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            Ok(DeliveryReport::bounced(format!(
                "sms gateway rejected submission ({status}): {body}"
            )))
        } else {
            Err(AppError::Sms(format!("sms gateway error ({status})")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urgent_is_transactional_everything_else_promotional() {
        assert_eq!(
            SmsAdapter::message_class(NotificationPriority::Urgent),
            "transactional"
        );
        for priority in [
            NotificationPriority::Low,
            NotificationPriority::Medium,
            NotificationPriority::High,
        ] {
            assert_eq!(SmsAdapter::message_class(priority), "promotional");
        }
    }
}
