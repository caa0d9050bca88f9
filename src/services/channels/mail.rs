use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::db::models::{ChannelKind, DeliveryOutcome, Notification, Preferences};
use crate::error::{AppError, AppResult};
use crate::services::channels::{ChannelAdapter, DeliveryReport};
use crate::services::external::UserDirectory;
use crate::services::templates::{RenderedPayload, TemplateRenderer};

/// Submits rendered mail to the outbound mail provider. `sent` means the
/// provider accepted the submission; final disposition arrives out of band.
pub struct MailAdapter {
    client: reqwest::Client,
    base_url: String,
    from: String,
    directory: Arc<dyn UserDirectory>,
    renderer: Arc<TemplateRenderer>,
}

impl MailAdapter {
    pub fn new(
        base_url: &str,
        from: &str,
        timeout: Duration,
        directory: Arc<dyn UserDirectory>,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            from: from.to_string(),
            directory,
            renderer,
        }
    }
}

#[async_trait]
impl ChannelAdapter for MailAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _preferences: &Preferences,
    ) -> AppResult<DeliveryReport> {
        let Some(email) = self.directory.email_of(&notification.user_id).await? else {
            return Ok(DeliveryReport::failed("no email address on record"));
        };

        let (subject, html, text) = match self.renderer.render(notification, ChannelKind::Email)? {
            RenderedPayload::Mail {
                subject,
                html,
                text,
            } => (subject, html, text),
            _ => unreachable!("mail render always yields a mail payload"),
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .json(&serde_json::json!({
                "idempotencyKey": notification.id,
                "from": self.from,
                "to": email,
                "subject": subject,
                "html": html,
                "text": text,
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(
                "Mail for notification {} accepted by provider",
                notification.id
            );
            Ok(DeliveryReport::ok(DeliveryOutcome::Sent))
        } else if status.is_client_error() {
            // Provider-reported hard failure; retrying cannot help.
            let body = response.text().await.unwrap_or_default();
            Ok(DeliveryReport::bounced(format!(
                "mail provider rejected submission ({status}): {body}"
            )))
        } else {
            Err(AppError::Mail(format!("mail provider error ({status})")))
        }
    }
}
