use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::db::models::{ChannelKind, DeliveryOutcome, Notification, Preferences};
use crate::error::{AppError, AppResult};
use crate::services::channels::{ChannelAdapter, DeliveryReport};
use crate::services::external::DeviceTokenStore;
use crate::services::templates::{RenderedPayload, TemplateRenderer};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushGatewayResponse {
    results: Vec<TokenResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResult {
    token: String,
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Submits one batched request for all of the user's registered device
/// tokens and folds the per-token results into a single report:
/// `delivered` iff at least one token succeeded.
pub struct PushAdapter {
    client: reqwest::Client,
    base_url: String,
    tokens: Arc<dyn DeviceTokenStore>,
    renderer: Arc<TemplateRenderer>,
}

impl PushAdapter {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn DeviceTokenStore>,
        renderer: Arc<TemplateRenderer>,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens,
            renderer,
        }
    }
}

#[async_trait]
impl ChannelAdapter for PushAdapter {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn deliver(
        &self,
        notification: &Notification,
        _preferences: &Preferences,
    ) -> AppResult<DeliveryReport> {
        let tokens = self.tokens.tokens_for(&notification.user_id).await?;
        if tokens.is_empty() {
            return Ok(DeliveryReport::failed("no registered device tokens"));
        }

        let (title, body, data) = match self.renderer.render(notification, ChannelKind::Push)? {
            RenderedPayload::Push { title, body, data } => (title, body, data),
            _ => unreachable!("push render always yields a push payload"),
        };

        let targets: Vec<serde_json::Value> = tokens
            .iter()
            .map(|t| serde_json::json!({ "platform": t.platform, "token": t.token }))
            .collect();

        let response = self
            .client
            .post(format!("{}/v1/push", self.base_url))
            .json(&serde_json::json!({
                "idempotencyKey": notification.id,
                "targets": targets,
                "title": title,
                "body": body,
                "data": data,
                "priority": notification.priority,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Push(format!("push gateway error ({status})")));
        }

        let report: PushGatewayResponse = response.json().await?;
        let succeeded = report.results.iter().filter(|r| r.success).count();
        let failed = report.results.len() - succeeded;

        for result in report.results.iter().filter(|r| !r.success) {
            tracing::debug!(
                "Push token {} failed for notification {}: {}",
                result.token,
                notification.id,
                result.error.as_deref().unwrap_or("unknown")
            );
        }

        if succeeded > 0 {
            Ok(DeliveryReport::ok(DeliveryOutcome::Delivered))
        } else {
            let first_error = report
                .results
                .iter()
                .find_map(|r| r.error.clone())
                .unwrap_or_else(|| "all tokens rejected".to_string());
            Ok(DeliveryReport::failed(format!(
                "{failed} token(s) failed: {first_error}"
            )))
        }
    }
}
