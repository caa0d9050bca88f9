use async_trait::async_trait;

use crate::db::models::{ChannelKind, DeliveryOutcome, Notification, Preferences};
use crate::error::AppResult;

pub mod in_app;
pub mod mail;
pub mod push;
pub mod sms;

pub use in_app::InAppAdapter;
pub use mail::MailAdapter;
pub use push::PushAdapter;
pub use sms::SmsAdapter;

/// What one delivery attempt produced. Mirrors a delivery-log row minus
/// the timestamps.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub outcome: DeliveryOutcome,
    pub error: Option<String>,
}

impl DeliveryReport {
    pub fn ok(outcome: DeliveryOutcome) -> Self {
        Self {
            outcome,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::Failed,
            error: Some(reason.into()),
        }
    }

    pub fn bounced(reason: impl Into<String>) -> Self {
        Self {
            outcome: DeliveryOutcome::Bounced,
            error: Some(reason.into()),
        }
    }
}

/// Uniform outbound capability implemented by the four delivery transports.
///
/// `deliver` must be idempotent on retry: the notification id doubles as
/// the provider-side idempotency key, so the broker redelivering a job can
/// not duplicate a user-visible message. Errors returned as `Err` are
/// attempt-level faults; the dispatcher turns them into failed log entries
/// and consults `AppError::is_transient` for redelivery eligibility.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn deliver(
        &self,
        notification: &Notification,
        preferences: &Preferences,
    ) -> AppResult<DeliveryReport>;
}
