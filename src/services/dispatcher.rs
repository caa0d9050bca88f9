use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::broker::{QueueBroker, QueueName};
use crate::clock::ms_to_datetime;
use crate::db::models::{
    ChannelKind, CreateDeliveryLog, DeliveryOutcome, Notification, NotificationBatch,
    NotificationPriority, NotificationRequest, NotificationStatus, Preferences,
};
use crate::db::repository::{
    BatchRepository, CreateNotification, DeliveryLogRepository, NotificationRepository,
    PreferencesRepository,
};
use crate::error::{AppError, AppResult};
use crate::protocol::{Envelope, MessageAction, MessageKind};
use crate::services::channels::{ChannelAdapter, DeliveryReport};
use crate::services::registry::ConnectionRegistry;

/// Users per batch chunk on the jobs queue.
pub const BATCH_CHUNK_SIZE: usize = 25;

/// Body of a message on the `scheduled-notifications` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledNotificationJob {
    pub request: NotificationRequest,
    pub scheduled_for_ms: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptions {
    #[serde(default)]
    pub channels: Option<Vec<ChannelKind>>,
    #[serde(default)]
    pub priority: Option<NotificationPriority>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Body of a message on the `jobs` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueJob {
    /// One shard of a batch dispatch.
    BatchChunk {
        batch_id: String,
        template: String,
        user_ids: Vec<String>,
        data: serde_json::Value,
        options: BatchOptions,
    },
    /// Redelivery of one channel attempt that failed transiently.
    Delivery {
        notification_id: String,
        channel: ChannelKind,
    },
}

/// What `send` did with a request.
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Dispatched(Notification),
    /// Deferred onto the scheduled-notifications queue; the notification is
    /// created when the worker dispatches it, so preferences are evaluated
    /// at delivery time.
    Scheduled { scheduled_for_ms: i64 },
}

/// Routes notification requests through the preference cascade: resolve
/// enabled channels, defer through quiet hours, run the channel adapters
/// concurrently, and record every attempt in the delivery log. Transient
/// channel failures are handed to the queue broker for redelivery.
pub struct NotificationDispatcher {
    pool: SqlitePool,
    broker: QueueBroker,
    registry: Arc<ConnectionRegistry>,
    adapters: HashMap<ChannelKind, Arc<dyn ChannelAdapter>>,
}

impl NotificationDispatcher {
    pub fn new(
        pool: SqlitePool,
        broker: QueueBroker,
        registry: Arc<ConnectionRegistry>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
    ) -> Self {
        Self {
            pool,
            broker,
            registry,
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
        }
    }

    /// Dispatch one notification request.
    pub async fn send(&self, request: NotificationRequest) -> AppResult<DispatchOutcome> {
        let prefs = PreferencesRepository::get_or_default(&self.pool, &request.user_id).await?;
        let now_ms = Utc::now().timestamp_millis();

        let enabled_channels: Vec<ChannelKind> = request
            .channels
            .iter()
            .copied()
            .filter(|channel| prefs.allows(*channel, &request.notification_type))
            .collect();

        // Nothing to deliver on: persist the request as immediately expired
        // so it remains queryable.
        if enabled_channels.is_empty() {
            let notification = self
                .persist(&request, NotificationStatus::Expired)
                .await?;
            tracing::debug!(
                "Notification {} for user {} expired at dispatch: no enabled channels",
                notification.id,
                notification.user_id
            );
            return Ok(DispatchOutcome::Dispatched(notification));
        }

        // Caller-scheduled requests go straight to the schedule path.
        if let Some(scheduled_for) = request.scheduled_for_ms {
            if scheduled_for > now_ms {
                return self.schedule(request, scheduled_for).await;
            }
        }

        // Quiet hours defer everything below urgent to the next minute
        // outside every window, walking chained windows end to end.
        if request.priority != NotificationPriority::Urgent {
            let next_free = prefs.next_available(ms_to_datetime(now_ms));
            if next_free.timestamp_millis() > now_ms {
                return self.schedule(request, next_free.timestamp_millis()).await;
            }
        }

        let notification = self.persist(&request, NotificationStatus::Pending).await?;
        let notification = self
            .run_channels(notification, &prefs, &enabled_channels)
            .await?;

        Ok(DispatchOutcome::Dispatched(notification))
    }

    async fn persist(
        &self,
        request: &NotificationRequest,
        status: NotificationStatus,
    ) -> AppResult<Notification> {
        NotificationRepository::create(
            &self.pool,
            CreateNotification {
                user_id: request.user_id.clone(),
                notification_type: request.notification_type.clone(),
                channel: None,
                status,
                priority: request.priority,
                title: request.title.clone(),
                message: request.message.clone(),
                data: request.data.to_string(),
                actions: request.actions.as_ref().map(|a| a.to_string()),
                expires_at_ms: request.expires_at_ms,
            },
        )
        .await
    }

    /// Run every enabled adapter concurrently, log outcomes in completion
    /// order, then reduce to the notification's final status. Every attempt
    /// has an owner; nothing is fire-and-forget.
    async fn run_channels(
        &self,
        notification: Notification,
        prefs: &Preferences,
        channels: &[ChannelKind],
    ) -> AppResult<Notification> {
        let mut attempts = FuturesUnordered::new();
        for channel in channels {
            let Some(adapter) = self.adapters.get(channel) else {
                tracing::warn!("No adapter wired for channel {}", channel.as_str());
                continue;
            };
            let adapter = adapter.clone();
            let notification = notification.clone();
            let prefs = prefs.clone();
            let channel = *channel;
            attempts.push(async move {
                let result = adapter.deliver(&notification, &prefs).await;
                (channel, result)
            });
        }

        let mut primary_success: Option<ChannelKind> = None;
        let mut retry_queued = false;

        while let Some((channel, result)) = attempts.next().await {
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    let reason = match &e {
                        AppError::NoTemplate(_) => "no-template".to_string(),
                        other => other.to_string(),
                    };
                    if e.is_transient() {
                        self.enqueue_retry(&notification.id, channel, &reason).await?;
                        retry_queued = true;
                    }
                    DeliveryReport::failed(reason)
                }
            };

            DeliveryLogRepository::create(
                &self.pool,
                CreateDeliveryLog {
                    notification_id: notification.id.clone(),
                    channel,
                    status: report.outcome,
                    error: report.error.clone(),
                },
            )
            .await?;

            if report.outcome.is_success() && primary_success.is_none() {
                primary_success = Some(channel);
            }
        }

        if let Some(channel) = primary_success {
            NotificationRepository::mark_delivered(&self.pool, &notification.id, channel).await?;
        } else if !retry_queued {
            NotificationRepository::mark_failed(&self.pool, &notification.id).await?;
        }
        // With a retry in flight the notification stays pending; the queue
        // worker advances it when the redelivery lands.

        let stored = NotificationRepository::find_by_id(&self.pool, &notification.id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("notification {}", notification.id)))?;
        Ok(stored)
    }

    async fn enqueue_retry(
        &self,
        notification_id: &str,
        channel: ChannelKind,
        reason: &str,
    ) -> AppResult<()> {
        let job = QueueJob::Delivery {
            notification_id: notification_id.to_string(),
            channel,
        };
        let queue = match channel {
            ChannelKind::Email => QueueName::Email,
            _ => QueueName::Jobs,
        };
        let body = serde_json::to_string(&job)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        self.broker.send(queue, &body, None).await?;

        tracing::info!(
            "Queued redelivery for notification {} on {} after transient failure: {}",
            notification_id,
            channel.as_str(),
            reason
        );
        Ok(())
    }

    /// Schedule path: park the request on the scheduled-notifications queue
    /// until its due time. Horizons past the broker's delay cap are
    /// re-enqueued by the scheduler tick.
    async fn schedule(
        &self,
        mut request: NotificationRequest,
        scheduled_for_ms: i64,
    ) -> AppResult<DispatchOutcome> {
        request.scheduled_for_ms = Some(scheduled_for_ms);
        let job = ScheduledNotificationJob {
            request,
            scheduled_for_ms,
        };
        let body =
            serde_json::to_string(&job).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let now_ms = Utc::now().timestamp_millis();
        let delay = Duration::from_millis((scheduled_for_ms - now_ms).max(0) as u64);
        self.broker
            .send(QueueName::ScheduledNotifications, &body, Some(delay))
            .await?;

        tracing::debug!(
            "Scheduled notification for user {} at {}",
            job.request.user_id,
            scheduled_for_ms
        );
        Ok(DispatchOutcome::Scheduled { scheduled_for_ms })
    }

    /// Worker entry for the scheduled-notifications queue. A message whose
    /// due time is still in the future goes back with a fresh delay.
    pub async fn process_scheduled(&self, body: &str) -> AppResult<()> {
        let job: ScheduledNotificationJob =
            serde_json::from_str(body).map_err(|e| AppError::BadRequest(e.to_string()))?;

        let now_ms = Utc::now().timestamp_millis();
        if job.scheduled_for_ms > now_ms {
            let delay = Duration::from_millis((job.scheduled_for_ms - now_ms) as u64);
            let body = serde_json::to_string(&job)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            self.broker
                .send(QueueName::ScheduledNotifications, &body, Some(delay))
                .await?;
            return Ok(());
        }

        // Preferences are re-evaluated now, at dispatch time.
        self.send(job.request).await?;
        Ok(())
    }

    /// Worker entry for the jobs queue.
    pub async fn process_job(&self, body: &str) -> AppResult<()> {
        let job: QueueJob =
            serde_json::from_str(body).map_err(|e| AppError::BadRequest(e.to_string()))?;

        match job {
            QueueJob::BatchChunk {
                batch_id,
                template,
                user_ids,
                data,
                options,
            } => {
                self.process_batch_chunk(&batch_id, &template, &user_ids, data, options)
                    .await
            }
            QueueJob::Delivery {
                notification_id,
                channel,
            } => self.process_redelivery(&notification_id, channel).await,
        }
    }

    /// Batch entry point: record the batch, shard the user list into chunks
    /// of 25, and park the chunks on the jobs queue.
    pub async fn send_batch(
        &self,
        user_ids: &[String],
        template: &str,
        data: serde_json::Value,
        options: BatchOptions,
    ) -> AppResult<NotificationBatch> {
        let batch = BatchRepository::create(&self.pool, template, user_ids.len() as i64).await?;

        for chunk in user_ids.chunks(BATCH_CHUNK_SIZE) {
            let job = QueueJob::BatchChunk {
                batch_id: batch.id.clone(),
                template: template.to_string(),
                user_ids: chunk.to_vec(),
                data: data.clone(),
                options: options.clone(),
            };
            let body =
                serde_json::to_string(&job).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
            self.broker.send(QueueName::Jobs, &body, None).await?;
        }

        tracing::info!(
            "Batch {} created: {} user(s) in {} chunk(s)",
            batch.id,
            user_ids.len(),
            user_ids.len().div_ceil(BATCH_CHUNK_SIZE)
        );
        Ok(batch)
    }

    async fn process_batch_chunk(
        &self,
        batch_id: &str,
        template: &str,
        user_ids: &[String],
        data: serde_json::Value,
        options: BatchOptions,
    ) -> AppResult<()> {
        let mut sent = 0;
        let mut delivered = 0;
        let mut failed = 0;

        for user_id in user_ids {
            let request = NotificationRequest {
                user_id: user_id.clone(),
                notification_type: template.to_string(),
                channels: options
                    .channels
                    .clone()
                    .unwrap_or_else(|| vec![ChannelKind::InApp, ChannelKind::Push]),
                priority: options.priority.unwrap_or(NotificationPriority::Medium),
                title: options.title.clone().unwrap_or_else(|| template.to_string()),
                message: options.message.clone().unwrap_or_default(),
                data: data.clone(),
                actions: None,
                expires_at_ms: None,
                scheduled_for_ms: None,
            };

            match self.send(request).await {
                Ok(DispatchOutcome::Dispatched(notification)) => match notification.status {
                    NotificationStatus::Failed | NotificationStatus::Expired => failed += 1,
                    NotificationStatus::Delivered => {
                        sent += 1;
                        delivered += 1;
                    }
                    _ => sent += 1,
                },
                Ok(DispatchOutcome::Scheduled { .. }) => sent += 1,
                Err(e) => {
                    tracing::warn!("Batch {} send for user {} failed: {:?}", batch_id, user_id, e);
                    failed += 1;
                }
            }
        }

        BatchRepository::record_outcomes(&self.pool, batch_id, sent, delivered, failed).await?;
        Ok(())
    }

    /// Redeliver one channel after a transient failure. A transient error
    /// propagates so the queue worker nacks and the broker's redelivery
    /// counter advances toward the dead-letter cap.
    async fn process_redelivery(
        &self,
        notification_id: &str,
        channel: ChannelKind,
    ) -> AppResult<()> {
        let Some(notification) =
            NotificationRepository::find_by_id(&self.pool, notification_id).await?
        else {
            tracing::warn!("Redelivery for unknown notification {}", notification_id);
            return Ok(());
        };
        if notification.status.is_terminal() {
            return Ok(());
        }

        let prefs =
            PreferencesRepository::get_or_default(&self.pool, &notification.user_id).await?;
        let adapter = self
            .adapters
            .get(&channel)
            .ok_or_else(|| AppError::Config(format!("no adapter for {}", channel.as_str())))?;

        match adapter.deliver(&notification, &prefs).await {
            Ok(report) => {
                DeliveryLogRepository::create(
                    &self.pool,
                    CreateDeliveryLog {
                        notification_id: notification.id.clone(),
                        channel,
                        status: report.outcome,
                        error: report.error,
                    },
                )
                .await?;

                if report.outcome.is_success() {
                    NotificationRepository::mark_delivered(&self.pool, &notification.id, channel)
                        .await?;
                } else if notification.status == NotificationStatus::Pending {
                    // Another channel may have delivered since; only a
                    // still-pending notification settles as failed.
                    NotificationRepository::mark_failed(&self.pool, &notification.id).await?;
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                // Leave the log entry to the attempt that finally settles;
                // the broker tracks the in-between failures.
                Err(e)
            }
            Err(e) => {
                DeliveryLogRepository::create(
                    &self.pool,
                    CreateDeliveryLog {
                        notification_id: notification.id.clone(),
                        channel,
                        status: DeliveryOutcome::Failed,
                        error: Some(e.to_string()),
                    },
                )
                .await?;
                if notification.status == NotificationStatus::Pending {
                    NotificationRepository::mark_failed(&self.pool, &notification.id).await?;
                }
                Ok(())
            }
        }
    }

    /// Advance delivered -> read and tell the user's other devices to drop
    /// their unread counters.
    pub async fn mark_read(
        &self,
        user_id: &str,
        notification_id: &str,
    ) -> AppResult<Notification> {
        let existing = NotificationRepository::find_by_id(&self.pool, notification_id)
            .await?
            .filter(|n| n.user_id == user_id)
            .ok_or_else(|| AppError::NotFound(format!("notification {notification_id}")))?;

        let updated = match NotificationRepository::mark_read(&self.pool, notification_id).await? {
            Some(updated) => updated,
            // Already read: idempotent success. Anything else cannot move.
            None if existing.status == NotificationStatus::Read => existing,
            None => {
                return Err(AppError::Conflict(format!(
                    "notification {notification_id} is not delivered"
                )))
            }
        };

        let unread = NotificationRepository::count_unread(&self.pool, user_id).await?;
        let envelope = Envelope::server(
            MessageKind::Notification,
            MessageAction::Update,
            serde_json::json!({
                "notificationId": updated.id,
                "status": updated.status,
                "unreadCount": unread,
            }),
        )
        .with_user(user_id);
        self.registry.broadcast_to_user(user_id, &envelope, None);

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{Datelike, Duration as ChronoDuration, TimeZone, Utc};

    use crate::config::Config;
    use crate::db::models::QuietHoursWindow;

    #[derive(Debug, Clone)]
    enum Behavior {
        Report(DeliveryOutcome, Option<String>),
        TransientError(String),
        PermanentError(String),
    }

    struct MockAdapter {
        kind: ChannelKind,
        behavior: Mutex<Behavior>,
        calls: AtomicUsize,
    }

    impl MockAdapter {
        fn new(kind: ChannelKind, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behavior: Mutex::new(behavior),
                calls: AtomicUsize::new(0),
            })
        }

        fn set(&self, behavior: Behavior) {
            *self.behavior.lock().unwrap() = behavior;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl ChannelAdapter for MockAdapter {
        fn kind(&self) -> ChannelKind {
            self.kind
        }

        async fn deliver(
            &self,
            _notification: &Notification,
            _preferences: &Preferences,
        ) -> AppResult<DeliveryReport> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.behavior.lock().unwrap().clone() {
                Behavior::Report(outcome, error) => Ok(DeliveryReport { outcome, error }),
                Behavior::TransientError(msg) => Err(AppError::Mail(format!(
                    "mail provider error (503 Service Unavailable): {msg}"
                ))),
                Behavior::PermanentError(msg) => Err(AppError::NoTemplate(msg)),
            }
        }
    }

    struct Fixture {
        dispatcher: NotificationDispatcher,
        broker: QueueBroker,
        pool: SqlitePool,
        registry: Arc<ConnectionRegistry>,
        in_app: Arc<MockAdapter>,
        email: Arc<MockAdapter>,
    }

    async fn fixture(in_app_behavior: Behavior, email_behavior: Behavior) -> Fixture {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let broker = QueueBroker::new(pool.clone(), Config::default().broker);
        let registry = Arc::new(ConnectionRegistry::new());
        let in_app = MockAdapter::new(ChannelKind::InApp, in_app_behavior);
        let email = MockAdapter::new(ChannelKind::Email, email_behavior);

        let dispatcher = NotificationDispatcher::new(
            pool.clone(),
            broker.clone(),
            registry.clone(),
            vec![in_app.clone(), email.clone()],
        );

        Fixture {
            dispatcher,
            broker,
            pool,
            registry,
            in_app,
            email,
        }
    }

    fn request(user: &str, notification_type: &str, channels: Vec<ChannelKind>) -> NotificationRequest {
        NotificationRequest {
            user_id: user.to_string(),
            notification_type: notification_type.to_string(),
            channels,
            priority: NotificationPriority::Medium,
            title: "New login".to_string(),
            message: "A new device signed in".to_string(),
            data: serde_json::json!({}),
            actions: None,
            expires_at_ms: None,
            scheduled_for_ms: None,
        }
    }

    /// Two half-day windows covering all of today; the next free minute is
    /// midnight tonight.
    async fn enable_quiet_hours_all_day(pool: &SqlitePool, user: &str) -> i64 {
        let today = Utc::now().date_naive().weekday().num_days_from_monday() as u8;
        let windows = vec![
            QuietHoursWindow {
                day: today,
                start: "00:00".to_string(),
                end: "12:00".to_string(),
            },
            QuietHoursWindow {
                day: today,
                start: "12:00".to_string(),
                end: "00:00".to_string(),
            },
        ];

        let mut prefs = Preferences::default_for(user, 0);
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_windows = serde_json::to_string(&windows).unwrap();
        PreferencesRepository::upsert(pool, prefs).await.unwrap();

        let tomorrow = Utc::now().date_naive() + ChronoDuration::days(1);
        Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).unwrap())
            .timestamp_millis()
    }

    fn dispatched(outcome: DispatchOutcome) -> Notification {
        match outcome {
            DispatchOutcome::Dispatched(n) => n,
            other => panic!("expected dispatched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_channel_list_persists_expired() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let n = dispatched(
            f.dispatcher
                .send(request("u1", "security_alert", vec![]))
                .await
                .unwrap(),
        );
        assert_eq!(n.status, NotificationStatus::Expired);
        assert_eq!(f.in_app.calls(), 0);
        assert_eq!(f.email.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_channels_are_filtered_by_type() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        // Default email allow-list does not include "mention".
        let n = dispatched(
            f.dispatcher
                .send(request(
                    "u1",
                    "mention",
                    vec![ChannelKind::InApp, ChannelKind::Email],
                ))
                .await
                .unwrap(),
        );

        assert_eq!(n.status, NotificationStatus::Delivered);
        assert_eq!(f.in_app.calls(), 1);
        assert_eq!(f.email.calls(), 0);

        let log = DeliveryLogRepository::find_by_notification(&f.pool, &n.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].channel, ChannelKind::InApp);
    }

    #[tokio::test]
    async fn any_successful_channel_advances_to_delivered() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Failed, Some("offline".to_string())),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let n = dispatched(
            f.dispatcher
                .send(request(
                    "u1",
                    "security_alert",
                    vec![ChannelKind::InApp, ChannelKind::Email],
                ))
                .await
                .unwrap(),
        );

        assert_eq!(n.status, NotificationStatus::Delivered);
        assert_eq!(n.channel, Some(ChannelKind::Email));

        // Every delivered notification has at least one successful attempt
        // on record.
        let log = DeliveryLogRepository::find_by_notification(&f.pool, &n.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert!(log.iter().any(|entry| entry.status.is_success()));
    }

    #[tokio::test]
    async fn all_channels_failing_permanently_marks_failed() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Failed, Some("offline".to_string())),
            Behavior::PermanentError("security_alert/email".to_string()),
        )
        .await;

        let n = dispatched(
            f.dispatcher
                .send(request(
                    "u1",
                    "security_alert",
                    vec![ChannelKind::InApp, ChannelKind::Email],
                ))
                .await
                .unwrap(),
        );

        assert_eq!(n.status, NotificationStatus::Failed);
        let log = DeliveryLogRepository::find_by_notification(&f.pool, &n.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 2);
        assert!(log
            .iter()
            .any(|entry| entry.error.as_deref() == Some("no-template")));

        // Nothing queued: a permanent failure is not retried.
        let queued = f
            .broker
            .receive(QueueName::Email, 10, std::time::Duration::ZERO)
            .await
            .unwrap();
        assert!(queued.is_empty());
    }

    #[tokio::test]
    async fn quiet_hours_defer_non_urgent_to_window_end() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;
        let window_end = enable_quiet_hours_all_day(&f.pool, "u1").await;

        let outcome = f
            .dispatcher
            .send(request("u1", "entry_reminder", vec![ChannelKind::InApp]))
            .await
            .unwrap();

        match outcome {
            DispatchOutcome::Scheduled { scheduled_for_ms } => {
                assert_eq!(scheduled_for_ms, window_end);
            }
            other => panic!("expected scheduled, got {other:?}"),
        }
        assert_eq!(f.in_app.calls(), 0);

        // The request is parked on the scheduled queue, not persisted yet.
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(&f.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);

        let parked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = 'scheduled-notifications'",
        )
        .fetch_one(&f.pool)
        .await
        .unwrap();
        assert_eq!(parked, 1);
    }

    #[tokio::test]
    async fn urgent_bypasses_quiet_hours() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;
        enable_quiet_hours_all_day(&f.pool, "u1").await;

        let mut req = request(
            "u1",
            "security_alert",
            vec![ChannelKind::InApp, ChannelKind::Email],
        );
        req.priority = NotificationPriority::Urgent;

        let n = dispatched(f.dispatcher.send(req).await.unwrap());
        assert_eq!(n.status, NotificationStatus::Delivered);

        let log = DeliveryLogRepository::find_by_notification(&f.pool, &n.id)
            .await
            .unwrap();
        assert_eq!(log.len(), 2, "both channels attempted immediately");
    }

    #[tokio::test]
    async fn due_scheduled_message_re_enters_dispatch() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let job = ScheduledNotificationJob {
            request: request("u1", "entry_reminder", vec![ChannelKind::InApp]),
            scheduled_for_ms: Utc::now().timestamp_millis() - 1_000,
        };
        f.dispatcher
            .process_scheduled(&serde_json::to_string(&job).unwrap())
            .await
            .unwrap();

        assert_eq!(f.in_app.calls(), 1);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notifications")
            .fetch_one(&f.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn future_scheduled_message_is_requeued() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let job = ScheduledNotificationJob {
            request: request("u1", "entry_reminder", vec![ChannelKind::InApp]),
            scheduled_for_ms: Utc::now().timestamp_millis() + 60_000,
        };
        f.dispatcher
            .process_scheduled(&serde_json::to_string(&job).unwrap())
            .await
            .unwrap();

        assert_eq!(f.in_app.calls(), 0);
        let parked: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = 'scheduled-notifications'",
        )
        .fetch_one(&f.pool)
        .await
        .unwrap();
        assert_eq!(parked, 1);
    }

    #[tokio::test]
    async fn transient_failure_queues_redelivery_then_settles() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Failed, Some("offline".to_string())),
            Behavior::TransientError("slow down".to_string()),
        )
        .await;

        let n = dispatched(
            f.dispatcher
                .send(request(
                    "u1",
                    "security_alert",
                    vec![ChannelKind::InApp, ChannelKind::Email],
                ))
                .await
                .unwrap(),
        );

        // A retry is in flight: the notification is not failed yet.
        assert_eq!(n.status, NotificationStatus::Pending);

        let queued = f
            .broker
            .receive(QueueName::Email, 1, std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);

        // Provider recovers; the worker drains the job.
        f.email.set(Behavior::Report(DeliveryOutcome::Sent, None));
        f.dispatcher.process_job(&queued[0].body).await.unwrap();
        f.broker.ack(&queued[0].handle).await.unwrap();

        let settled = NotificationRepository::find_by_id(&f.pool, &n.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, NotificationStatus::Delivered);

        let log = DeliveryLogRepository::find_by_notification(&f.pool, &n.id)
            .await
            .unwrap();
        assert!(log.iter().any(|entry| entry.status == DeliveryOutcome::Sent));
    }

    #[tokio::test]
    async fn repeated_dispatch_attempts_same_channel_set() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let req = request(
            "u1",
            "security_alert",
            vec![ChannelKind::InApp, ChannelKind::Email],
        );
        f.dispatcher.send(req.clone()).await.unwrap();
        f.dispatcher.send(req).await.unwrap();

        // Same cascade both times: one attempt per channel per dispatch.
        assert_eq!(f.in_app.calls(), 2);
        assert_eq!(f.email.calls(), 2);
    }

    #[tokio::test]
    async fn batch_shards_into_chunks_and_tallies_outcomes() {
        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let users: Vec<String> = (1..=60).map(|i| format!("u{i}")).collect();
        let batch = f
            .dispatcher
            .send_batch(
                &users,
                "daily",
                serde_json::json!({}),
                BatchOptions {
                    channels: Some(vec![ChannelKind::InApp]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(batch.total, 60);

        let chunks = f
            .broker
            .receive(QueueName::Jobs, 10, std::time::Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);

        let mut sizes = Vec::new();
        for chunk in &chunks {
            match serde_json::from_str::<QueueJob>(&chunk.body).unwrap() {
                QueueJob::BatchChunk { user_ids, .. } => sizes.push(user_ids.len()),
                other => panic!("unexpected job: {other:?}"),
            }
            f.dispatcher.process_job(&chunk.body).await.unwrap();
            f.broker.ack(&chunk.handle).await.unwrap();
        }
        sizes.sort_unstable();
        assert_eq!(sizes, vec![10, 25, 25]);

        let stats = BatchRepository::find_by_id(&f.pool, &batch.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.sent_count + stats.failed_count, 60);
        assert_eq!(stats.delivered_count, 60);
    }

    #[tokio::test]
    async fn mark_read_broadcasts_fresh_unread_count() {
        use crate::services::registry::{SessionHandle, SessionMessage, SESSION_BUFFER};
        use tokio::sync::mpsc;

        let f = fixture(
            Behavior::Report(DeliveryOutcome::Delivered, None),
            Behavior::Report(DeliveryOutcome::Sent, None),
        )
        .await;

        let n = dispatched(
            f.dispatcher
                .send(request("u1", "security_alert", vec![ChannelKind::InApp]))
                .await
                .unwrap(),
        );
        assert_eq!(n.status, NotificationStatus::Delivered);

        let (tx, mut rx) = mpsc::channel(SESSION_BUFFER);
        f.registry
            .attach(SessionHandle {
                session_id: "s1".to_string(),
                user_id: "u1".to_string(),
                sender: tx,
                user_agent: None,
                remote_addr: None,
            })
            .unwrap();

        let read = f.dispatcher.mark_read("u1", &n.id).await.unwrap();
        assert_eq!(read.status, NotificationStatus::Read);
        assert!(read.read_at_ms.is_some());

        match rx.try_recv().unwrap() {
            SessionMessage::Envelope(env) => {
                assert_eq!(env.kind, MessageKind::Notification);
                assert_eq!(env.payload["notificationId"], n.id.as_str());
                assert_eq!(env.payload["unreadCount"], 0);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        // Idempotent second read; foreign users see NotFound.
        let again = f.dispatcher.mark_read("u1", &n.id).await.unwrap();
        assert_eq!(again.status, NotificationStatus::Read);
        assert!(matches!(
            f.dispatcher.mark_read("u2", &n.id).await,
            Err(AppError::NotFound(_))
        ));
    }
}
