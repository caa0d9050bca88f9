use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateDeliveryLog, DeliveryLogEntry};
use crate::error::{AppError, AppResult};

/// Per-notification delivery attempts. Append-only; entries land in
/// adapter completion order.
pub struct DeliveryLogRepository;

impl DeliveryLogRepository {
    pub async fn create(
        pool: &SqlitePool,
        entry: CreateDeliveryLog,
    ) -> AppResult<DeliveryLogEntry> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, DeliveryLogEntry>(
            r#"
            INSERT INTO delivery_log (id, notification_id, channel, status, error, sent_at_ms)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, notification_id, channel, status, error, sent_at_ms
            "#,
        )
        .bind(id)
        .bind(entry.notification_id)
        .bind(entry.channel)
        .bind(entry.status)
        .bind(entry.error)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_notification(
        pool: &SqlitePool,
        notification_id: &str,
    ) -> AppResult<Vec<DeliveryLogEntry>> {
        let rows = sqlx::query_as::<_, DeliveryLogEntry>(
            r#"
            SELECT id, notification_id, channel, status, error, sent_at_ms
            FROM delivery_log
            WHERE notification_id = ?
            ORDER BY sent_at_ms ASC, id ASC
            "#,
        )
        .bind(notification_id)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }
}
