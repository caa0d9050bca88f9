use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::NotificationBatch;
use crate::error::{AppError, AppResult};

const BATCH_COLUMNS: &str = r#"
    id,
    template,
    total,
    sent_count,
    delivered_count,
    failed_count,
    read_count,
    created_at_ms,
    updated_at_ms
"#;

pub struct BatchRepository;

impl BatchRepository {
    pub async fn create(
        pool: &SqlitePool,
        template: &str,
        total: i64,
    ) -> AppResult<NotificationBatch> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, NotificationBatch>(&format!(
            r#"
            INSERT INTO notification_batches (
                id, template, total, sent_count, delivered_count,
                failed_count, read_count, created_at_ms, updated_at_ms
            ) VALUES (?, ?, ?, 0, 0, 0, 0, ?, ?)
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(template)
        .bind(total)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<NotificationBatch>> {
        let row = sqlx::query_as::<_, NotificationBatch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM notification_batches WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Fold a worker's per-user outcomes into the counters in one atomic
    /// statement, so concurrent chunk workers never lose updates.
    pub async fn record_outcomes(
        pool: &SqlitePool,
        id: &str,
        sent: i64,
        delivered: i64,
        failed: i64,
    ) -> AppResult<NotificationBatch> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, NotificationBatch>(&format!(
            r#"
            UPDATE notification_batches
            SET sent_count = sent_count + ?,
                delivered_count = delivered_count + ?,
                failed_count = failed_count + ?,
                updated_at_ms = ?
            WHERE id = ?
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(sent)
        .bind(delivered)
        .bind(failed)
        .bind(now)
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
