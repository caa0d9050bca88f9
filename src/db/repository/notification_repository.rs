use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{
    ChannelKind, Notification, NotificationPriority, NotificationStatus,
};
use crate::error::{AppError, AppResult};

const NOTIFICATION_COLUMNS: &str = r#"
    id,
    user_id,
    notification_type,
    channel,
    status,
    priority,
    title,
    message,
    data,
    actions,
    expires_at_ms,
    created_at_ms,
    updated_at_ms,
    delivered_at_ms,
    read_at_ms
"#;

#[derive(Debug, Clone)]
pub struct CreateNotification {
    pub user_id: String,
    pub notification_type: String,
    pub channel: Option<ChannelKind>,
    pub status: NotificationStatus,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub data: String,
    pub actions: Option<String>,
    pub expires_at_ms: Option<i64>,
}

/// Repository for the append-only per-user notification log.
///
/// Status updates are conditional single-statement UPDATEs so concurrent
/// writers cannot skip steps of the allowed status graph.
pub struct NotificationRepository;

impl NotificationRepository {
    pub async fn create(pool: &SqlitePool, input: CreateNotification) -> AppResult<Notification> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            INSERT INTO notifications (
                id, user_id, notification_type, channel, status, priority,
                title, message, data, actions, expires_at_ms,
                created_at_ms, updated_at_ms, delivered_at_ms, read_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL)
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(input.user_id)
        .bind(input.notification_type)
        .bind(input.channel)
        .bind(input.status)
        .bind(input.priority)
        .bind(input.title)
        .bind(input.message)
        .bind(input.data)
        .bind(input.actions)
        .bind(input.expires_at_ms)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        let row = sqlx::query_as::<_, Notification>(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Advance pending -> delivered, stamping the primary channel. Returns
    /// `None` when the notification is not currently pending.
    pub async fn mark_delivered(
        pool: &SqlitePool,
        id: &str,
        channel: ChannelKind,
    ) -> AppResult<Option<Notification>> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'delivered', channel = ?, delivered_at_ms = ?, updated_at_ms = ?
            WHERE id = ? AND status = 'pending'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(channel)
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Advance delivered -> read. Returns `None` when the notification is
    /// not currently delivered.
    pub async fn mark_read(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = 'read', read_at_ms = ?, updated_at_ms = ?
            WHERE id = ? AND status = 'delivered'
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(now)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Set failed from any non-terminal state.
    pub async fn mark_failed(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        Self::mark_terminal(pool, id, "failed").await
    }

    /// Set expired from any non-terminal state.
    pub async fn mark_expired(pool: &SqlitePool, id: &str) -> AppResult<Option<Notification>> {
        Self::mark_terminal(pool, id, "expired").await
    }

    async fn mark_terminal(
        pool: &SqlitePool,
        id: &str,
        status: &str,
    ) -> AppResult<Option<Notification>> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, Notification>(&format!(
            r#"
            UPDATE notifications
            SET status = ?, updated_at_ms = ?
            WHERE id = ? AND status IN ('pending', 'delivered')
            RETURNING {NOTIFICATION_COLUMNS}
            "#
        ))
        .bind(status)
        .bind(now)
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Newest-first listing with optional status/type filters and cursor
    /// pagination. The cursor is the `(created_at_ms, id)` pair of the last
    /// row of the previous page.
    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: &str,
        status: Option<NotificationStatus>,
        notification_type: Option<&str>,
        cursor: Option<(i64, String)>,
        limit: i64,
    ) -> AppResult<Vec<Notification>> {
        let (cursor_ms, cursor_id) = match cursor {
            Some((ms, id)) => (Some(ms), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, Notification>(&format!(
            r#"
            SELECT {NOTIFICATION_COLUMNS}
            FROM notifications
            WHERE user_id = ?
              AND (? IS NULL OR status = ?)
              AND (? IS NULL OR notification_type = ?)
              AND (? IS NULL OR created_at_ms < ? OR (created_at_ms = ? AND id < ?))
            ORDER BY created_at_ms DESC, id DESC
            LIMIT ?
            "#
        ))
        .bind(user_id)
        .bind(status)
        .bind(status)
        .bind(notification_type)
        .bind(notification_type)
        .bind(cursor_ms)
        .bind(cursor_ms)
        .bind(cursor_ms)
        .bind(cursor_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// Notifications the client should surface in its unread badge.
    pub async fn count_unread(pool: &SqlitePool, user_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM notifications WHERE user_id = ? AND status IN ('pending', 'delivered')",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(count)
    }

    /// Reaper support: expire notifications whose expiry passed while they
    /// were still live. Returns the number of rows expired.
    pub async fn expire_overdue(pool: &SqlitePool, now_ms: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE notifications
            SET status = 'expired', updated_at_ms = ?
            WHERE expires_at_ms IS NOT NULL
              AND expires_at_ms < ?
              AND status IN ('pending', 'delivered')
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }

    /// Reaper support: remove terminal notifications created before the
    /// retention cutoff. Returns the number of rows deleted.
    pub async fn prune_terminal_before(pool: &SqlitePool, cutoff_ms: i64) -> AppResult<u64> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE created_at_ms < ? AND status IN ('read', 'expired', 'failed')",
        )
        .bind(cutoff_ms)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NotificationPriority, NotificationStatus};

    async fn test_pool() -> SqlitePool {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample(user: &str) -> CreateNotification {
        CreateNotification {
            user_id: user.to_string(),
            notification_type: "entry_reminder".to_string(),
            channel: None,
            status: NotificationStatus::Pending,
            priority: NotificationPriority::Medium,
            title: "Time to write".to_string(),
            message: "You have not journaled today".to_string(),
            data: "{}".to_string(),
            actions: None,
            expires_at_ms: None,
        }
    }

    #[tokio::test]
    async fn status_advances_only_along_allowed_graph() {
        let pool = test_pool().await;
        let n = NotificationRepository::create(&pool, sample("u1")).await.unwrap();

        // pending -> read is not allowed.
        assert!(NotificationRepository::mark_read(&pool, &n.id)
            .await
            .unwrap()
            .is_none());

        let delivered = NotificationRepository::mark_delivered(&pool, &n.id, ChannelKind::InApp)
            .await
            .unwrap()
            .expect("pending -> delivered");
        assert_eq!(delivered.status, NotificationStatus::Delivered);
        assert_eq!(delivered.channel, Some(ChannelKind::InApp));
        assert!(delivered.delivered_at_ms.is_some());

        // Second delivery attempt is a no-op.
        assert!(
            NotificationRepository::mark_delivered(&pool, &n.id, ChannelKind::Email)
                .await
                .unwrap()
                .is_none()
        );

        let read = NotificationRepository::mark_read(&pool, &n.id)
            .await
            .unwrap()
            .expect("delivered -> read");
        assert_eq!(read.status, NotificationStatus::Read);

        // Terminal: failure can no longer be recorded.
        assert!(NotificationRepository::mark_failed(&pool, &n.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn failed_and_expired_reachable_from_non_terminal() {
        let pool = test_pool().await;

        let a = NotificationRepository::create(&pool, sample("u1")).await.unwrap();
        let failed = NotificationRepository::mark_failed(&pool, &a.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.status, NotificationStatus::Failed);

        let b = NotificationRepository::create(&pool, sample("u1")).await.unwrap();
        NotificationRepository::mark_delivered(&pool, &b.id, ChannelKind::Push)
            .await
            .unwrap()
            .unwrap();
        let expired = NotificationRepository::mark_expired(&pool, &b.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(expired.status, NotificationStatus::Expired);
    }

    #[tokio::test]
    async fn listing_is_newest_first_with_cursor() {
        let pool = test_pool().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                NotificationRepository::create(&pool, sample("u1"))
                    .await
                    .unwrap()
                    .id,
            );
        }
        // Another user's rows stay invisible.
        NotificationRepository::create(&pool, sample("u2")).await.unwrap();

        let first_page =
            NotificationRepository::find_by_user(&pool, "u1", None, None, None, 3)
                .await
                .unwrap();
        assert_eq!(first_page.len(), 3);

        let last = first_page.last().unwrap();
        let second_page = NotificationRepository::find_by_user(
            &pool,
            "u1",
            None,
            None,
            Some((last.created_at_ms, last.id.clone())),
            3,
        )
        .await
        .unwrap();
        assert_eq!(second_page.len(), 2);

        let mut seen: Vec<String> = first_page.into_iter().map(|n| n.id).collect();
        seen.extend(second_page.into_iter().map(|n| n.id));
        seen.sort();
        ids.sort();
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn prune_removes_only_terminal_rows() {
        let pool = test_pool().await;

        let keep = NotificationRepository::create(&pool, sample("u1")).await.unwrap();
        let gone = NotificationRepository::create(&pool, sample("u1")).await.unwrap();
        NotificationRepository::mark_failed(&pool, &gone.id).await.unwrap();

        let future_cutoff = Utc::now().timestamp_millis() + 1_000;
        let deleted = NotificationRepository::prune_terminal_before(&pool, future_cutoff)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        assert!(NotificationRepository::find_by_id(&pool, &keep.id)
            .await
            .unwrap()
            .is_some());
        assert!(NotificationRepository::find_by_id(&pool, &gone.id)
            .await
            .unwrap()
            .is_none());
    }
}
