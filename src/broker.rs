use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::db::models::{DeadLetter, QueueMessage};
use crate::error::{AppError, AppResult};

/// Longest deferral `send` honors; the scheduler re-enqueues anything with a
/// longer horizon.
pub const MAX_SEND_DELAY: Duration = Duration::from_secs(15 * 60);

/// The five logical queues. `dead-letters` is not addressable for send or
/// receive; the broker moves messages there itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Jobs,
    Email,
    Files,
    SearchIndex,
    ScheduledNotifications,
}

impl QueueName {
    pub fn visibility_timeout(&self) -> Duration {
        match self {
            QueueName::Jobs => Duration::from_secs(5 * 60),
            QueueName::Email => Duration::from_secs(30),
            QueueName::Files => Duration::from_secs(15 * 60),
            QueueName::SearchIndex => Duration::from_secs(2 * 60),
            QueueName::ScheduledNotifications => Duration::from_secs(60),
        }
    }

    pub fn max_redelivery(&self) -> i64 {
        match self {
            QueueName::Jobs => 3,
            QueueName::Email => 3,
            QueueName::Files => 2,
            QueueName::SearchIndex => 3,
            QueueName::ScheduledNotifications => 5,
        }
    }
}

/// Proof of an in-flight claim. Ack and nack only act while the handle is
/// still the message's current one; once the visibility deadline passes and
/// another consumer claims the message, stale handles stop working.
#[derive(Debug, Clone)]
pub struct ReceiptHandle {
    pub message_id: String,
    pub queue: QueueName,
    receipt: String,
}

#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub body: String,
    pub delivery_count: i64,
    pub enqueued_at_ms: i64,
    pub handle: ReceiptHandle,
}

/// Durable partitioned queue broker over the relational store.
///
/// Guarantees: at-least-once delivery, FIFO within a producer absent
/// redelivery, and visibility exclusivity via receipt handles. Claiming
/// uses an atomic `UPDATE ... WHERE id = (SELECT ... LIMIT 1) RETURNING`
/// so no long-lived transaction blocks other consumers.
#[derive(Clone)]
pub struct QueueBroker {
    pool: SqlitePool,
    config: BrokerConfig,
}

impl QueueBroker {
    pub fn new(pool: SqlitePool, config: BrokerConfig) -> Self {
        Self { pool, config }
    }

    fn queue_label(&self, queue: QueueName) -> &str {
        match queue {
            QueueName::Jobs => &self.config.jobs_queue,
            QueueName::Email => &self.config.email_queue,
            QueueName::Files => &self.config.files_queue,
            QueueName::SearchIndex => &self.config.search_index_queue,
            QueueName::ScheduledNotifications => &self.config.scheduled_queue,
        }
    }

    /// Append a message. `delay` defers visibility, silently clamped to
    /// `MAX_SEND_DELAY`.
    pub async fn send(
        &self,
        queue: QueueName,
        body: &str,
        delay: Option<Duration>,
    ) -> AppResult<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let delay = delay.unwrap_or(Duration::ZERO).min(MAX_SEND_DELAY);
        let visible_at = now + delay.as_millis() as i64;

        sqlx::query(
            r#"
            INSERT INTO queue_messages (
                id, queue, body, enqueued_at_ms, visible_at_ms,
                delivery_count, receipt_handle, last_error
            ) VALUES (?, ?, ?, ?, ?, 0, NULL, NULL)
            "#,
        )
        .bind(&id)
        .bind(self.queue_label(queue))
        .bind(body)
        .bind(now)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(id)
    }

    /// Up to `max_count` visible messages, long-polling up to `wait`. Each
    /// returned message has its visibility deadline pushed out and its
    /// delivery counter incremented.
    pub async fn receive(
        &self,
        queue: QueueName,
        max_count: u32,
        wait: Duration,
    ) -> AppResult<Vec<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            self.sweep_exhausted(queue).await?;

            let mut claimed = Vec::new();
            for _ in 0..max_count {
                match self.claim_one(queue).await? {
                    Some(msg) => claimed.push(msg),
                    None => break,
                }
            }

            let now = tokio::time::Instant::now();
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }

            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
        }
    }

    /// Permanently remove an acked message. Fails when the handle has gone
    /// stale (deadline passed and the message was claimed again).
    pub async fn ack(&self, handle: &ReceiptHandle) -> AppResult<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND receipt_handle = ?")
            .bind(&handle.message_id)
            .bind(&handle.receipt)
            .execute(&self.pool)
            .await
            .map_err(AppError::Database)?;

        if result.rows_affected() == 0 {
            return Err(AppError::Broker(format!(
                "stale receipt handle for message {}",
                handle.message_id
            )));
        }
        Ok(())
    }

    /// Release a claim. The message becomes visible after `delay` (clamped
    /// to the queue's visibility timeout; `None` means immediately), unless
    /// its delivery counter has reached the queue's redelivery cap, in which
    /// case it moves to `dead-letters` instead.
    pub async fn nack(
        &self,
        handle: &ReceiptHandle,
        error: Option<&str>,
        delay: Option<Duration>,
    ) -> AppResult<()> {
        let delay = delay
            .unwrap_or(Duration::ZERO)
            .min(handle.queue.visibility_timeout());
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let released = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET visible_at_ms = ?, receipt_handle = NULL, last_error = COALESCE(?, last_error)
            WHERE id = ? AND receipt_handle = ?
            RETURNING id, queue, body, enqueued_at_ms, visible_at_ms,
                      delivery_count, receipt_handle, last_error
            "#,
        )
        .bind(visible_at)
        .bind(error)
        .bind(&handle.message_id)
        .bind(&handle.receipt)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        let Some(released) = released else {
            return Err(AppError::Broker(format!(
                "stale receipt handle for message {}",
                handle.message_id
            )));
        };

        if released.delivery_count >= handle.queue.max_redelivery() {
            self.bury(&released).await?;
            tracing::warn!(
                "Message {} exceeded redelivery on queue {} and moved to dead-letters",
                released.id,
                released.queue
            );
        }

        Ok(())
    }

    /// Dead-letter listing, newest first.
    pub async fn dead_letters(&self, limit: i64) -> AppResult<Vec<DeadLetter>> {
        let rows = sqlx::query_as::<_, DeadLetter>(
            r#"
            SELECT id, source_queue, body, last_error, delivery_count,
                   enqueued_at_ms, dead_at_ms
            FROM dead_letters
            ORDER BY dead_at_ms DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    async fn claim_one(&self, queue: QueueName) -> AppResult<Option<ReceivedMessage>> {
        let now = Utc::now().timestamp_millis();
        let new_deadline = now + queue.visibility_timeout().as_millis() as i64;
        let receipt = Uuid::new_v4().to_string();

        let row = sqlx::query_as::<_, QueueMessage>(
            r#"
            UPDATE queue_messages
            SET visible_at_ms = ?, delivery_count = delivery_count + 1, receipt_handle = ?
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue = ? AND visible_at_ms <= ?
                ORDER BY enqueued_at_ms ASC, rowid ASC
                LIMIT 1
            )
            RETURNING id, queue, body, enqueued_at_ms, visible_at_ms,
                      delivery_count, receipt_handle, last_error
            "#,
        )
        .bind(new_deadline)
        .bind(&receipt)
        .bind(self.queue_label(queue))
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row.map(|msg| ReceivedMessage {
            body: msg.body,
            delivery_count: msg.delivery_count,
            enqueued_at_ms: msg.enqueued_at_ms,
            handle: ReceiptHandle {
                message_id: msg.id,
                queue,
                receipt,
            },
        }))
    }

    /// Move messages whose deadline lapsed after their final permitted
    /// delivery to the dead-letter queue, so they are never handed out again.
    async fn sweep_exhausted(&self, queue: QueueName) -> AppResult<()> {
        let now = Utc::now().timestamp_millis();
        let label = self.queue_label(queue).to_string();
        let max = queue.max_redelivery();

        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, source_queue, body, last_error, delivery_count,
                enqueued_at_ms, dead_at_ms
            )
            SELECT id, queue, body, last_error, delivery_count, enqueued_at_ms, ?
            FROM queue_messages
            WHERE queue = ? AND visible_at_ms <= ? AND delivery_count >= ?
            "#,
        )
        .bind(now)
        .bind(&label)
        .bind(now)
        .bind(max)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query(
            "DELETE FROM queue_messages WHERE queue = ? AND visible_at_ms <= ? AND delivery_count >= ?",
        )
        .bind(&label)
        .bind(now)
        .bind(max)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }

    async fn bury(&self, msg: &QueueMessage) -> AppResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (
                id, source_queue, body, last_error, delivery_count,
                enqueued_at_ms, dead_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&msg.id)
        .bind(&msg.queue)
        .bind(&msg.body)
        .bind(&msg.last_error)
        .bind(msg.delivery_count)
        .bind(msg.enqueued_at_ms)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        sqlx::query("DELETE FROM queue_messages WHERE id = ?")
            .bind(&msg.id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }
}
