use sqlx::SqlitePool;

use crate::db::models::PendingDelta;
use crate::error::{AppError, AppResult};

const DELTA_COLUMNS: &str = r#"
    id,
    user_id,
    change_id,
    device_id,
    entity_kind,
    entity_id,
    operation,
    payload,
    client_timestamp_ms,
    server_timestamp_ms
"#;

/// Server-authoritative delta log, ordered per user by server timestamp.
pub struct DeltaRepository;

impl DeltaRepository {
    pub async fn insert(pool: &SqlitePool, delta: &PendingDelta) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_deltas (
                id, user_id, change_id, device_id, entity_kind, entity_id,
                operation, payload, client_timestamp_ms, server_timestamp_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&delta.id)
        .bind(&delta.user_id)
        .bind(&delta.change_id)
        .bind(&delta.device_id)
        .bind(&delta.entity_kind)
        .bind(&delta.entity_id)
        .bind(delta.operation)
        .bind(&delta.payload)
        .bind(delta.client_timestamp_ms)
        .bind(delta.server_timestamp_ms)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(())
    }

    /// An already-accepted change from the same device, for idempotent
    /// re-sends (change ids are unique per user and device).
    pub async fn find_change(
        pool: &SqlitePool,
        user_id: &str,
        device_id: &str,
        change_id: &str,
    ) -> AppResult<Option<PendingDelta>> {
        let row = sqlx::query_as::<_, PendingDelta>(&format!(
            r#"
            SELECT {DELTA_COLUMNS}
            FROM pending_deltas
            WHERE user_id = ? AND device_id = ? AND change_id = ?
            "#
        ))
        .bind(user_id)
        .bind(device_id)
        .bind(change_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Latest server timestamp recorded for an entity; drives the
    /// stale-change conflict rule.
    pub async fn latest_server_timestamp(
        pool: &SqlitePool,
        user_id: &str,
        entity_kind: &str,
        entity_id: &str,
    ) -> AppResult<Option<i64>> {
        let latest: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(server_timestamp_ms)
            FROM pending_deltas
            WHERE user_id = ? AND entity_kind = ? AND entity_id = ?
            "#,
        )
        .bind(user_id)
        .bind(entity_kind)
        .bind(entity_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(latest)
    }

    /// Deltas strictly after `after_ms`, ascending by server timestamp.
    pub async fn list_after(
        pool: &SqlitePool,
        user_id: &str,
        after_ms: i64,
    ) -> AppResult<Vec<PendingDelta>> {
        let rows = sqlx::query_as::<_, PendingDelta>(&format!(
            r#"
            SELECT {DELTA_COLUMNS}
            FROM pending_deltas
            WHERE user_id = ? AND server_timestamp_ms > ?
            ORDER BY server_timestamp_ms ASC
            "#
        ))
        .bind(user_id)
        .bind(after_ms)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(rows)
    }

    /// The user's high-water mark: the latest server timestamp on record,
    /// or 0 for a user with no retained deltas.
    pub async fn high_water_mark(pool: &SqlitePool, user_id: &str) -> AppResult<i64> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(server_timestamp_ms) FROM pending_deltas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(latest.unwrap_or(0))
    }

    /// Retention: drop deltas older than the cutoff.
    pub async fn prune_before(pool: &SqlitePool, cutoff_ms: i64) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM pending_deltas WHERE server_timestamp_ms < ?")
            .bind(cutoff_ms)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(result.rows_affected())
    }
}
