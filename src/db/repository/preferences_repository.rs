use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::Preferences;
use crate::error::{AppError, AppResult};

const PREFERENCES_COLUMNS: &str = r#"
    user_id,
    in_app_enabled,
    in_app_types,
    email_enabled,
    email_types,
    push_enabled,
    push_types,
    sms_enabled,
    sms_types,
    sms_phone_number,
    quiet_hours_enabled,
    quiet_hours_windows,
    created_at_ms,
    updated_at_ms
"#;

/// One preferences row per user. Reads fall back to the documented
/// defaults without inserting; writes replace the whole record.
pub struct PreferencesRepository;

impl PreferencesRepository {
    pub async fn find(pool: &SqlitePool, user_id: &str) -> AppResult<Option<Preferences>> {
        let row = sqlx::query_as::<_, Preferences>(&format!(
            "SELECT {PREFERENCES_COLUMNS} FROM preferences WHERE user_id = ?"
        ))
        .bind(user_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn get_or_default(pool: &SqlitePool, user_id: &str) -> AppResult<Preferences> {
        match Self::find(pool, user_id).await? {
            Some(prefs) => Ok(prefs),
            None => Ok(Preferences::default_for(
                user_id,
                Utc::now().timestamp_millis(),
            )),
        }
    }

    /// Last-writer-wins replacement of the whole record.
    pub async fn upsert(pool: &SqlitePool, prefs: Preferences) -> AppResult<Preferences> {
        let now = Utc::now().timestamp_millis();

        let row = sqlx::query_as::<_, Preferences>(&format!(
            r#"
            INSERT INTO preferences (
                user_id, in_app_enabled, in_app_types, email_enabled, email_types,
                push_enabled, push_types, sms_enabled, sms_types, sms_phone_number,
                quiet_hours_enabled, quiet_hours_windows, created_at_ms, updated_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                in_app_enabled = excluded.in_app_enabled,
                in_app_types = excluded.in_app_types,
                email_enabled = excluded.email_enabled,
                email_types = excluded.email_types,
                push_enabled = excluded.push_enabled,
                push_types = excluded.push_types,
                sms_enabled = excluded.sms_enabled,
                sms_types = excluded.sms_types,
                sms_phone_number = excluded.sms_phone_number,
                quiet_hours_enabled = excluded.quiet_hours_enabled,
                quiet_hours_windows = excluded.quiet_hours_windows,
                updated_at_ms = excluded.updated_at_ms
            RETURNING {PREFERENCES_COLUMNS}
            "#
        ))
        .bind(prefs.user_id)
        .bind(prefs.in_app_enabled)
        .bind(prefs.in_app_types)
        .bind(prefs.email_enabled)
        .bind(prefs.email_types)
        .bind(prefs.push_enabled)
        .bind(prefs.push_types)
        .bind(prefs.sms_enabled)
        .bind(prefs.sms_types)
        .bind(prefs.sms_phone_number)
        .bind(prefs.quiet_hours_enabled)
        .bind(prefs.quiet_hours_windows)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }
}
