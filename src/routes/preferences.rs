use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::db::models::{ChannelKind, Preferences, QuietHoursWindow};
use crate::db::repository::PreferencesRepository;
use crate::error::AppResult;
use crate::routes::auth::AuthUser;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/", get(get_preferences).put(put_preferences))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBody {
    pub enabled: bool,
    /// Empty means all notification types.
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsBody {
    pub enabled: bool,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHoursBody {
    pub enabled: bool,
    #[serde(default)]
    pub windows: Vec<QuietHoursWindow>,
}

/// Whole-record preferences shape; PUT replaces everything (last writer
/// wins).
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesBody {
    pub in_app: ChannelBody,
    pub email: ChannelBody,
    pub push: ChannelBody,
    pub sms: SmsBody,
    pub quiet_hours: QuietHoursBody,
}

impl PreferencesBody {
    fn from_record(prefs: &Preferences) -> Self {
        let channel = |kind: ChannelKind| {
            let pref = prefs.channel(kind);
            ChannelBody {
                enabled: pref.enabled,
                types: pref.types,
            }
        };
        Self {
            in_app: channel(ChannelKind::InApp),
            email: channel(ChannelKind::Email),
            push: channel(ChannelKind::Push),
            sms: SmsBody {
                enabled: prefs.sms_enabled,
                types: prefs.channel(ChannelKind::Sms).types,
                phone_number: prefs.sms_phone_number.clone(),
            },
            quiet_hours: QuietHoursBody {
                enabled: prefs.quiet_hours_enabled,
                windows: prefs.windows(),
            },
        }
    }

    fn into_record(self, user_id: &str) -> Preferences {
        let now = Utc::now().timestamp_millis();
        let types = |t: &[String]| serde_json::to_string(t).unwrap_or_else(|_| "[]".to_string());
        Preferences {
            user_id: user_id.to_string(),
            in_app_enabled: self.in_app.enabled,
            in_app_types: types(&self.in_app.types),
            email_enabled: self.email.enabled,
            email_types: types(&self.email.types),
            push_enabled: self.push.enabled,
            push_types: types(&self.push.types),
            sms_enabled: self.sms.enabled,
            sms_types: types(&self.sms.types),
            sms_phone_number: self.sms.phone_number,
            quiet_hours_enabled: self.quiet_hours.enabled,
            quiet_hours_windows: serde_json::to_string(&self.quiet_hours.windows)
                .unwrap_or_else(|_| "[]".to_string()),
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn get_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
) -> AppResult<Json<PreferencesBody>> {
    let prefs = PreferencesRepository::get_or_default(&state.db, &user_id).await?;
    Ok(Json(PreferencesBody::from_record(&prefs)))
}

async fn put_preferences(
    State(state): State<Arc<AppState>>,
    AuthUser(user_id): AuthUser,
    Json(body): Json<PreferencesBody>,
) -> AppResult<Json<PreferencesBody>> {
    let stored = PreferencesRepository::upsert(&state.db, body.into_record(&user_id)).await?;
    Ok(Json(PreferencesBody::from_record(&stored)))
}
