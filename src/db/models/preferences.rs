use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::notification::ChannelKind;

/// One quiet-hours window. `day` is 0 = Monday .. 6 = Sunday; times are
/// `HH:MM` in server time. A window whose end is not after its start wraps
/// past midnight into the following day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHoursWindow {
    pub day: u8,
    pub start: String,
    pub end: String,
}

/// Per-user notification preferences. One row per user; writes replace the
/// whole record (last writer wins).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Preferences {
    pub user_id: String,

    pub in_app_enabled: bool,
    /// JSON array of notification types; empty means all types.
    pub in_app_types: String,

    pub email_enabled: bool,
    pub email_types: String,

    pub push_enabled: bool,
    pub push_types: String,

    pub sms_enabled: bool,
    pub sms_types: String,
    pub sms_phone_number: Option<String>,

    pub quiet_hours_enabled: bool,
    /// JSON array of `QuietHoursWindow`.
    pub quiet_hours_windows: String,

    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct ChannelPreference {
    pub enabled: bool,
    pub types: Vec<String>,
}

impl ChannelPreference {
    /// Empty allow-list means every notification type is accepted.
    pub fn allows(&self, notification_type: &str) -> bool {
        self.enabled && (self.types.is_empty() || self.types.iter().any(|t| t == notification_type))
    }
}

impl Preferences {
    /// Defaults applied when a user has no stored record: in-app on for
    /// everything, email and push on for a small set of important types,
    /// SMS off, quiet hours off.
    pub fn default_for(user_id: &str, now_ms: i64) -> Self {
        Self {
            user_id: user_id.to_string(),
            in_app_enabled: true,
            in_app_types: "[]".to_string(),
            email_enabled: true,
            email_types: r#"["security_alert","password_expiry","backup_failed"]"#.to_string(),
            push_enabled: true,
            push_types: r#"["entry_reminder","mention","security_alert"]"#.to_string(),
            sms_enabled: false,
            sms_types: "[]".to_string(),
            sms_phone_number: None,
            quiet_hours_enabled: false,
            quiet_hours_windows: "[]".to_string(),
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    pub fn channel(&self, kind: ChannelKind) -> ChannelPreference {
        let (enabled, types) = match kind {
            ChannelKind::InApp => (self.in_app_enabled, &self.in_app_types),
            ChannelKind::Email => (self.email_enabled, &self.email_types),
            ChannelKind::Push => (self.push_enabled, &self.push_types),
            ChannelKind::Sms => (self.sms_enabled, &self.sms_types),
        };
        ChannelPreference {
            enabled,
            types: serde_json::from_str(types).unwrap_or_default(),
        }
    }

    pub fn allows(&self, kind: ChannelKind, notification_type: &str) -> bool {
        self.channel(kind).allows(notification_type)
    }

    pub fn windows(&self) -> Vec<QuietHoursWindow> {
        serde_json::from_str(&self.quiet_hours_windows).unwrap_or_default()
    }

    /// When `at` falls inside a quiet-hours window, returns the end of the
    /// latest window covering it. `None` when quiet hours are off or `at`
    /// is outside every window.
    pub fn quiet_hours_end(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.quiet_hours_enabled {
            return None;
        }

        let mut latest_end: Option<DateTime<Utc>> = None;
        for window in self.windows() {
            if let Some((start, end)) = window.interval_around(at) {
                if start <= at && at < end && latest_end.map_or(true, |cur| end > cur) {
                    latest_end = Some(end);
                }
            }
        }
        latest_end
    }

    /// First minute at or after `at` outside every quiet-hours window.
    /// Chained or overlapping windows are walked end to end.
    pub fn next_available(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let mut cursor = at;
        // Bounded walk; a schedule that covers more than this is degenerate.
        for _ in 0..64 {
            match self.quiet_hours_end(cursor) {
                Some(end) => cursor = end,
                None => break,
            }
        }
        cursor
    }
}

impl QuietHoursWindow {
    fn parse_hhmm(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M").ok()
    }

    /// Concrete UTC interval of this window that could contain `at`: the
    /// occurrence starting on `at`'s day, or the previous day for windows
    /// that wrap past midnight.
    fn interval_around(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = Self::parse_hhmm(&self.start)?;
        let end = Self::parse_hhmm(&self.end)?;

        let length = if end > start {
            end - start
        } else {
            Duration::hours(24) - (start - end)
        };

        for days_back in 0..=1 {
            let date = (at - Duration::days(days_back)).date_naive();
            if date.weekday().num_days_from_monday() != u32::from(self.day) {
                continue;
            }
            let start_dt = Utc.from_utc_datetime(&date.and_time(start));
            let end_dt = start_dt + length;
            if start_dt <= at && at < end_dt {
                return Some((start_dt, end_dt));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn nightly_quiet(user: &str) -> Preferences {
        let windows: Vec<QuietHoursWindow> = (0..7)
            .map(|day| QuietHoursWindow {
                day,
                start: "22:00".to_string(),
                end: "07:00".to_string(),
            })
            .collect();

        let mut prefs = Preferences::default_for(user, 0);
        prefs.quiet_hours_enabled = true;
        prefs.quiet_hours_windows = serde_json::to_string(&windows).unwrap();
        prefs
    }

    #[test]
    fn defaults_match_documented_channel_policy() {
        let prefs = Preferences::default_for("u1", 0);

        assert!(prefs.allows(ChannelKind::InApp, "anything_at_all"));
        assert!(prefs.allows(ChannelKind::Email, "security_alert"));
        assert!(!prefs.allows(ChannelKind::Email, "mention"));
        assert!(prefs.allows(ChannelKind::Push, "mention"));
        assert!(!prefs.allows(ChannelKind::Push, "backup_failed"));
        assert!(!prefs.allows(ChannelKind::Sms, "security_alert"));
        assert!(!prefs.quiet_hours_enabled);
    }

    #[test]
    fn empty_allow_list_accepts_all_types() {
        let pref = ChannelPreference {
            enabled: true,
            types: vec![],
        };
        assert!(pref.allows("entry_reminder"));
        assert!(pref.allows("made_up_type"));
    }

    #[test]
    fn quiet_hours_contains_wrapping_window() {
        let prefs = nightly_quiet("u1");

        // 2026-01-05 is a Monday. 23:30 is inside Monday's 22:00-07:00.
        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).unwrap();
        let end = prefs.quiet_hours_end(late).expect("inside window");
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 1, 6, 7, 0, 0).unwrap());

        // 03:00 Tuesday is still inside Monday's wrapped window.
        let early = Utc.with_ymd_and_hms(2026, 1, 6, 3, 0, 0).unwrap();
        assert!(prefs.quiet_hours_end(early).is_some());

        // Midday is outside.
        let noon = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
        assert!(prefs.quiet_hours_end(noon).is_none());
    }

    #[test]
    fn next_available_walks_to_window_end() {
        let prefs = nightly_quiet("u1");

        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).unwrap();
        assert_eq!(
            prefs.next_available(late),
            Utc.with_ymd_and_hms(2026, 1, 6, 7, 0, 0).unwrap()
        );

        // Already outside: unchanged.
        let noon = Utc.with_ymd_and_hms(2026, 1, 6, 12, 0, 0).unwrap();
        assert_eq!(prefs.next_available(noon), noon);
    }

    #[test]
    fn disabled_master_switch_ignores_windows() {
        let mut prefs = nightly_quiet("u1");
        prefs.quiet_hours_enabled = false;

        let late = Utc.with_ymd_and_hms(2026, 1, 5, 23, 30, 0).unwrap();
        assert!(prefs.quiet_hours_end(late).is_none());
    }
}
