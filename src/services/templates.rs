use std::collections::HashMap;

use crate::db::models::{ChannelKind, Notification};
use crate::error::{AppError, AppResult};

/// Hard limit for text-message bodies.
pub const SMS_LIMIT: usize = 160;

/// A registered template: placeholder strings expanded from notification
/// fields plus the free-form data object. Rendering is deterministic and
/// side-effect-free.
#[derive(Debug, Clone)]
pub struct Template {
    pub title: String,
    pub body: String,
}

/// Channel-shaped output of a render.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderedPayload {
    InApp {
        title: String,
        body: String,
        data: serde_json::Value,
    },
    Mail {
        subject: String,
        html: String,
        text: String,
    },
    Push {
        title: String,
        body: String,
        data: serde_json::Value,
    },
    Sms {
        text: String,
    },
}

/// Templates keyed by (notification type, channel). A missing key is a
/// recoverable error: the dispatcher skips that channel and records the
/// miss in the delivery log.
pub struct TemplateRenderer {
    templates: HashMap<(String, ChannelKind), Template>,
}

/// Notification types this subsystem ships templates for out of the box.
const BUILTIN_TYPES: [&str; 6] = [
    "security_alert",
    "password_expiry",
    "backup_failed",
    "entry_reminder",
    "mention",
    "daily",
];

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TemplateRenderer {
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Generic templates for every builtin type on every channel; callers
    /// can overwrite individual keys with `register`.
    pub fn with_defaults() -> Self {
        let mut renderer = Self::empty();
        for notification_type in BUILTIN_TYPES {
            for channel in ChannelKind::ALL {
                let template = match channel {
                    ChannelKind::Sms => Template {
                        title: String::new(),
                        body: "{title}: {message}".to_string(),
                    },
                    _ => Template {
                        title: "{title}".to_string(),
                        body: "{message}".to_string(),
                    },
                };
                renderer.register(notification_type, channel, template);
            }
        }
        renderer
    }

    pub fn register(&mut self, notification_type: &str, channel: ChannelKind, template: Template) {
        self.templates
            .insert((notification_type.to_string(), channel), template);
    }

    pub fn render(
        &self,
        notification: &Notification,
        channel: ChannelKind,
    ) -> AppResult<RenderedPayload> {
        let template = self
            .templates
            .get(&(notification.notification_type.clone(), channel))
            .ok_or_else(|| {
                AppError::NoTemplate(format!(
                    "{}/{}",
                    notification.notification_type,
                    channel.as_str()
                ))
            })?;

        let data = notification.data_value();
        let title = expand(&template.title, notification, &data);
        let body = expand(&template.body, notification, &data);

        Ok(match channel {
            ChannelKind::InApp => RenderedPayload::InApp {
                title,
                body,
                data: data.clone(),
            },
            ChannelKind::Email => RenderedPayload::Mail {
                subject: title.clone(),
                html: format!("<h2>{}</h2><p>{}</p>", title, body),
                text: body,
            },
            ChannelKind::Push => RenderedPayload::Push {
                title,
                body,
                data: data.clone(),
            },
            ChannelKind::Sms => RenderedPayload::Sms {
                text: truncate_sms(&body),
            },
        })
    }
}

/// Replace `{title}`, `{message}`, and `{key}` for every scalar key of the
/// data object. Unknown placeholders are left in place.
fn expand(template: &str, notification: &Notification, data: &serde_json::Value) -> String {
    let mut out = template
        .replace("{title}", &notification.title)
        .replace("{message}", &notification.message);

    if let Some(map) = data.as_object() {
        for (key, value) in map {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => continue,
            };
            out = out.replace(&format!("{{{key}}}"), &rendered);
        }
    }
    out
}

fn truncate_sms(text: &str) -> String {
    if text.chars().count() <= SMS_LIMIT {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(SMS_LIMIT - 3).collect();
    truncated.push_str("...");
    truncated
}
