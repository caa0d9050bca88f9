use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub broker: BrokerConfig,
    pub notifications: NotificationsConfig,
    pub providers: ProvidersConfig,
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path the live transport upgrades on.
    pub live_session_path: String,
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Seconds of silence before an open session is evicted.
    pub idle_seconds: u64,
    /// Interval between registry heartbeat pings.
    pub heartbeat_seconds: u64,
    /// How long shutdown waits for workers to drain.
    pub shutdown_grace_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    pub jobs_queue: String,
    pub email_queue: String,
    pub files_queue: String,
    pub search_index_queue: String,
    pub scheduled_queue: String,
    /// How often (seconds) queue consumers poll when idle.
    pub poll_interval_seconds: u64,
    /// Messages claimed per consumer poll.
    pub receive_batch: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsConfig {
    /// Days a terminal notification is retained before the reaper prunes it.
    pub retention_days: i64,
    /// Interval between scheduled-notification drain ticks.
    pub scheduled_tick_seconds: u64,
    pub mail_from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvidersConfig {
    pub mail_url: String,
    pub push_url: String,
    pub sms_url: String,
    pub mail_timeout_seconds: u64,
    pub push_timeout_seconds: u64,
    pub sms_timeout_seconds: u64,
}

/// Internal services this subsystem consumes but does not own.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub user_directory_url: String,
    pub device_token_url: String,
    pub entry_service_url: String,
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse()
        .unwrap_or(default)
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env_or("HOST", "0.0.0.0"),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
                live_session_path: env_or("LIVE_SESSION_PATH", "/ws"),
                frontend_url: env_or("FRONTEND_URL", "http://localhost:3000"),
            },
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "sqlite://data/journal.db"),
                max_connections: env_u64("DATABASE_MAX_CONNECTIONS", 5) as u32,
            },
            jwt: JwtConfig {
                secret: env::var("JWT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("JWT_SECRET".to_string()))?,
            },
            session: SessionConfig {
                idle_seconds: env_u64("T_IDLE_SECONDS", 60),
                heartbeat_seconds: env_u64("T_HEARTBEAT_SECONDS", 30),
                shutdown_grace_seconds: env_u64("SHUTDOWN_GRACE_SECONDS", 10),
            },
            broker: BrokerConfig {
                jobs_queue: env_or("BROKER_JOBS_QUEUE", "jobs"),
                email_queue: env_or("BROKER_EMAIL_QUEUE", "email"),
                files_queue: env_or("BROKER_FILES_QUEUE", "files"),
                search_index_queue: env_or("BROKER_SEARCH_INDEX_QUEUE", "search-index"),
                scheduled_queue: env_or(
                    "BROKER_SCHEDULED_NOTIFICATIONS_QUEUE",
                    "scheduled-notifications",
                ),
                poll_interval_seconds: env_u64("BROKER_POLL_INTERVAL_SECONDS", 5),
                receive_batch: env_u64("BROKER_RECEIVE_BATCH", 10) as u32,
            },
            notifications: NotificationsConfig {
                retention_days: env_u64("NOTIFICATION_RETENTION_DAYS", 30) as i64,
                scheduled_tick_seconds: env_u64("SCHEDULED_TICK_SECONDS", 10),
                mail_from: env_or("MAIL_FROM", "journal@localhost"),
            },
            providers: ProvidersConfig {
                mail_url: env_or("MAIL_PROVIDER_URL", "http://localhost:9101"),
                push_url: env_or("PUSH_GATEWAY_URL", "http://localhost:9102"),
                sms_url: env_or("SMS_GATEWAY_URL", "http://localhost:9103"),
                mail_timeout_seconds: env_u64("MAIL_TIMEOUT_SECONDS", 10),
                push_timeout_seconds: env_u64("PUSH_TIMEOUT_SECONDS", 5),
                sms_timeout_seconds: env_u64("SMS_TIMEOUT_SECONDS", 5),
            },
            upstream: UpstreamConfig {
                user_directory_url: env_or("USER_DIRECTORY_URL", "http://localhost:9104"),
                device_token_url: env_or("DEVICE_TOKEN_URL", "http://localhost:9105"),
                entry_service_url: env_or("ENTRY_SERVICE_URL", "http://localhost:9106"),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                live_session_path: "/ws".to_string(),
                frontend_url: "http://localhost:3000".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite://data/journal.db".to_string(),
                max_connections: 5,
            },
            jwt: JwtConfig {
                secret: String::new(),
            },
            session: SessionConfig {
                idle_seconds: 60,
                heartbeat_seconds: 30,
                shutdown_grace_seconds: 10,
            },
            broker: BrokerConfig {
                jobs_queue: "jobs".to_string(),
                email_queue: "email".to_string(),
                files_queue: "files".to_string(),
                search_index_queue: "search-index".to_string(),
                scheduled_queue: "scheduled-notifications".to_string(),
                poll_interval_seconds: 5,
                receive_batch: 10,
            },
            notifications: NotificationsConfig {
                retention_days: 30,
                scheduled_tick_seconds: 10,
                mail_from: "journal@localhost".to_string(),
            },
            providers: ProvidersConfig {
                mail_url: "http://localhost:9101".to_string(),
                push_url: "http://localhost:9102".to_string(),
                sms_url: "http://localhost:9103".to_string(),
                mail_timeout_seconds: 10,
                push_timeout_seconds: 5,
                sms_timeout_seconds: 5,
            },
            upstream: UpstreamConfig {
                user_directory_url: "http://localhost:9104".to_string(),
                device_token_url: "http://localhost:9105".to_string(),
                entry_service_url: "http://localhost:9106".to_string(),
            },
        }
    }
}
