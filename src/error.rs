use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("No template registered: {0}")]
    NoTemplate(String),

    #[error("Mail provider error: {0}")]
    Mail(String),

    #[error("Push gateway error: {0}")]
    Push(String),

    #[error("SMS gateway error: {0}")]
    Sms(String),

    #[error("Queue broker error: {0}")]
    Broker(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("External service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            AppError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::NoTemplate(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "NO_TEMPLATE", msg.clone())
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "DATABASE_ERROR",
                    "A database error occurred".to_string(),
                )
            }
            AppError::Jwt(e) => {
                tracing::warn!("JWT error: {:?}", e);
                (
                    StatusCode::UNAUTHORIZED,
                    "INVALID_TOKEN",
                    "Invalid or expired token".to_string(),
                )
            }
            AppError::Request(e) => {
                tracing::error!("HTTP request error: {:?}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    "EXTERNAL_REQUEST_FAILED",
                    "Failed to communicate with external service".to_string(),
                )
            }
            AppError::Mail(msg) => {
                tracing::error!("Mail provider error: {}", msg);
                (StatusCode::BAD_GATEWAY, "MAIL_ERROR", msg.clone())
            }
            AppError::Push(msg) => {
                tracing::error!("Push gateway error: {}", msg);
                (StatusCode::BAD_GATEWAY, "PUSH_ERROR", msg.clone())
            }
            AppError::Sms(msg) => {
                tracing::error!("SMS gateway error: {}", msg);
                (StatusCode::BAD_GATEWAY, "SMS_ERROR", msg.clone())
            }
            AppError::Broker(msg) => {
                tracing::error!("Queue broker error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BROKER_ERROR",
                    msg.clone(),
                )
            }
            AppError::Config(msg) => {
                tracing::error!("Configuration error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CONFIG_ERROR",
                    "Server configuration error".to_string(),
                )
            }
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE",
                msg.clone(),
            ),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ErrorResponse {
            error: ErrorBody {
                code: code.to_string(),
                message,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl AppError {
    /// Whether a failed delivery attempt should be retried through the queue
    /// broker. Permanent errors (bounces, bad templates, missing contact
    /// endpoints) go straight to the delivery log; everything transient is
    /// eligible for redelivery up to the queue's cap.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Request(_) | AppError::ServiceUnavailable(_) | AppError::Database(_) => true,
            AppError::Mail(msg) | AppError::Push(msg) | AppError::Sms(msg) => {
                let m = msg.to_lowercase();
                if m.contains("429")
                    || m.contains("too many requests")
                    || m.contains("timeout")
                    || m.contains("timed out")
                    || m.contains("temporarily unavailable")
                    || m.contains("service unavailable")
                    || m.contains("bad gateway")
                    || m.contains("connection reset")
                {
                    return true;
                }
                // Messages shaped like "mail provider error (503 ...)":
                // any 5xx status is worth a retry.
                parenthesized_status(&m).is_some_and(|code| code >= 500)
            }
            _ => false,
        }
    }
}

fn parenthesized_status(message: &str) -> Option<u16> {
    let open = message.find('(')?;
    let rest = &message[open + 1..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

pub type AppResult<T> = Result<T, AppError>;
