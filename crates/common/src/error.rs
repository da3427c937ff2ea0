use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::types::NotificationStatus;

/// Common error types used across the application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Notification {id} is already {status}")]
    AlreadyTerminal { id: i64, status: NotificationStatus },

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Closed set of error kinds the core reports to its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyTerminal,
    /// Retrying the same operation later may succeed.
    Transient,
    /// Retrying will never succeed.
    Permanent,
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Database(sqlx::Error::RowNotFound) => ErrorKind::NotFound,
            AppError::AlreadyTerminal { .. } => ErrorKind::AlreadyTerminal,
            AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Broker(_)
            | AppError::Publish(_)
            | AppError::Delivery(_) => ErrorKind::Transient,
            AppError::Serialization(_)
            | AppError::Config(_)
            | AppError::Validation(_)
            | AppError::Internal(_) => ErrorKind::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::AlreadyTerminal => StatusCode::CONFLICT,
            ErrorKind::Transient => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Permanent => match &self {
                AppError::Validation(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };

        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AppError::NotFound("x".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            AppError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            AppError::AlreadyTerminal {
                id: 1,
                status: NotificationStatus::Cancelled
            }
            .kind(),
            ErrorKind::AlreadyTerminal
        );
        assert!(AppError::Publish("down".to_string()).is_transient());
        assert_eq!(
            AppError::Validation("bad".to_string()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn test_status_codes() {
        let conflict = AppError::AlreadyTerminal {
            id: 7,
            status: NotificationStatus::Sent,
        }
        .into_response();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let bad_request = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(bad_request.status(), StatusCode::BAD_REQUEST);

        let unavailable = AppError::Publish("down".to_string()).into_response();
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
