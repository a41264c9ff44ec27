use crate::db::DbError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, ApiError>;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Database(DbError::PoolExhausted { .. } | DbError::Connection(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message; never carries driver or SQL details
    fn public_message(&self) -> &'static str {
        match self {
            ApiError::Database(DbError::PoolExhausted { .. }) => {
                "Service is busy, please retry shortly"
            }
            ApiError::Database(DbError::Connection(_)) => "Database is unavailable",
            ApiError::Database(_) => "Database operation failed",
            _ => "Internal server error",
        }
    }
}

/// JSON body of every error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub error_code: u16,
    /// Matches the `request_id` field of the server-side log line
    pub request_id: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>, status_code: StatusCode) -> Self {
        Self {
            message: message.into(),
            error_code: status_code.as_u16(),
            request_id: Uuid::new_v4().to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse::new(self.public_message(), status);

        // The only place a request failure is logged
        if status == StatusCode::SERVICE_UNAVAILABLE {
            warn!(request_id = %body.request_id, error = %self, "Request failed");
        } else {
            error!(request_id = %body.request_id, error = %self, "Request failed");
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TxStage;
    use std::time::Duration;

    #[test]
    fn test_pool_errors_map_to_service_unavailable() {
        let exhausted = ApiError::from(DbError::PoolExhausted {
            waited: Duration::from_secs(60),
        });
        assert_eq!(exhausted.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let refused = ApiError::from(DbError::Connection("refused".into()));
        assert_eq!(refused.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_other_errors_map_to_internal_error() {
        let failed_commit = ApiError::from(DbError::Transaction {
            stage: TxStage::Commit,
            source: "deadlock".into(),
        });
        assert_eq!(failed_commit.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let closed = ApiError::from(DbError::AlreadyClosed);
        assert_eq!(closed.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

        let internal = ApiError::Internal("boom".to_string());
        assert_eq!(internal.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_public_message_hides_driver_details() {
        let err = ApiError::from(DbError::Query {
            sql: "SELECT secret FROM users".to_string(),
            source: "Access denied for user 'root'".into(),
        });

        let message = err.public_message();
        assert!(!message.contains("secret"));
        assert!(!message.contains("root"));
    }

    #[test]
    fn test_error_response_creation() {
        let body = ErrorResponse::new("Test error", StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.message, "Test error");
        assert_eq!(body.error_code, 503);
        assert!(!body.request_id.is_empty());
    }
}
