use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};

/// Error body returned by the HTTP boundary adapters
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// ISO 8601 timestamp when error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    /// An operation was attempted from a status that does not permit it.
    #[error("Invalid state transition: cannot {action} {entity} in status '{from}'")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        action: &'static str,
    },

    #[error("Gateway not configured: {0}")]
    GatewayNotConfigured(String),

    #[error("Gateway connection failure ({gateway}): {message}")]
    GatewayConnectionFailure { gateway: String, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(i64),

    #[error("Encryption error: {0}")]
    EncryptionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::SerializationError(err.to_string())
    }
}

impl ServiceError {
    pub fn invalid_transition(
        entity: &'static str,
        from: impl AsRef<str>,
        action: &'static str,
    ) -> Self {
        ServiceError::InvalidStateTransition {
            entity,
            from: from.as_ref().to_string(),
            action,
        }
    }

    pub fn connection_failure(gateway: impl Into<String>, message: impl Into<String>) -> Self {
        ServiceError::GatewayConnectionFailure {
            gateway: gateway.into(),
            message: message.into(),
        }
    }

    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, ServiceError::InvalidStateTransition { .. })
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::InvalidStateTransition { .. } | Self::GatewayNotConfigured(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::GatewayConnectionFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::Conflict(_) | Self::ConcurrentModification(_) => StatusCode::CONFLICT,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::DatabaseError(_)
            | Self::EncryptionError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::EncryptionError(_)
            | Self::SerializationError(_)
            | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::ConcurrentModification(id) => {
                format!("Concurrent modification for ID {}", id)
            }
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn service_error_status_code_mapping() {
        assert_eq!(
            ServiceError::NotFound("x".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServiceError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServiceError::invalid_transition("payment", "failed", "capture").status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::GatewayNotConfigured("x".into()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ServiceError::connection_failure("stripe", "timeout").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ServiceError::ConcurrentModification(7).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            ServiceError::EncryptionError("bad key".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn invalid_transition_message_names_status_and_action() {
        let err = ServiceError::invalid_transition("payment", "completed", "cancel");
        assert_eq!(
            err.to_string(),
            "Invalid state transition: cannot cancel payment in status 'completed'"
        );
        assert!(err.is_invalid_transition());
    }

    #[test]
    fn response_message_hides_internal_details() {
        assert_eq!(
            ServiceError::EncryptionError("key material".into()).response_message(),
            "Internal server error"
        );
        assert_eq!(
            ServiceError::NotFound("Payment 4 not found".into()).response_message(),
            "Not found: Payment 4 not found"
        );
    }

    #[tokio::test]
    async fn into_response_renders_error_body() {
        let response = ServiceError::Conflict("open payment exists".into()).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let payload: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload.error, "Conflict");
        assert_eq!(payload.message, "Conflict: open payment exists");
    }
}
