use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Bad Request",
    "message": "Insufficient coins: requested 200000, available 1500",
    "request_id": "req-abc123xyz",
    "timestamp": "2024-12-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Extra context such as the gateway's failure reason and field
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Insufficient coins: {0}")]
    InsufficientCoins(String),

    #[error("Invalid discount: {0}")]
    InvalidDiscount(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Payment gateway error: {message}")]
    PaymentGatewayError {
        message: String,
        reason: Option<String>,
        field: Option<String>,
    },

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
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
    pub fn payment_gateway(message: impl Into<String>) -> Self {
        ServiceError::PaymentGatewayError {
            message: message.into(),
            reason: None,
            field: None,
        }
    }

    /// Short machine-readable label, used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "database",
            Self::NotFound(_) => "not_found",
            Self::ValidationError(_) | Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::InsufficientCoins(_) => "insufficient_coins",
            Self::InvalidDiscount(_) => "invalid_discount",
            Self::InsufficientStock(_) => "insufficient_stock",
            Self::PaymentGatewayError { .. } => "payment_gateway",
            Self::ExternalServiceError(_) => "external_service",
            Self::InternalError(_) | Self::SerializationError(_) | Self::Other(_) => "internal",
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_)
            | Self::BadRequest(_)
            | Self::InsufficientCoins(_)
            | Self::InvalidDiscount(_)
            | Self::InsufficientStock(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::PaymentGatewayError { .. }
            | Self::InternalError(_)
            | Self::SerializationError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::SerializationError(_) | Self::Other(_) => {
                "Internal server error".to_string()
            }
            Self::NotFound(msg)
            | Self::ValidationError(msg)
            | Self::BadRequest(msg)
            | Self::Unauthorized(msg)
            | Self::InsufficientCoins(msg)
            | Self::InvalidDiscount(msg)
            | Self::InsufficientStock(msg) => msg.clone(),
            Self::PaymentGatewayError { message, .. } => {
                format!("Payment gateway error: {}", message)
            }
            Self::ExternalServiceError(_) => self.to_string(),
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            Self::PaymentGatewayError { reason, field, .. } => {
                let parts: Vec<String> = [
                    reason.as_ref().map(|r| format!("reason: {}", r)),
                    field.as_ref().map(|f| format!("field: {}", f)),
                ]
                .into_iter()
                .flatten()
                .collect();
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join(", "))
                }
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        }

        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.details(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
