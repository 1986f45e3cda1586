//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clipmeter_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Webhook signature verification failed")]
    InvalidSignature,

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::InsufficientCredits { .. } => {
                (StatusCode::PAYMENT_REQUIRED, "insufficient_credits")
            }
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "invalid_signature"),
            ApiError::ServiceUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }

        // Internal details stay in the logs
        let message = match &self {
            ApiError::Database(_) | ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let body = match &self {
            ApiError::InsufficientCredits {
                required,
                available,
            } => json!({
                "error": code,
                "message": message,
                "status": "denied",
                "required": required,
                "available": available,
            }),
            _ => json!({ "error": code, "message": message }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(err: BillingError) -> Self {
        match err {
            BillingError::InsufficientCredits {
                required,
                available,
            } => ApiError::InsufficientCredits {
                required,
                available,
            },
            BillingError::AccountNotFound(_)
            | BillingError::TransactionNotFound(_)
            | BillingError::SubscriptionNotFound(_)
            | BillingError::JobNotFound(_) => ApiError::NotFound(err.to_string()),
            BillingError::AccountExists(_)
            | BillingError::AccountInactive(_)
            | BillingError::DuplicateJob(_)
            | BillingError::JobAlreadySettled { .. } => ApiError::Conflict(err.to_string()),
            BillingError::InvalidRefund(_)
            | BillingError::InvalidInput(_)
            | BillingError::InvalidTier(_)
            | BillingError::WebhookPayload(_) => ApiError::Validation(err.to_string()),
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::PaymentProviderUnavailable(_) | BillingError::ProviderNotConfigured => {
                ApiError::ServiceUnavailable(err.to_string())
            }
            BillingError::Provider(msg) => {
                ApiError::Internal(format!("payment provider rejected request: {msg}"))
            }
            BillingError::Queue(msg) => ApiError::ServiceUnavailable(format!("job queue: {msg}")),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::CorruptRecord(msg) => ApiError::Internal(msg),
        }
    }
}
