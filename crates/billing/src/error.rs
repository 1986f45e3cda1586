//! Billing error types

use uuid::Uuid;

/// Result alias used throughout the billing crate
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Insufficient credits: required {required}, available {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error("Account not found: {0}")]
    AccountNotFound(Uuid),

    #[error("Account already exists: {0}")]
    AccountExists(Uuid),

    #[error("Account is deactivated: {0}")]
    AccountInactive(Uuid),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(Uuid),

    #[error("Invalid refund: {0}")]
    InvalidRefund(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid tier: {0}")]
    InvalidTier(String),

    #[error("No subscription found for account {0}")]
    SubscriptionNotFound(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job already exists: {0}")]
    DuplicateJob(Uuid),

    #[error("Job {job_id} is already settled ({state})")]
    JobAlreadySettled { job_id: Uuid, state: String },

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    WebhookPayload(String),

    #[error("Payment provider unavailable: {0}")]
    PaymentProviderUnavailable(String),

    #[error("Payment provider rejected request: {0}")]
    Provider(String),

    #[error("Payment provider is not configured")]
    ProviderNotConfigured,

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),
}

impl BillingError {
    /// Errors worth retrying against the payment provider
    pub fn is_transient(&self) -> bool {
        matches!(self, BillingError::PaymentProviderUnavailable(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Queue(err.to_string())
    }
}

impl From<clipmeter_shared::ParseEnumError> for BillingError {
    fn from(err: clipmeter_shared::ParseEnumError) -> Self {
        BillingError::CorruptRecord(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        match &err {
            // 429 and 5xx responses are the provider's problem, not the request's
            stripe::StripeError::Stripe(request_err)
                if request_err.http_status == 429 || request_err.http_status >= 500 =>
            {
                BillingError::PaymentProviderUnavailable(err.to_string())
            }
            stripe::StripeError::Stripe(_) => BillingError::Provider(err.to_string()),
            stripe::StripeError::Timeout | stripe::StripeError::ClientError(_) => {
                BillingError::PaymentProviderUnavailable(err.to_string())
            }
            _ => BillingError::Provider(err.to_string()),
        }
    }
}
