//! Billing error types

use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors surfaced by the billing engine
#[derive(Debug, Error)]
pub enum BillingError {
    /// User has no registered card; they must register one first
    #[error("no billing credential registered")]
    NoBillingCredential,

    /// A charge attempt did not succeed; drives PAST_DUE and retry
    #[error("charge failed ({code}): {reason}")]
    ChargeFailed { code: String, reason: String },

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("not found: {0}")]
    NotFound(String),

    /// Subscription canceled after exhausting payment retries
    #[error("maximum payment retries exceeded")]
    MaxRetriesExceeded,

    #[error("free trial already used")]
    TrialAlreadyUsed,

    #[error("user already has an active subscription")]
    AlreadySubscribed,

    #[error("invalid transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Optimistic version check failed; the row changed underneath us
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("refund failed: {0}")]
    RefundFailed(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("database error: {0}")]
    Database(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("notification error: {0}")]
    Notification(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Whether the failure is worth retrying later without user action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BillingError::ChargeFailed { .. }
                | BillingError::ConcurrentModification(_)
                | BillingError::Database(_)
                | BillingError::Gateway(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
