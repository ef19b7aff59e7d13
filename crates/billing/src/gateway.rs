//! Payment gateway contract
//!
//! The engine depends on this trait rather than on the HTTP client directly,
//! so scenario tests can script gateway behaviour.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failure_codes::{self, FailureInfo};

/// Failure talking to the payment gateway
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// No response within the configured timeout; outcome unknown
    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway transport error: {0}")]
    Http(String),

    #[error("gateway rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl GatewayError {
    pub fn code(&self) -> &str {
        match self {
            GatewayError::Timeout => "TIMEOUT",
            GatewayError::Http(_) => "PROVIDER_ERROR",
            GatewayError::Rejected { code, .. } => code,
            GatewayError::Decode(_) => "PROVIDER_ERROR",
        }
    }

    pub fn failure_info(&self) -> FailureInfo {
        failure_codes::classify(self.code())
    }
}

/// Card fields submitted once to obtain a billing key. Never persisted.
#[derive(Clone, Deserialize)]
pub struct CardDetails {
    pub card_number: String,
    pub expiry_year: String,
    pub expiry_month: String,
    /// First two digits of the card PIN
    pub card_password: String,
    /// Birth date (YYMMDD) or business registration number
    pub identity_number: String,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardDetails")
            .field("card_number", &mask_card_number(&self.card_number))
            .field("expiry_year", &"**")
            .field("expiry_month", &"**")
            .field("card_password", &"**")
            .field("identity_number", &"******")
            .finish()
    }
}

/// Keep the first four and last four digits
pub fn mask_card_number(number: &str) -> String {
    let digits: Vec<char> = number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 8 {
        return "*".repeat(digits.len());
    }
    let head: String = digits[..4].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(digits.len() - 8), tail)
}

/// Result of registering a card
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedBillingKey {
    pub billing_key: String,
    pub card_company: Option<String>,
    /// Masked by the gateway
    pub card_number: Option<String>,
    pub card_type: Option<String>,
}

/// One off-session charge against a billing key
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub billing_key: String,
    pub customer_key: String,
    pub amount: i64,
    pub order_id: String,
    pub order_name: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
}

/// Payment status as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    Ready,
    InProgress,
    WaitingForDeposit,
    Done,
    Canceled,
    PartialCanceled,
    Aborted,
    Expired,
    #[serde(other)]
    Unknown,
}

impl GatewayPaymentStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "READY" => GatewayPaymentStatus::Ready,
            "IN_PROGRESS" => GatewayPaymentStatus::InProgress,
            "WAITING_FOR_DEPOSIT" => GatewayPaymentStatus::WaitingForDeposit,
            "DONE" => GatewayPaymentStatus::Done,
            "CANCELED" => GatewayPaymentStatus::Canceled,
            "PARTIAL_CANCELED" => GatewayPaymentStatus::PartialCanceled,
            "ABORTED" => GatewayPaymentStatus::Aborted,
            "EXPIRED" => GatewayPaymentStatus::Expired,
            _ => GatewayPaymentStatus::Unknown,
        }
    }
}

/// Gateway response to a charge
#[derive(Debug, Clone)]
pub struct ChargeReceipt {
    pub payment_key: String,
    pub order_id: String,
    pub status: GatewayPaymentStatus,
    pub approved_at: Option<DateTime<Utc>>,
    pub total_amount: i64,
    pub card_company: Option<String>,
    pub card_number: Option<String>,
    pub receipt_url: Option<String>,
}

impl ChargeReceipt {
    /// Only DONE counts as money taken
    pub fn is_done(&self) -> bool {
        self.status == GatewayPaymentStatus::Done
    }
}

/// Gateway response to a cancel (refund) request
#[derive(Debug, Clone)]
pub struct CancelReceipt {
    pub payment_key: String,
    pub status: GatewayPaymentStatus,
    /// Transaction key of the cancel just performed
    pub refund_key: Option<String>,
    pub canceled_amount: i64,
}

/// The external payment provider
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Exchange card details for a reusable billing key
    async fn issue_billing_key(
        &self,
        customer_key: &str,
        card: &CardDetails,
    ) -> Result<IssuedBillingKey, GatewayError>;

    /// Charge a billing key. The gateway deduplicates by `order_id`.
    async fn charge_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError>;

    /// Cancel (refund) all or part of a payment
    async fn cancel_payment(
        &self,
        payment_key: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<CancelReceipt, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_card_number() {
        assert_eq!(mask_card_number("4330123412345678"), "4330********5678");
        assert_eq!(mask_card_number("4330-1234-1234-5678"), "4330********5678");
        assert_eq!(mask_card_number("1234"), "****");
    }

    #[test]
    fn test_card_details_debug_is_redacted() {
        let card = CardDetails {
            card_number: "4330123412345678".to_string(),
            expiry_year: "29".to_string(),
            expiry_month: "12".to_string(),
            card_password: "12".to_string(),
            identity_number: "900101".to_string(),
        };
        let debug = format!("{:?}", card);
        assert!(!debug.contains("4330123412345678"));
        assert!(!debug.contains("900101"));
    }

    #[test]
    fn test_gateway_status_parse() {
        assert_eq!(GatewayPaymentStatus::parse("DONE"), GatewayPaymentStatus::Done);
        assert_eq!(
            GatewayPaymentStatus::parse("PARTIAL_CANCELED"),
            GatewayPaymentStatus::PartialCanceled
        );
        assert_eq!(GatewayPaymentStatus::parse("??"), GatewayPaymentStatus::Unknown);
    }

    #[test]
    fn test_timeout_error_code() {
        assert_eq!(GatewayError::Timeout.code(), "TIMEOUT");
        assert!(GatewayError::Timeout.failure_info().retryable);
    }
}
