//! Ledger records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clinicpay_shared::{BillingInterval, ParseEnumError, SubscriptionTier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Billing fields of the user record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingAccount {
    pub user_id: Uuid,
    pub email: String,
    pub name: String,
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub billing_key: Option<String>,
    pub card_company: Option<String>,
    /// Masked
    pub card_number: Option<String>,
    pub trial_used: bool,
}

impl BillingAccount {
    pub fn new(user_id: Uuid, email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id,
            email: email.into(),
            name: name.into(),
            tier: SubscriptionTier::Free,
            expires_at: None,
            billing_key: None,
            card_company: None,
            card_number: None,
            trial_used: false,
        }
    }

    pub fn has_billing_key(&self) -> bool {
        self.billing_key.is_some()
    }
}

/// Registered card stored on the account
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCard {
    pub billing_key: String,
    pub card_company: Option<String>,
    pub card_number: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Incomplete,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Incomplete => "INCOMPLETE",
            SubscriptionStatus::Trialing => "TRIALING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Canceled => "CANCELED",
        }
    }

    /// ACTIVE or PAST_DUE; at most one such row per user
    pub fn is_open(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INCOMPLETE" => Ok(SubscriptionStatus::Incomplete),
            "TRIALING" => Ok(SubscriptionStatus::Trialing),
            "ACTIVE" => Ok(SubscriptionStatus::Active),
            "PAST_DUE" => Ok(SubscriptionStatus::PastDue),
            "CANCELED" => Ok(SubscriptionStatus::Canceled),
            _ => Err(ParseEnumError::new("subscription status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    /// Gateway payment key of the charge that last paid for this subscription
    pub gateway_charge_ref: Option<String>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    /// Deferred cancellation marker
    pub cancel_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub payment_retry_count: i32,
    pub last_payment_error: Option<String>,
    pub is_trial: bool,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub trial_converted: bool,
    pub trial_ending_notified: bool,
    /// Optimistic concurrency version, bumped by the store on every update
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// A freshly paid subscription
    pub fn active(
        user_id: Uuid,
        tier: SubscriptionTier,
        interval: BillingInterval,
        charge_ref: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tier,
            status: SubscriptionStatus::Active,
            interval,
            gateway_charge_ref: Some(charge_ref.to_string()),
            current_period_start: now,
            current_period_end: interval.advance(now),
            cancel_at: None,
            canceled_at: None,
            payment_retry_count: 0,
            last_payment_error: None,
            is_trial: false,
            trial_started_at: None,
            trial_ends_at: None,
            trial_converted: false,
            trial_ending_notified: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A free trial window
    pub fn trial(
        user_id: Uuid,
        tier: SubscriptionTier,
        now: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tier,
            status: SubscriptionStatus::Trialing,
            interval: BillingInterval::Monthly,
            gateway_charge_ref: None,
            current_period_start: now,
            current_period_end: ends_at,
            cancel_at: None,
            canceled_at: None,
            payment_retry_count: 0,
            last_payment_error: None,
            is_trial: true,
            trial_started_at: Some(now),
            trial_ends_at: Some(ends_at),
            trial_converted: false,
            trial_ending_notified: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PaymentStatus::Pending),
            "PAID" => Ok(PaymentStatus::Paid),
            "FAILED" => Ok(PaymentStatus::Failed),
            "REFUNDED" => Ok(PaymentStatus::Refunded),
            "PARTIALLY_REFUNDED" => Ok(PaymentStatus::PartiallyRefunded),
            _ => Err(ParseEnumError::new("payment status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub order_id: String,
    pub order_name: String,
    pub tier: SubscriptionTier,
    pub interval: BillingInterval,
    pub amount: i64,
    pub base_amount: i64,
    pub overage_amount: i64,
    pub overage_count: i32,
    pub refunded_amount: i64,
    pub status: PaymentStatus,
    pub payment_key: Option<String>,
    pub card_company: Option<String>,
    pub card_number: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// A charge attempt about to be sent to the gateway
    pub fn pending(
        user_id: Uuid,
        order_id: String,
        order_name: String,
        tier: SubscriptionTier,
        interval: BillingInterval,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            subscription_id: None,
            order_id,
            order_name,
            tier,
            interval,
            amount,
            base_amount: amount,
            overage_amount: 0,
            overage_count: 0,
            refunded_amount: 0,
            status: PaymentStatus::Pending,
            payment_key: None,
            card_company: None,
            card_number: None,
            receipt_url: None,
            failure_code: None,
            failure_message: None,
            paid_at: None,
            failed_at: None,
            refunded_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refundable_amount(&self) -> i64 {
        (self.amount - self.refunded_amount).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Completed,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Completed => "COMPLETED",
            RefundStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RefundStatus::Pending),
            "COMPLETED" => Ok(RefundStatus::Completed),
            "FAILED" => Ok(RefundStatus::Failed),
            _ => Err(ParseEnumError::new("refund status", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub status: RefundStatus,
    pub refund_key: Option<String>,
    pub failure_reason: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UsageType {
    AiQuery,
}

impl UsageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageType::AiQuery => "AI_QUERY",
        }
    }
}

impl fmt::Display for UsageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AI_QUERY" => Ok(UsageType::AiQuery),
            _ => Err(ParseEnumError::new("usage type", s)),
        }
    }
}
