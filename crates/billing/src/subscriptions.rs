//! Subscription management

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clinicpay_shared::{BillingInterval, SubscriptionTier};
use serde::Serialize;
use uuid::Uuid;

use crate::charge::{ChargeExecutor, ChargeOutcome};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{CardDetails, GatewayError, PaymentGateway};
use crate::lifecycle::{LifecycleEvent, SubscriptionLifecycle, Transition};
use crate::models::{StoredCard, Subscription, SubscriptionStatus};
use crate::orders::customer_key;
use crate::store::LedgerStore;

/// Result of registering a card
#[derive(Debug, Clone, Serialize)]
pub struct CardRegistration {
    pub billing_key_registered: bool,
    pub card_company: Option<String>,
    /// Masked
    pub card_number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardSummary {
    pub company: Option<String>,
    pub number: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSummary {
    pub id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub interval: BillingInterval,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    pub cancel_at: Option<DateTime<Utc>>,
    pub is_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_payment_error: Option<String>,
}

impl From<&Subscription> for SubscriptionSummary {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id,
            tier: sub.tier,
            status: sub.status,
            interval: sub.interval,
            current_period_start: sub.current_period_start,
            current_period_end: sub.current_period_end,
            cancel_at: sub.cancel_at,
            is_trial: sub.is_trial,
            trial_ends_at: sub.trial_ends_at,
            retry_count: sub.payment_retry_count,
            last_payment_error: sub.last_payment_error.clone(),
        }
    }
}

/// What the user currently has
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionInfo {
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
    pub has_billing_key: bool,
    pub card: Option<CardSummary>,
    pub subscription: Option<SubscriptionSummary>,
}

/// Result of a successful subscribe
#[derive(Debug, Clone, Serialize)]
pub struct SubscribeResult {
    pub subscription: SubscriptionSummary,
    pub payment_id: Uuid,
    pub order_id: String,
    pub amount: i64,
    pub receipt_url: Option<String>,
}

impl From<&ChargeOutcome> for SubscribeResult {
    fn from(outcome: &ChargeOutcome) -> Self {
        Self {
            subscription: SubscriptionSummary::from(&outcome.subscription),
            payment_id: outcome.payment.id,
            order_id: outcome.payment.order_id.clone(),
            amount: outcome.payment.amount,
            receipt_url: outcome.payment.receipt_url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    charges: ChargeExecutor,
    lifecycle: SubscriptionLifecycle,
    client_key: String,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        charges: ChargeExecutor,
        lifecycle: SubscriptionLifecycle,
        client_key: String,
    ) -> Self {
        Self {
            store,
            gateway,
            charges,
            lifecycle,
            client_key,
        }
    }

    /// Publishable key for the front-end card widget
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    /// Exchange card details for a billing key and store it on the account
    pub async fn register_card(
        &self,
        user_id: Uuid,
        card: &CardDetails,
    ) -> BillingResult<CardRegistration> {
        if self.store.account(user_id).await?.is_none() {
            return Err(BillingError::NotFound(format!("User {}", user_id)));
        }

        let issued = self
            .gateway
            .issue_billing_key(&customer_key(user_id), card)
            .await
            .map_err(|e| match e {
                GatewayError::Rejected { .. } => {
                    tracing::warn!(user_id = %user_id, code = %e.code(), "Card registration rejected");
                    BillingError::InvalidRequest(e.failure_info().user_message.to_string())
                }
                other => BillingError::Gateway(other),
            })?;

        let _guard = self.charges.locks().lock(user_id).await;
        let stored = self
            .store
            .set_card(
                user_id,
                Some(StoredCard {
                    billing_key: issued.billing_key,
                    card_company: issued.card_company.clone(),
                    card_number: issued.card_number.clone(),
                }),
            )
            .await?;
        if !stored {
            return Err(BillingError::NotFound(format!("User {}", user_id)));
        }

        tracing::info!(
            user_id = %user_id,
            card_company = ?issued.card_company,
            "Billing key registered"
        );

        Ok(CardRegistration {
            billing_key_registered: true,
            card_company: issued.card_company,
            card_number: issued.card_number,
        })
    }

    /// Charge for a plan and activate it
    pub async fn subscribe(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<SubscribeResult> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidRequest(
                "무료 플랜은 구독할 수 없습니다.".to_string(),
            ));
        }

        let outcome = self.charges.charge(user_id, tier, interval).await?;
        tracing::info!(
            user_id = %user_id,
            subscription_id = %outcome.subscription.id,
            tier = %tier,
            interval = %interval.as_str(),
            "Subscription started"
        );
        Ok(SubscribeResult::from(&outcome))
    }

    /// Cancel at the end of the current period
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<SubscriptionSummary> {
        let guard = self.charges.locks().lock(user_id).await;
        let sub = self
            .store
            .open_subscription(user_id)
            .await?
            .filter(|s| s.status == SubscriptionStatus::Active)
            .ok_or_else(|| BillingError::NotFound("활성 구독이 없습니다.".to_string()))?;

        let outcome = self
            .lifecycle
            .apply_locked(&guard, sub.id, LifecycleEvent::ScheduleCancel)
            .await?;
        Ok(summary_after(&sub, &outcome))
    }

    /// Cancel now and drop to FREE
    pub async fn cancel_immediately(&self, user_id: Uuid) -> BillingResult<SubscriptionSummary> {
        let guard = self.charges.locks().lock(user_id).await;
        let sub = self
            .store
            .open_subscription(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound("활성 구독이 없습니다.".to_string()))?;

        let outcome = self
            .lifecycle
            .apply_locked(&guard, sub.id, LifecycleEvent::CancelImmediately)
            .await?;
        tracing::info!(user_id = %user_id, subscription_id = %sub.id, "Subscription canceled immediately");
        Ok(summary_after(&sub, &outcome))
    }

    pub async fn subscription_info(&self, user_id: Uuid) -> BillingResult<SubscriptionInfo> {
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;

        let current = match self.store.open_subscription(user_id).await? {
            Some(sub) => Some(sub),
            None => self.store.trialing_subscription(user_id).await?,
        };

        let card = account.has_billing_key().then(|| CardSummary {
            company: account.card_company.clone(),
            number: account.card_number.clone(),
        });

        Ok(SubscriptionInfo {
            tier: account.tier,
            expires_at: account.expires_at,
            has_billing_key: account.has_billing_key(),
            card,
            subscription: current.as_ref().map(SubscriptionSummary::from),
        })
    }
}

fn summary_after(before: &Subscription, outcome: &Transition) -> SubscriptionSummary {
    match outcome.subscription() {
        Some(after) => SubscriptionSummary::from(after),
        None => SubscriptionSummary::from(before),
    }
}
