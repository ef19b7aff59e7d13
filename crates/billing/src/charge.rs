//! Charge executor
//!
//! One invocation makes at most one gateway call and always runs under the
//! user's lock. A PENDING payment row is written before the call so every
//! attempt leaves a trace, and the gateway deduplicates by order id.
//!
//! Outcomes:
//! - DONE: payment PAID, subscription and projection committed together.
//! - Rejected: payment FAILED, `ChargeFailed` returned. The caller applies
//!   the PAST_DUE/retry bookkeeping.
//! - Timeout: payment stays PENDING (outcome unknown), `ChargeFailed` with
//!   code `TIMEOUT` returned. A late DONE arrives by webhook and is refunded.
//! - DONE but the commit fails: the charge is canceled at the gateway.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use clinicpay_shared::{month_bounds, BillingInterval, SubscriptionTier};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::failure_codes::{self, TIMEOUT_FAILURE};
use crate::gateway::{ChargeReceipt, ChargeRequest, GatewayError, PaymentGateway};
use crate::lifecycle::{self, LifecycleEvent, Transition};
use crate::locks::{UserLockGuard, UserLocks};
use crate::models::{
    BillingAccount, Payment, PaymentStatus, Refund, RefundStatus, Subscription, SubscriptionStatus,
};
use crate::orders::{customer_key, OrderIdGenerator};
use crate::plans;
use crate::store::{LedgerStore, LedgerWrite, ProjectionUpdate};

/// Reason sent to the gateway when a charge has to be handed back
pub const AUTO_REFUND_REASON: &str = "시스템 오류로 인한 자동 환불";

/// Failure code recorded when the gateway answers with a non-final status
const NOT_COMPLETED_CODE: &str = "PAYMENT_NOT_COMPLETED";

/// A committed successful charge
#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub payment: Payment,
    pub subscription: Subscription,
    pub payment_key: String,
}

/// What the charge pays for
enum ChargePurpose<'a> {
    NewSubscription,
    Renewal(&'a Subscription),
}

#[derive(Clone)]
pub struct ChargeExecutor {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
    orders: Arc<OrderIdGenerator>,
    timeout: Duration,
}

impl ChargeExecutor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: UserLocks,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            clock,
            orders: Arc::new(OrderIdGenerator::new()),
            timeout,
        }
    }

    pub fn locks(&self) -> &UserLocks {
        &self.locks
    }

    /// Charge for a new subscription, taking the user's lock
    pub async fn charge(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<ChargeOutcome> {
        let guard = self.locks.lock(user_id).await;
        self.charge_locked(&guard, tier, interval).await
    }

    /// Charge for a new subscription. Any open subscription is replaced and a
    /// running trial is marked converted in the same commit.
    pub async fn charge_locked(
        &self,
        guard: &UserLockGuard,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<ChargeOutcome> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidRequest(format!(
                "{} is not a paid plan",
                tier
            )));
        }
        self.execute(guard, tier, interval, ChargePurpose::NewSubscription)
            .await
    }

    /// Charge the next period of an ACTIVE (renewal) or PAST_DUE (retry)
    /// subscription. The caller re-reads the row under the lock.
    pub async fn renew_locked(
        &self,
        guard: &UserLockGuard,
        subscription: &Subscription,
    ) -> BillingResult<ChargeOutcome> {
        if subscription.user_id != guard.user_id() {
            return Err(BillingError::InvalidRequest(format!(
                "Subscription {} does not belong to user {}",
                subscription.id,
                guard.user_id()
            )));
        }
        if !subscription.status.is_open() {
            return Err(BillingError::InvalidTransition {
                from: subscription.status.to_string(),
                event: "renewal_charge".to_string(),
            });
        }
        self.execute(
            guard,
            subscription.tier,
            subscription.interval,
            ChargePurpose::Renewal(subscription),
        )
        .await
    }

    async fn execute(
        &self,
        guard: &UserLockGuard,
        tier: SubscriptionTier,
        interval: BillingInterval,
        purpose: ChargePurpose<'_>,
    ) -> BillingResult<ChargeOutcome> {
        let user_id = guard.user_id();
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;

        let Some(billing_key) = account.billing_key.clone() else {
            tracing::info!(user_id = %user_id, "No billing key registered, charge not attempted");
            return Err(BillingError::NoBillingCredential);
        };

        let amount = plans::amount_for(tier, interval);
        let now = self.clock.now();
        let order_id = self.orders.next(user_id, now);
        let order_name = plans::order_name(tier, interval);

        let mut payment = Payment::pending(
            user_id,
            order_id.clone(),
            order_name.clone(),
            tier,
            interval,
            amount,
            now,
        );
        if let ChargePurpose::Renewal(sub) = &purpose {
            payment.subscription_id = Some(sub.id);
        }
        self.store
            .commit(LedgerWrite::new().put_payment(payment.clone()))
            .await?;

        let request = ChargeRequest {
            billing_key,
            customer_key: customer_key(user_id),
            amount,
            order_id: order_id.clone(),
            order_name,
            customer_email: Some(account.email.clone()),
            customer_name: Some(account.name.clone()),
        };

        tracing::info!(
            user_id = %user_id,
            order_id = %order_id,
            amount = amount,
            tier = %tier,
            "Charging billing key"
        );

        let result = match tokio::time::timeout(
            self.timeout,
            self.gateway.charge_billing_key(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout),
        };

        let receipt = match result {
            Ok(receipt) if receipt.is_done() => receipt,
            Ok(receipt) => {
                let info = failure_codes::classify(NOT_COMPLETED_CODE);
                tracing::warn!(
                    user_id = %user_id,
                    order_id = %order_id,
                    status = ?receipt.status,
                    "Gateway returned a non-final payment status"
                );
                return Err(self
                    .record_failure(payment, NOT_COMPLETED_CODE, info.user_message)
                    .await);
            }
            Err(GatewayError::Timeout) => {
                tracing::error!(
                    user_id = %user_id,
                    order_id = %order_id,
                    "Gateway charge timed out, leaving payment pending"
                );
                return Err(BillingError::ChargeFailed {
                    code: TIMEOUT_FAILURE.code.to_string(),
                    reason: TIMEOUT_FAILURE.user_message.to_string(),
                });
            }
            Err(e) => {
                let info = e.failure_info();
                tracing::warn!(
                    user_id = %user_id,
                    order_id = %order_id,
                    code = %e.code(),
                    category = %info.category,
                    error = %e,
                    "Charge rejected"
                );
                let code = e.code().to_string();
                return Err(self.record_failure(payment, &code, info.user_message).await);
            }
        };

        let now = self.clock.now();
        mark_paid(&mut payment, &receipt, now);

        let (write, subscription) = match self.settle(&account, &purpose, &mut payment, &receipt, now).await {
            Ok(settled) => settled,
            Err(e) => {
                self.auto_refund(payment, &receipt.payment_key).await;
                return Err(e);
            }
        };

        if let Err(e) = self.store.commit(write).await {
            tracing::error!(
                user_id = %user_id,
                order_id = %order_id,
                payment_key = %receipt.payment_key,
                error = %e,
                "Commit failed after successful charge, refunding"
            );
            self.auto_refund(payment, &receipt.payment_key).await;
            return Err(e);
        }

        tracing::info!(
            user_id = %user_id,
            order_id = %order_id,
            subscription_id = %subscription.id,
            period_end = %subscription.current_period_end,
            "Charge succeeded"
        );

        Ok(ChargeOutcome {
            payment,
            subscription,
            payment_key: receipt.payment_key,
        })
    }

    /// Build the write set that activates what the charge paid for
    async fn settle(
        &self,
        account: &BillingAccount,
        purpose: &ChargePurpose<'_>,
        payment: &mut Payment,
        receipt: &ChargeReceipt,
        now: DateTime<Utc>,
    ) -> BillingResult<(LedgerWrite, Subscription)> {
        let user_id = account.user_id;
        match purpose {
            ChargePurpose::NewSubscription => {
                let mut write = LedgerWrite::new();

                if let Some(prior) = self.store.open_subscription(user_id).await? {
                    tracing::info!(
                        user_id = %user_id,
                        subscription_id = %prior.id,
                        "Replacing existing subscription"
                    );
                    let mut canceled = prior;
                    canceled.status = SubscriptionStatus::Canceled;
                    canceled.canceled_at = Some(now);
                    write = write.update_subscription(canceled);
                }

                if let Some(trial) = self.store.trialing_subscription(user_id).await? {
                    if let Transition::Applied { subscription, .. } =
                        lifecycle::transition(&trial, &LifecycleEvent::TrialConverted, now)?
                    {
                        write = write.update_subscription(subscription);
                    }
                }

                let subscription = Subscription::active(
                    user_id,
                    payment.tier,
                    payment.interval,
                    &receipt.payment_key,
                    now,
                );
                payment.subscription_id = Some(subscription.id);

                let write = write
                    .insert_subscription(subscription.clone())
                    .set_projection(ProjectionUpdate {
                        user_id,
                        tier: subscription.tier,
                        expires_at: Some(subscription.current_period_end),
                    })
                    .put_payment(payment.clone());
                Ok((write, subscription))
            }
            ChargePurpose::Renewal(sub) => {
                let event = match sub.status {
                    SubscriptionStatus::PastDue => LifecycleEvent::RetrySucceeded {
                        charge_ref: receipt.payment_key.clone(),
                    },
                    _ => LifecycleEvent::RenewalSucceeded {
                        charge_ref: receipt.payment_key.clone(),
                    },
                };
                let transition = lifecycle::transition(sub, &event, now)?;
                let Transition::Applied { subscription, .. } = &transition else {
                    return Err(BillingError::InvalidTransition {
                        from: sub.status.to_string(),
                        event: event.name().to_string(),
                    });
                };
                let subscription = subscription.clone();
                let (month_start, _) = month_bounds(now);
                let write = transition
                    .into_write()
                    .put_payment(payment.clone())
                    .reset_usage(user_id, month_start);
                Ok((write, subscription))
            }
        }
    }

    /// Mark the attempt FAILED and build the error for the caller
    async fn record_failure(&self, mut payment: Payment, code: &str, message: &str) -> BillingError {
        let now = self.clock.now();
        payment.status = PaymentStatus::Failed;
        payment.failure_code = Some(code.to_string());
        payment.failure_message = Some(message.to_string());
        payment.failed_at = Some(now);
        payment.updated_at = now;

        if let Err(e) = self
            .store
            .commit(LedgerWrite::new().put_payment(payment.clone()))
            .await
        {
            tracing::error!(
                order_id = %payment.order_id,
                error = %e,
                "Failed to record failed payment"
            );
        }

        BillingError::ChargeFailed {
            code: code.to_string(),
            reason: message.to_string(),
        }
    }

    /// Cancel a charge the gateway took but the ledger could not account for.
    ///
    /// The payment ends REFUNDED when the gateway accepts the cancel, FAILED
    /// otherwise (operators reconcile from the logs).
    pub async fn auto_refund(&self, mut payment: Payment, payment_key: &str) -> Payment {
        let now = self.clock.now();
        let amount = payment.amount;
        payment.payment_key = Some(payment_key.to_string());
        payment.updated_at = now;

        let mut refund = Refund {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            user_id: payment.user_id,
            amount,
            reason: AUTO_REFUND_REASON.to_string(),
            status: RefundStatus::Pending,
            refund_key: None,
            failure_reason: None,
            processed_at: None,
            created_at: now,
        };

        match self
            .gateway
            .cancel_payment(payment_key, AUTO_REFUND_REASON, None)
            .await
        {
            Ok(receipt) => {
                tracing::warn!(
                    user_id = %payment.user_id,
                    order_id = %payment.order_id,
                    payment_key = %payment_key,
                    "Orphaned charge refunded"
                );
                payment.status = PaymentStatus::Refunded;
                payment.refunded_amount = amount;
                payment.refunded_at = Some(now);
                refund.status = RefundStatus::Completed;
                refund.refund_key = receipt.refund_key;
                refund.processed_at = Some(now);
            }
            Err(e) => {
                tracing::error!(
                    user_id = %payment.user_id,
                    order_id = %payment.order_id,
                    payment_key = %payment_key,
                    error = %e,
                    "Automatic refund failed, manual reconciliation required"
                );
                payment.status = PaymentStatus::Failed;
                payment.failure_code = Some(e.code().to_string());
                payment.failure_message = Some(format!("자동 환불 실패: {}", e));
                payment.failed_at = Some(now);
                refund.status = RefundStatus::Failed;
                refund.failure_reason = Some(e.to_string());
            }
        }

        if let Err(e) = self
            .store
            .commit(
                LedgerWrite::new()
                    .put_payment(payment.clone())
                    .put_refund(refund),
            )
            .await
        {
            tracing::error!(
                order_id = %payment.order_id,
                error = %e,
                "Failed to record automatic refund"
            );
        }
        payment
    }
}

fn mark_paid(payment: &mut Payment, receipt: &ChargeReceipt, now: DateTime<Utc>) {
    payment.status = PaymentStatus::Paid;
    payment.payment_key = Some(receipt.payment_key.clone());
    payment.card_company = receipt.card_company.clone();
    payment.card_number = receipt.card_number.clone();
    payment.receipt_url = receipt.receipt_url.clone();
    payment.paid_at = Some(receipt.approved_at.unwrap_or(now));
    payment.updated_at = now;
}
