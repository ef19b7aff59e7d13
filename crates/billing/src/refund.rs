//! User-requested refunds
//!
//! A PENDING refund record is written before the gateway is asked to cancel,
//! so every attempt leaves an audit trail whether or not the gateway accepts it.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::locks::UserLocks;
use crate::models::{PaymentStatus, Refund, RefundStatus};
use crate::store::{LedgerStore, LedgerWrite};

/// Refunds are accepted this many days after payment
pub const REFUND_WINDOW_DAYS: i64 = 7;

/// Result of a refund operation
#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub refund_id: Uuid,
    pub payment_id: Uuid,
    /// Amount refunded in KRW
    pub amount: i64,
    /// Gateway transaction key of the cancel
    pub refund_key: Option<String>,
    pub payment_status: PaymentStatus,
}

/// Refund service for handling gateway cancels
#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn LedgerStore>,
    gateway: Arc<dyn PaymentGateway>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        locks: UserLocks,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            clock,
        }
    }

    /// Refund all (`amount` = None) or part of a payment.
    ///
    /// Partial amounts above what is still refundable are clamped.
    pub async fn request_refund(
        &self,
        user_id: Uuid,
        payment_id: Uuid,
        reason: &str,
        amount: Option<i64>,
    ) -> BillingResult<RefundResult> {
        let _guard = self.locks.lock(user_id).await;

        let mut payment = self
            .store
            .payment(payment_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))?;

        if !matches!(
            payment.status,
            PaymentStatus::Paid | PaymentStatus::PartiallyRefunded
        ) {
            return Err(BillingError::InvalidRequest(format!(
                "환불할 수 없는 결제 상태입니다: {}",
                payment.status
            )));
        }

        let now = self.clock.now();
        let paid_at = payment.paid_at.unwrap_or(payment.created_at);
        if now - paid_at > Duration::days(REFUND_WINDOW_DAYS) {
            return Err(BillingError::InvalidRequest(format!(
                "결제 후 {}일이 지나 환불할 수 없습니다.",
                REFUND_WINDOW_DAYS
            )));
        }

        let refundable = payment.refundable_amount();
        let requested = amount.map_or(refundable, |a| a.min(refundable));
        if requested <= 0 {
            return Err(BillingError::InvalidRequest(
                "환불 가능한 금액이 없습니다.".to_string(),
            ));
        }
        let Some(payment_key) = payment.payment_key.clone() else {
            return Err(BillingError::InvalidRequest(
                "결제 키가 없는 결제입니다.".to_string(),
            ));
        };

        let mut refund = Refund {
            id: Uuid::new_v4(),
            payment_id,
            user_id,
            amount: requested,
            reason: reason.to_string(),
            status: RefundStatus::Pending,
            refund_key: None,
            failure_reason: None,
            processed_at: None,
            created_at: now,
        };
        self.store
            .commit(LedgerWrite::new().put_refund(refund.clone()))
            .await?;

        // Full refunds omit the amount so the gateway cancels the balance
        let cancel_amount = (requested < refundable || payment.refunded_amount > 0).then_some(requested);

        match self
            .gateway
            .cancel_payment(&payment_key, reason, cancel_amount)
            .await
        {
            Ok(receipt) => {
                let now = self.clock.now();
                refund.status = RefundStatus::Completed;
                refund.refund_key = receipt.refund_key.clone();
                refund.processed_at = Some(now);

                payment.refunded_amount += requested;
                payment.status = if payment.refunded_amount >= payment.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
                payment.refunded_at = Some(now);
                payment.updated_at = now;

                self.store
                    .commit(
                        LedgerWrite::new()
                            .put_refund(refund.clone())
                            .put_payment(payment.clone()),
                    )
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            refund_id = %refund.id,
                            payment_id = %payment_id,
                            error = %e,
                            "Gateway refunded but ledger update failed"
                        );
                        e
                    })?;

                tracing::info!(
                    user_id = %user_id,
                    payment_id = %payment_id,
                    refund_id = %refund.id,
                    amount = requested,
                    "Refund completed"
                );

                Ok(RefundResult {
                    refund_id: refund.id,
                    payment_id,
                    amount: requested,
                    refund_key: receipt.refund_key,
                    payment_status: payment.status,
                })
            }
            Err(e) => {
                tracing::error!(
                    user_id = %user_id,
                    payment_id = %payment_id,
                    code = %e.code(),
                    error = %e,
                    "Refund rejected by gateway"
                );
                refund.status = RefundStatus::Failed;
                refund.failure_reason = Some(e.to_string());
                refund.processed_at = Some(self.clock.now());
                if let Err(store_err) = self
                    .store
                    .commit(LedgerWrite::new().put_refund(refund))
                    .await
                {
                    tracing::error!(error = %store_err, "Failed to record failed refund");
                }
                Err(BillingError::RefundFailed(
                    e.failure_info().user_message.to_string(),
                ))
            }
        }
    }

    /// Refunds for the user, newest first
    pub async fn refund_history(&self, user_id: Uuid) -> BillingResult<Vec<Refund>> {
        self.store.refunds_for_user(user_id).await
    }
}
