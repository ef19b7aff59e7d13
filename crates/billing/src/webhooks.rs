//! Toss Payments webhook handling
//!
//! Deliveries are verified, parsed into a closed event set and processed at
//! most once per transmission id. Processing failures are reported back so the
//! provider redelivers, and the transmission can then be claimed again.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::charge::ChargeExecutor;
use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{LifecycleEvent, SubscriptionLifecycle, WEBHOOK_FAILURE_MESSAGE};
use crate::locks::UserLocks;
use crate::models::{PaymentStatus, Subscription};
use crate::orders::{parse_customer_user_id, parse_order_user_id};
use crate::store::LedgerStore;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "tosspayments-webhook-signature";
pub const TRANSMISSION_TIME_HEADER: &str = "tosspayments-webhook-transmission-time";
pub const TRANSMISSION_ID_HEADER: &str = "tosspayments-webhook-transmission-id";

const SIGNATURE_VERSION_PREFIX: &str = "v1:";

/// Check a delivery signature.
///
/// The expected value is base64(HMAC-SHA256(secret, `body:transmission_time`)).
/// The header may carry several comma-separated candidates after a `v1:`
/// prefix; each is accepted either as that base64 string or base64-wrapped
/// once more.
pub fn verify_signature(
    raw_body: &str,
    transmission_time: &str,
    signature: &str,
    secret: &str,
) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body.as_bytes());
    mac.update(b":");
    mac.update(transmission_time.as_bytes());
    let expected = BASE64.encode(mac.finalize().into_bytes());
    let expected = expected.as_bytes();

    let signature = signature
        .trim()
        .strip_prefix(SIGNATURE_VERSION_PREFIX)
        .unwrap_or(signature.trim());

    let mut matched = false;
    for part in signature.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let plain: bool = part.as_bytes().ct_eq(expected).into();
        let wrapped: bool = BASE64
            .decode(part)
            .map(|decoded| decoded.ct_eq(expected).into())
            .unwrap_or(false);
        matched |= plain | wrapped;
    }
    matched
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelDetail {
    pub cancel_reason: Option<String>,
    pub cancel_amount: Option<i64>,
    pub canceled_at: Option<String>,
}

/// Payload fields shared by the handled event types
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    pub payment_key: Option<String>,
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub billing_key: Option<String>,
    pub customer_key: Option<String>,
    #[serde(default)]
    pub cancels: Vec<CancelDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebhookEnvelope {
    event_type: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    data: Option<WebhookData>,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    PaymentStatusChanged(WebhookData),
    PaymentDone(WebhookData),
    PaymentCanceled(WebhookData),
    PaymentFailed(WebhookData),
    BillingKeyDeleted(WebhookData),
    Unknown(String),
}

impl WebhookEvent {
    /// Parse a raw delivery body
    pub fn parse(raw_body: &str) -> BillingResult<(String, Self)> {
        let envelope: WebhookEnvelope = serde_json::from_str(raw_body)
            .map_err(|e| BillingError::InvalidRequest(format!("malformed webhook body: {}", e)))?;
        tracing::debug!(
            event_type = %envelope.event_type,
            created_at = ?envelope.created_at,
            "Parsed webhook envelope"
        );

        let data = envelope.data.unwrap_or_default();
        let event = match envelope.event_type.as_str() {
            "PAYMENT_STATUS_CHANGED" => WebhookEvent::PaymentStatusChanged(data),
            "PAYMENT_DONE" => WebhookEvent::PaymentDone(data),
            "PAYMENT_CANCELED" => WebhookEvent::PaymentCanceled(data),
            "PAYMENT_FAILED" => WebhookEvent::PaymentFailed(data),
            "BILLING_KEY_DELETED" => WebhookEvent::BillingKeyDeleted(data),
            other => WebhookEvent::Unknown(other.to_string()),
        };
        Ok((envelope.event_type, event))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Transmission already handled or in flight elsewhere
    Duplicate,
    /// Event type or status we do not act on
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookConfig {
    pub secret: Option<String>,
    pub require_signature: bool,
}

/// Webhook handler for Toss Payments events
#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn LedgerStore>,
    lifecycle: SubscriptionLifecycle,
    charges: ChargeExecutor,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
    config: WebhookConfig,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        lifecycle: SubscriptionLifecycle,
        charges: ChargeExecutor,
        clock: Arc<dyn Clock>,
        config: WebhookConfig,
    ) -> Self {
        let locks = charges.locks().clone();
        Self {
            store,
            lifecycle,
            charges,
            locks,
            clock,
            config,
        }
    }

    fn authenticate(
        &self,
        raw_body: &str,
        signature: Option<&str>,
        transmission_time: Option<&str>,
    ) -> BillingResult<()> {
        match signature {
            Some(signature) => {
                let Some(time) = transmission_time else {
                    tracing::warn!("Webhook signature without transmission time");
                    return Err(BillingError::InvalidSignature);
                };
                let Some(secret) = self.config.secret.as_deref() else {
                    tracing::warn!("Signed webhook received but no webhook secret is configured");
                    return Err(BillingError::InvalidSignature);
                };
                if verify_signature(raw_body, time, signature, secret) {
                    Ok(())
                } else {
                    tracing::warn!("Webhook signature mismatch");
                    Err(BillingError::InvalidSignature)
                }
            }
            None if self.config.require_signature => {
                tracing::warn!("Unsigned webhook rejected");
                Err(BillingError::InvalidSignature)
            }
            None => Ok(()),
        }
    }

    /// Verify, deduplicate and process one delivery
    pub async fn handle(
        &self,
        raw_body: &str,
        signature: Option<&str>,
        transmission_time: Option<&str>,
        transmission_id: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        self.authenticate(raw_body, signature, transmission_time)?;
        let (event_type, event) = WebhookEvent::parse(raw_body)?;

        let Some(transmission_id) = transmission_id else {
            tracing::info!(event_type = %event_type, "Processing webhook without transmission id");
            return self.process(event).await;
        };

        let claimed = self
            .store
            .claim_transmission(transmission_id, &event_type, self.clock.now())
            .await
            .map_err(|e| {
                tracing::error!(
                    transmission_id = %transmission_id,
                    error = %e,
                    "Failed to claim webhook transmission"
                );
                e
            })?;
        if !claimed {
            tracing::info!(
                transmission_id = %transmission_id,
                event_type = %event_type,
                "Duplicate webhook transmission"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            transmission_id = %transmission_id,
            event_type = %event_type,
            "Processing webhook transmission"
        );
        let result = self.process(event).await;

        let outcome = match &result {
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = self
            .store
            .finish_transmission(transmission_id, outcome)
            .await
        {
            tracing::error!(
                transmission_id = %transmission_id,
                error = %e,
                "Failed to record webhook processing result"
            );
        }

        if let Err(e) = &result {
            tracing::error!(
                transmission_id = %transmission_id,
                event_type = %event_type,
                error = %e,
                "Webhook processing failed"
            );
        }
        result
    }

    async fn process(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        match event {
            WebhookEvent::PaymentCanceled(data) => self.on_payment_canceled(&data).await,
            WebhookEvent::PaymentFailed(data) => self.on_payment_failed(&data).await,
            WebhookEvent::PaymentDone(data) => self.on_payment_done(&data).await,
            WebhookEvent::BillingKeyDeleted(data) => self.on_billing_key_deleted(&data).await,
            WebhookEvent::PaymentStatusChanged(data) => match data.status.as_deref() {
                Some("CANCELED") => self.on_payment_canceled(&data).await,
                Some("ABORTED") | Some("EXPIRED") => self.on_payment_failed(&data).await,
                status => {
                    tracing::info!(
                        status = ?status,
                        payment_key = ?data.payment_key,
                        "Payment status change noted"
                    );
                    Ok(WebhookOutcome::Ignored)
                }
            },
            WebhookEvent::Unknown(event_type) => {
                tracing::info!(event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::Ignored)
            }
        }
    }

    /// Subscription the webhook's payment belongs to.
    ///
    /// Matched by the charge reference first, then through the order's own
    /// payment row. An order that never belonged to a subscription (a declined
    /// or refunded new-subscription attempt) matches nothing, so it cannot
    /// touch whatever the user has open. With `paid_only`, the order's payment
    /// must also still be the settled charge.
    async fn locate_subscription(
        &self,
        data: &WebhookData,
        paid_only: bool,
    ) -> BillingResult<Option<Subscription>> {
        if let Some(payment_key) = data.payment_key.as_deref() {
            if let Some(sub) = self.store.subscription_by_charge_ref(payment_key).await? {
                return Ok(Some(sub));
            }
        }

        let Some(order_id) = data.order_id.as_deref() else {
            return Ok(None);
        };
        let Some(owner) = parse_order_user_id(order_id) else {
            return Ok(None);
        };
        let Some(payment) = self.store.payment_by_order_id(order_id).await? else {
            return Ok(None);
        };
        if payment.user_id != owner {
            tracing::warn!(order_id = %order_id, "Order id does not match payment owner");
            return Ok(None);
        }
        if paid_only && payment.status != PaymentStatus::Paid {
            tracing::info!(
                order_id = %order_id,
                status = %payment.status,
                "Order payment is not the settled charge"
            );
            return Ok(None);
        }
        let Some(subscription_id) = payment.subscription_id else {
            tracing::info!(order_id = %order_id, "Order payment is not tied to a subscription");
            return Ok(None);
        };
        self.store.subscription(subscription_id).await
    }

    async fn on_payment_canceled(&self, data: &WebhookData) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.locate_subscription(data, true).await? else {
            tracing::warn!(
                payment_key = ?data.payment_key,
                order_id = ?data.order_id,
                "Cancel webhook matches no subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let reason = data
            .cancels
            .iter()
            .rev()
            .find_map(|c| c.cancel_reason.clone());
        tracing::info!(
            subscription_id = %sub.id,
            user_id = %sub.user_id,
            reason = ?reason,
            "Payment canceled by provider"
        );

        let transition = self
            .lifecycle
            .apply(sub.id, LifecycleEvent::PaymentCanceled)
            .await?;
        Ok(if transition.is_applied() {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored
        })
    }

    async fn on_payment_failed(&self, data: &WebhookData) -> BillingResult<WebhookOutcome> {
        let Some(sub) = self.locate_subscription(data, false).await? else {
            tracing::warn!(
                payment_key = ?data.payment_key,
                order_id = ?data.order_id,
                "Failure webhook matches no subscription"
            );
            return Ok(WebhookOutcome::Ignored);
        };

        let transition = self
            .lifecycle
            .apply(
                sub.id,
                LifecycleEvent::PaymentFailed {
                    reason: WEBHOOK_FAILURE_MESSAGE.to_string(),
                },
            )
            .await?;
        Ok(if transition.is_applied() {
            WebhookOutcome::Processed
        } else {
            WebhookOutcome::Ignored
        })
    }

    /// A confirmed charge the ledger does not show as paid is refunded
    async fn on_payment_done(&self, data: &WebhookData) -> BillingResult<WebhookOutcome> {
        let Some(order_id) = data.order_id.as_deref() else {
            tracing::warn!(payment_key = ?data.payment_key, "Payment done webhook without order id");
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(payment) = self.store.payment_by_order_id(order_id).await? else {
            tracing::warn!(order_id = %order_id, "Payment done webhook for unknown order");
            return Ok(WebhookOutcome::Ignored);
        };

        // A charge still in flight holds this lock; re-read once it is released
        let _guard = self.locks.lock(payment.user_id).await;
        let Some(payment) = self.store.payment(payment.id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        match payment.status {
            PaymentStatus::Pending | PaymentStatus::Failed => {
                let Some(payment_key) = data
                    .payment_key
                    .clone()
                    .or_else(|| payment.payment_key.clone())
                else {
                    tracing::error!(
                        order_id = %order_id,
                        "Unaccounted charge confirmed without payment key"
                    );
                    return Err(BillingError::InvalidRequest(format!(
                        "payment key missing for order {}",
                        order_id
                    )));
                };
                tracing::warn!(
                    order_id = %order_id,
                    status = %payment.status,
                    "Provider confirmed a charge the ledger did not settle"
                );
                let refunded = self.charges.auto_refund(payment, &payment_key).await;
                tracing::info!(
                    order_id = %order_id,
                    status = %refunded.status,
                    "Unaccounted charge handled"
                );
                Ok(WebhookOutcome::Processed)
            }
            _ => Ok(WebhookOutcome::Ignored),
        }
    }

    async fn on_billing_key_deleted(&self, data: &WebhookData) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = data
            .customer_key
            .as_deref()
            .and_then(parse_customer_user_id)
        else {
            tracing::warn!(customer_key = ?data.customer_key, "Billing key deletion for unknown customer");
            return Ok(WebhookOutcome::Ignored);
        };
        self.clear_card(user_id, data.billing_key.as_deref()).await
    }

    async fn clear_card(
        &self,
        user_id: Uuid,
        billing_key: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        let _guard = self.locks.lock(user_id).await;
        let Some(account) = self.store.account(user_id).await? else {
            return Ok(WebhookOutcome::Ignored);
        };

        // Leave a newer card alone
        if let (Some(deleted), Some(current)) = (billing_key, account.billing_key.as_deref()) {
            if deleted != current {
                tracing::info!(user_id = %user_id, "Deleted billing key is no longer current");
                return Ok(WebhookOutcome::Ignored);
            }
        }
        if account.billing_key.is_none() {
            return Ok(WebhookOutcome::Ignored);
        }

        self.store.set_card(user_id, None).await?;
        tracing::info!(user_id = %user_id, "Billing key removed by provider");
        Ok(WebhookOutcome::Processed)
    }
}
