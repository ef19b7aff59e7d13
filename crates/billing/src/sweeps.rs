//! Scheduled sweeps
//!
//! Each sweep selects its candidates, then handles them one at a time under
//! the owner's lock, re-reading the row first so a sweep that overlaps a
//! previous run, an API request or a webhook sees the latest state. A failing
//! item is logged and counted; it never stops the rest of the sweep.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::charge::ChargeExecutor;
use crate::clock::Clock;
use crate::email::{deliver, BillingNotice, BillingNotifier, Recipient};
use crate::error::{BillingError, BillingResult};
use crate::lifecycle::{LifecycleEvent, SubscriptionLifecycle, Transition};
use crate::locks::UserLocks;
use crate::models::{Subscription, SubscriptionStatus};
use crate::store::{LedgerStore, LedgerWrite, SweepQuery};
use crate::trial::days_remaining;

/// Renewals are charged up to this far ahead of the period end
pub const RENEWAL_LOOKAHEAD_DAYS: i64 = 1;
/// Trial-ending notices go out this far ahead of the trial end
pub const TRIAL_NOTICE_LOOKAHEAD_DAYS: i64 = 2;

/// Error recorded when a due renewal finds no registered card
pub const NO_PAYMENT_METHOD_MESSAGE: &str = "등록된 결제 수단이 없습니다.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepKind {
    Renewal,
    Expiry,
    Retry,
    TrialExpiry,
    TrialNotice,
}

impl SweepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Renewal => "renewal",
            SweepKind::Expiry => "expiry",
            SweepKind::Retry => "retry",
            SweepKind::TrialExpiry => "trial_expiry",
            SweepKind::TrialNotice => "trial_notice",
        }
    }
}

/// Counters for one sweep run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub kind: SweepKind,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl SweepReport {
    fn new(kind: SweepKind) -> Self {
        Self {
            kind,
            processed: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
        }
    }

    fn record(&mut self, subscription_id: Uuid, result: BillingResult<ItemOutcome>) {
        self.processed += 1;
        match result {
            Ok(ItemOutcome::Succeeded) => self.succeeded += 1,
            Ok(ItemOutcome::Skipped) => self.skipped += 1,
            Ok(ItemOutcome::Failed) => self.failed += 1,
            Err(e) => {
                self.failed += 1;
                tracing::error!(
                    sweep = self.kind.as_str(),
                    subscription_id = %subscription_id,
                    error = %e,
                    "Sweep item failed"
                );
            }
        }
    }

    fn log(&self) {
        tracing::info!(
            sweep = self.kind.as_str(),
            processed = self.processed,
            succeeded = self.succeeded,
            failed = self.failed,
            skipped = self.skipped,
            "Sweep complete"
        );
    }
}

enum ItemOutcome {
    Succeeded,
    /// Charge attempted and declined
    Failed,
    /// No longer a candidate once re-read
    Skipped,
}

/// Reason to record for a declined charge, `None` for errors that are not declines
fn decline_reason(err: &BillingError) -> Option<String> {
    match err {
        BillingError::ChargeFailed { reason, .. } => Some(reason.clone()),
        BillingError::NoBillingCredential => Some(NO_PAYMENT_METHOD_MESSAGE.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct SweepService {
    store: Arc<dyn LedgerStore>,
    charges: ChargeExecutor,
    lifecycle: SubscriptionLifecycle,
    notifier: Arc<dyn BillingNotifier>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
}

impl SweepService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        charges: ChargeExecutor,
        lifecycle: SubscriptionLifecycle,
        notifier: Arc<dyn BillingNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = charges.locks().clone();
        Self {
            store,
            charges,
            lifecycle,
            notifier,
            locks,
            clock,
        }
    }

    pub async fn run(&self, kind: SweepKind) -> BillingResult<SweepReport> {
        match kind {
            SweepKind::Renewal => self.run_renewals().await,
            SweepKind::Expiry => self.run_expiry().await,
            SweepKind::Retry => self.run_retries().await,
            SweepKind::TrialExpiry => self.run_trial_expiry().await,
            SweepKind::TrialNotice => self.run_trial_notices().await,
        }
    }

    async fn notify(&self, user_id: Uuid, notice: BillingNotice) {
        match self.store.account(user_id).await {
            Ok(Some(account)) => {
                deliver(self.notifier.as_ref(), &Recipient::from(&account), notice).await
            }
            Ok(None) => tracing::warn!(user_id = %user_id, "No account to notify"),
            Err(e) => tracing::warn!(user_id = %user_id, error = %e, "Failed to load account for notification"),
        }
    }

    /// Charge ACTIVE subscriptions whose period ends within a day
    pub async fn run_renewals(&self) -> BillingResult<SweepReport> {
        let before = self.clock.now() + Duration::days(RENEWAL_LOOKAHEAD_DAYS);
        let candidates = self
            .store
            .subscriptions_for_sweep(SweepQuery::RenewalDue { before })
            .await?;
        tracing::info!(count = candidates.len(), "Running renewal sweep");

        let mut report = SweepReport::new(SweepKind::Renewal);
        for sub in candidates {
            let result = self.renew_one(&sub).await;
            report.record(sub.id, result);
        }
        report.log();
        Ok(report)
    }

    async fn renew_one(&self, candidate: &Subscription) -> BillingResult<ItemOutcome> {
        let guard = self.locks.lock(candidate.user_id).await;
        let before = self.clock.now() + Duration::days(RENEWAL_LOOKAHEAD_DAYS);
        let Some(sub) = self.store.subscription(candidate.id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !(SweepQuery::RenewalDue { before }).matches(&sub) {
            tracing::debug!(subscription_id = %sub.id, "No longer due for renewal");
            return Ok(ItemOutcome::Skipped);
        }

        match self.charges.renew_locked(&guard, &sub).await {
            Ok(outcome) => {
                drop(guard);
                self.notify(
                    sub.user_id,
                    BillingNotice::SubscriptionRenewed {
                        tier: outcome.subscription.tier,
                        amount: outcome.payment.amount,
                        next_billing_date: outcome.subscription.current_period_end,
                    },
                )
                .await;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                let Some(reason) = decline_reason(&e) else {
                    return Err(e);
                };
                tracing::warn!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    reason = %reason,
                    "Renewal charge failed, moving to past due"
                );
                self.lifecycle
                    .apply_locked(
                        &guard,
                        sub.id,
                        LifecycleEvent::RenewalFailed {
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                drop(guard);
                self.notify(
                    sub.user_id,
                    BillingNotice::PaymentFailed {
                        reason,
                        retry_count: 0,
                    },
                )
                .await;
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Cancel open subscriptions whose deferred cancel date has passed
    pub async fn run_expiry(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let candidates = self
            .store
            .subscriptions_for_sweep(SweepQuery::DeferredCancelDue { now })
            .await?;
        tracing::info!(count = candidates.len(), "Running expiry sweep");

        let mut report = SweepReport::new(SweepKind::Expiry);
        for sub in candidates {
            let result = self
                .lifecycle
                .apply(sub.id, LifecycleEvent::DeferredCancelDue)
                .await
                .map(|t| match t {
                    Transition::Applied { .. } => {
                        tracing::info!(
                            subscription_id = %sub.id,
                            user_id = %sub.user_id,
                            "Subscription expired after deferred cancel"
                        );
                        ItemOutcome::Succeeded
                    }
                    Transition::Ignored => ItemOutcome::Skipped,
                });
            report.record(sub.id, result);
        }
        report.log();
        Ok(report)
    }

    /// Retry PAST_DUE subscriptions, canceling after the last allowed failure.
    /// Rows with a deferred cancel are left to the expiry sweep.
    pub async fn run_retries(&self) -> BillingResult<SweepReport> {
        let candidates = self
            .store
            .subscriptions_for_sweep(SweepQuery::PastDue)
            .await?;
        tracing::info!(count = candidates.len(), "Running payment retry sweep");

        let mut report = SweepReport::new(SweepKind::Retry);
        for sub in candidates {
            let result = self.retry_one(&sub).await;
            report.record(sub.id, result);
        }
        report.log();
        Ok(report)
    }

    async fn retry_one(&self, candidate: &Subscription) -> BillingResult<ItemOutcome> {
        let guard = self.locks.lock(candidate.user_id).await;
        let Some(sub) = self.store.subscription(candidate.id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        if !SweepQuery::PastDue.matches(&sub) {
            return Ok(ItemOutcome::Skipped);
        }

        match self.charges.renew_locked(&guard, &sub).await {
            Ok(outcome) => {
                drop(guard);
                tracing::info!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    "Payment retry succeeded"
                );
                self.notify(
                    sub.user_id,
                    BillingNotice::SubscriptionRenewed {
                        tier: outcome.subscription.tier,
                        amount: outcome.payment.amount,
                        next_billing_date: outcome.subscription.current_period_end,
                    },
                )
                .await;
                Ok(ItemOutcome::Succeeded)
            }
            Err(e) => {
                let Some(reason) = decline_reason(&e) else {
                    return Err(e);
                };
                let transition = self
                    .lifecycle
                    .apply_locked(
                        &guard,
                        sub.id,
                        LifecycleEvent::RetryFailed {
                            reason: reason.clone(),
                        },
                    )
                    .await?;
                drop(guard);

                match transition.subscription() {
                    Some(after) if after.status == SubscriptionStatus::Canceled => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            user_id = %sub.user_id,
                            retries = after.payment_retry_count,
                            error = %BillingError::MaxRetriesExceeded,
                            "Subscription canceled"
                        );
                        self.notify(sub.user_id, BillingNotice::SubscriptionCanceled { reason })
                            .await;
                    }
                    Some(after) => {
                        tracing::warn!(
                            subscription_id = %sub.id,
                            user_id = %sub.user_id,
                            retries = after.payment_retry_count,
                            "Payment retry failed"
                        );
                        self.notify(
                            sub.user_id,
                            BillingNotice::PaymentFailed {
                                reason,
                                retry_count: after.payment_retry_count,
                            },
                        )
                        .await;
                    }
                    None => {}
                }
                Ok(ItemOutcome::Failed)
            }
        }
    }

    /// Cancel trials whose window has elapsed
    pub async fn run_trial_expiry(&self) -> BillingResult<SweepReport> {
        let now = self.clock.now();
        let candidates = self
            .store
            .subscriptions_for_sweep(SweepQuery::TrialExpired { now })
            .await?;
        tracing::info!(count = candidates.len(), "Running trial expiry sweep");

        let mut report = SweepReport::new(SweepKind::TrialExpiry);
        for sub in candidates {
            let result = match self.lifecycle.apply(sub.id, LifecycleEvent::TrialExpired).await {
                Ok(Transition::Applied { .. }) => {
                    tracing::info!(
                        subscription_id = %sub.id,
                        user_id = %sub.user_id,
                        "Trial expired"
                    );
                    self.notify(sub.user_id, BillingNotice::TrialExpired).await;
                    Ok(ItemOutcome::Succeeded)
                }
                Ok(Transition::Ignored) => Ok(ItemOutcome::Skipped),
                Err(e) => Err(e),
            };
            report.record(sub.id, result);
        }
        report.log();
        Ok(report)
    }

    /// Tell users their trial ends soon; each trial is notified once
    pub async fn run_trial_notices(&self) -> BillingResult<SweepReport> {
        let before = self.clock.now() + Duration::days(TRIAL_NOTICE_LOOKAHEAD_DAYS);
        let candidates = self
            .store
            .subscriptions_for_sweep(SweepQuery::TrialEndingSoon { before })
            .await?;
        tracing::info!(count = candidates.len(), "Running trial notice sweep");

        let mut report = SweepReport::new(SweepKind::TrialNotice);
        for sub in candidates {
            let result = self.notice_one(&sub, before).await;
            report.record(sub.id, result);
        }
        report.log();
        Ok(report)
    }

    async fn notice_one(
        &self,
        candidate: &Subscription,
        before: chrono::DateTime<chrono::Utc>,
    ) -> BillingResult<ItemOutcome> {
        let guard = self.locks.lock(candidate.user_id).await;
        let Some(sub) = self.store.subscription(candidate.id).await? else {
            return Ok(ItemOutcome::Skipped);
        };
        let Some(ends_at) = sub.trial_ends_at else {
            return Ok(ItemOutcome::Skipped);
        };
        if !(SweepQuery::TrialEndingSoon { before }).matches(&sub) {
            return Ok(ItemOutcome::Skipped);
        }

        // Flag first so a crash after sending cannot notify twice
        let mut flagged = sub.clone();
        flagged.trial_ending_notified = true;
        self.store
            .commit(LedgerWrite::new().update_subscription(flagged))
            .await?;
        drop(guard);

        let days = days_remaining(ends_at, self.clock.now());
        self.notify(
            sub.user_id,
            BillingNotice::TrialEnding {
                days_remaining: days,
                ends_at,
            },
        )
        .await;
        Ok(ItemOutcome::Succeeded)
    }
}
