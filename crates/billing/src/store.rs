//! Ledger storage
//!
//! Every billing mutation goes through [`LedgerStore::commit`], which applies a
//! [`LedgerWrite`] atomically: subscription rows, the user projection, payments,
//! refunds and the trial flag either all land or none do. Subscription updates
//! are optimistic: the row's stored version must still equal the version the
//! caller read, otherwise the commit fails with `ConcurrentModification`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use clinicpay_shared::SubscriptionTier;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingAccount, Payment, PaymentStatus, Refund, StoredCard, Subscription,
    SubscriptionStatus, UsageType,
};

/// Webhook transmissions stuck in `processing` longer than this may be re-claimed
pub const TRANSMISSION_PROCESSING_TIMEOUT_MINUTES: i64 = 30;

/// Candidate selection for the scheduled sweeps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepQuery {
    /// ACTIVE, no deferred cancel, period ends at or before `before`
    RenewalDue { before: DateTime<Utc> },
    /// ACTIVE or PAST_DUE with `cancel_at <= now`
    DeferredCancelDue { now: DateTime<Utc> },
    /// PAST_DUE with no deferred cancel
    PastDue,
    /// TRIALING with `trial_ends_at <= now`
    TrialExpired { now: DateTime<Utc> },
    /// TRIALING, not yet notified, `trial_ends_at <= before`
    TrialEndingSoon { before: DateTime<Utc> },
}

impl SweepQuery {
    pub fn matches(&self, sub: &Subscription) -> bool {
        match *self {
            SweepQuery::RenewalDue { before } => {
                sub.status == SubscriptionStatus::Active
                    && sub.cancel_at.is_none()
                    && sub.current_period_end <= before
            }
            SweepQuery::DeferredCancelDue { now } => {
                matches!(
                    sub.status,
                    SubscriptionStatus::Active | SubscriptionStatus::PastDue
                ) && sub.cancel_at.is_some_and(|at| at <= now)
            }
            SweepQuery::PastDue => {
                sub.status == SubscriptionStatus::PastDue && sub.cancel_at.is_none()
            }
            SweepQuery::TrialExpired { now } => {
                sub.status == SubscriptionStatus::Trialing
                    && sub.trial_ends_at.is_some_and(|at| at <= now)
            }
            SweepQuery::TrialEndingSoon { before } => {
                sub.status == SubscriptionStatus::Trialing
                    && !sub.trial_ending_notified
                    && sub.trial_ends_at.is_some_and(|at| at <= before)
            }
        }
    }
}

/// New tier and expiry for the user projection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionUpdate {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ProjectionUpdate {
    pub fn free(user_id: Uuid) -> Self {
        Self {
            user_id,
            tier: SubscriptionTier::Free,
            expires_at: None,
        }
    }
}

/// A set of writes applied as one unit
#[derive(Debug, Clone, Default)]
pub struct LedgerWrite {
    pub inserted_subscriptions: Vec<Subscription>,
    /// Each carries the version it was read at
    pub updated_subscriptions: Vec<Subscription>,
    pub projection: Option<ProjectionUpdate>,
    /// Flip the one-shot trial flag; fails the commit if already set
    pub claim_trial: Option<Uuid>,
    /// Upserted by id
    pub payments: Vec<Payment>,
    /// Upserted by id
    pub refunds: Vec<Refund>,
    /// Zero the user's usage counters for the period starting at the given instant
    pub reset_usage: Option<(Uuid, DateTime<Utc>)>,
}

impl LedgerWrite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_subscription(mut self, sub: Subscription) -> Self {
        self.inserted_subscriptions.push(sub);
        self
    }

    pub fn update_subscription(mut self, sub: Subscription) -> Self {
        self.updated_subscriptions.push(sub);
        self
    }

    pub fn set_projection(mut self, update: ProjectionUpdate) -> Self {
        self.projection = Some(update);
        self
    }

    pub fn claim_trial(mut self, user_id: Uuid) -> Self {
        self.claim_trial = Some(user_id);
        self
    }

    pub fn put_payment(mut self, payment: Payment) -> Self {
        self.payments.push(payment);
        self
    }

    pub fn put_refund(mut self, refund: Refund) -> Self {
        self.refunds.push(refund);
        self
    }

    pub fn reset_usage(mut self, user_id: Uuid, period_start: DateTime<Utc>) -> Self {
        self.reset_usage = Some((user_id, period_start));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inserted_subscriptions.is_empty()
            && self.updated_subscriptions.is_empty()
            && self.projection.is_none()
            && self.claim_trial.is_none()
            && self.payments.is_empty()
            && self.refunds.is_empty()
            && self.reset_usage.is_none()
    }
}

/// Durable billing records
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn account(&self, user_id: Uuid) -> BillingResult<Option<BillingAccount>>;

    /// Store or clear (`None`) the user's registered card. Returns false for unknown users.
    async fn set_card(&self, user_id: Uuid, card: Option<StoredCard>) -> BillingResult<bool>;

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    /// The user's ACTIVE or PAST_DUE subscription
    async fn open_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn trialing_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    /// Most recently created subscription in any status
    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn subscription_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> BillingResult<Option<Subscription>>;

    async fn subscriptions_for_sweep(&self, query: SweepQuery)
        -> BillingResult<Vec<Subscription>>;

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>>;

    async fn payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>>;

    /// Settled payments (anything but PENDING), newest first, with the total count
    async fn payments_for_user(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> BillingResult<(Vec<Payment>, i64)>;

    async fn refunds_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Refund>>;

    /// Apply a write set atomically
    async fn commit(&self, write: LedgerWrite) -> BillingResult<()>;

    /// Increment a usage counter unless it has reached `limit`.
    ///
    /// Returns the new count, or `None` when the limit was already reached.
    async fn increment_usage(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period: (DateTime<Utc>, DateTime<Utc>),
        limit: Option<i64>,
    ) -> BillingResult<Option<i64>>;

    async fn usage_count(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period_start: DateTime<Utc>,
    ) -> BillingResult<i64>;

    /// Claim exclusive processing of a webhook transmission.
    ///
    /// Returns false when the transmission was already processed or is being
    /// processed by someone else.
    async fn claim_transmission(
        &self,
        transmission_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<bool>;

    /// Record the processing outcome of a claimed transmission
    async fn finish_transmission(
        &self,
        transmission_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionState {
    Processing { started_at: DateTime<Utc> },
    Success,
    Error(String),
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    accounts: HashMap<Uuid, BillingAccount>,
    subscriptions: HashMap<Uuid, Subscription>,
    payments: HashMap<Uuid, Payment>,
    refunds: HashMap<Uuid, Refund>,
    usage: HashMap<(Uuid, UsageType, DateTime<Utc>), i64>,
    transmissions: HashMap<String, TransmissionState>,
}

impl MemoryState {
    fn apply(&mut self, write: LedgerWrite, now: DateTime<Utc>) -> BillingResult<()> {
        let mut user_ids: Vec<Uuid> = Vec::new();

        for sub in write.updated_subscriptions {
            let stored = self
                .subscriptions
                .get(&sub.id)
                .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", sub.id)))?;
            if stored.version != sub.version {
                return Err(BillingError::ConcurrentModification(format!(
                    "Subscription {} changed (version {} != {})",
                    sub.id, stored.version, sub.version
                )));
            }
            user_ids.push(sub.user_id);
            let mut next = sub;
            next.version += 1;
            next.updated_at = now;
            self.subscriptions.insert(next.id, next);
        }

        for sub in write.inserted_subscriptions {
            if self.subscriptions.contains_key(&sub.id) {
                return Err(BillingError::ConcurrentModification(format!(
                    "Subscription {} already exists",
                    sub.id
                )));
            }
            user_ids.push(sub.user_id);
            self.subscriptions.insert(sub.id, sub);
        }

        for payment in write.payments {
            let duplicate_order = self
                .payments
                .values()
                .any(|p| p.order_id == payment.order_id && p.id != payment.id);
            if duplicate_order {
                return Err(BillingError::Database(format!(
                    "duplicate order id {}",
                    payment.order_id
                )));
            }
            self.payments.insert(payment.id, payment);
        }

        for refund in write.refunds {
            self.refunds.insert(refund.id, refund);
        }

        if let Some(update) = write.projection {
            let account = self
                .accounts
                .get_mut(&update.user_id)
                .ok_or_else(|| BillingError::NotFound(format!("User {}", update.user_id)))?;
            account.tier = update.tier;
            account.expires_at = update.expires_at;
        }

        if let Some(user_id) = write.claim_trial {
            let account = self
                .accounts
                .get_mut(&user_id)
                .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
            if account.trial_used {
                return Err(BillingError::TrialAlreadyUsed);
            }
            account.trial_used = true;
        }

        if let Some((user_id, period_start)) = write.reset_usage {
            for ((uid, _, start), count) in self.usage.iter_mut() {
                if *uid == user_id && *start == period_start {
                    *count = 0;
                }
            }
        }

        // Same guarantee the partial unique index gives in Postgres
        for user_id in user_ids {
            let open = self
                .subscriptions
                .values()
                .filter(|s| s.user_id == user_id && s.status.is_open())
                .count();
            if open > 1 {
                return Err(BillingError::ConcurrentModification(format!(
                    "User {} would have {} open subscriptions",
                    user_id, open
                )));
            }
        }

        Ok(())
    }
}

/// In-process ledger used by tests and local development
pub struct InMemoryLedger {
    state: Mutex<MemoryState>,
    /// Stamps `updated_at` on committed rows
    clock: Arc<dyn Clock>,
    failing_commits: AtomicUsize,
    passing_commits: AtomicUsize,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLedger").finish_non_exhaustive()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            failing_commits: AtomicUsize::new(0),
            passing_commits: AtomicUsize::new(0),
        }
    }

    pub async fn insert_account(&self, account: BillingAccount) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.user_id, account);
    }

    /// Make the next `n` commits fail with a database error
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_commits_after(0, n);
    }

    /// Let `pass` commits through, then fail the following `n`
    pub fn fail_commits_after(&self, pass: usize, n: usize) {
        self.passing_commits.store(pass, Ordering::SeqCst);
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    pub async fn subscriptions_for_user(&self, user_id: Uuid) -> Vec<Subscription> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.created_at);
        subs
    }

    /// Every payment for the user, including PENDING attempts
    pub async fn all_payments_for_user(&self, user_id: Uuid) -> Vec<Payment> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        payments
    }

    pub async fn transmission(&self, transmission_id: &str) -> Option<TransmissionState> {
        self.state
            .lock()
            .await
            .transmissions
            .get(transmission_id)
            .cloned()
    }

    fn take_injected_failure(&self) -> bool {
        if self.failing_commits.load(Ordering::SeqCst) == 0 {
            return false;
        }
        if self
            .passing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return false;
        }
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn newest_first<T, F>(mut items: Vec<T>, key: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by_key(|item| std::cmp::Reverse(key(item)));
    items
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn account(&self, user_id: Uuid) -> BillingResult<Option<BillingAccount>> {
        Ok(self.state.lock().await.accounts.get(&user_id).cloned())
    }

    async fn set_card(&self, user_id: Uuid, card: Option<StoredCard>) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let Some(account) = state.accounts.get_mut(&user_id) else {
            return Ok(false);
        };
        match card {
            Some(card) => {
                account.billing_key = Some(card.billing_key);
                account.card_company = card.card_company;
                account.card_number = card.card_number;
            }
            None => {
                account.billing_key = None;
                account.card_company = None;
                account.card_number = None;
            }
        }
        Ok(true)
    }

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn open_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.status.is_open())
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn trialing_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id && s.status == SubscriptionStatus::Trialing)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .max_by_key(|s| s.created_at)
            .cloned())
    }

    async fn subscription_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.gateway_charge_ref.as_deref() == Some(charge_ref))
            .cloned())
    }

    async fn subscriptions_for_sweep(
        &self,
        query: SweepQuery,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut subs: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| query.matches(s))
            .cloned()
            .collect();
        subs.sort_by_key(|s| s.current_period_end);
        Ok(subs)
    }

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn payments_for_user(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> BillingResult<(Vec<Payment>, i64)> {
        let state = self.state.lock().await;
        let settled: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.user_id == user_id && p.status != PaymentStatus::Pending)
            .cloned()
            .collect();
        let total = settled.len() as i64;
        let page = newest_first(settled, |p| p.created_at)
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn refunds_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Refund>> {
        let state = self.state.lock().await;
        let refunds = state
            .refunds
            .values()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect();
        Ok(newest_first(refunds, |r| r.created_at))
    }

    async fn commit(&self, write: LedgerWrite) -> BillingResult<()> {
        if self.take_injected_failure() {
            return Err(BillingError::Database("injected commit failure".to_string()));
        }

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.apply(write, self.clock.now())?;
        *state = next;
        Ok(())
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period: (DateTime<Utc>, DateTime<Utc>),
        limit: Option<i64>,
    ) -> BillingResult<Option<i64>> {
        let mut state = self.state.lock().await;
        let count = state.usage.entry((user_id, usage_type, period.0)).or_insert(0);
        if limit.is_some_and(|limit| *count >= limit) {
            return Ok(None);
        }
        *count += 1;
        Ok(Some(*count))
    }

    async fn usage_count(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period_start: DateTime<Utc>,
    ) -> BillingResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .usage
            .get(&(user_id, usage_type, period_start))
            .copied()
            .unwrap_or(0))
    }

    async fn claim_transmission(
        &self,
        transmission_id: &str,
        _event_type: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let reclaimable = match state.transmissions.get(transmission_id) {
            None => true,
            Some(TransmissionState::Success) => false,
            Some(TransmissionState::Error(_)) => true,
            Some(TransmissionState::Processing { started_at }) => {
                *started_at < now - Duration::minutes(TRANSMISSION_PROCESSING_TIMEOUT_MINUTES)
            }
        };
        if reclaimable {
            state.transmissions.insert(
                transmission_id.to_string(),
                TransmissionState::Processing { started_at: now },
            );
        }
        Ok(reclaimable)
    }

    async fn finish_transmission(
        &self,
        transmission_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let next = match outcome {
            Ok(()) => TransmissionState::Success,
            Err(e) => TransmissionState::Error(e),
        };
        state.transmissions.insert(transmission_id.to_string(), next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicpay_shared::BillingInterval;

    async fn ledger_with_user() -> (InMemoryLedger, Uuid) {
        let ledger = InMemoryLedger::new();
        let user_id = Uuid::new_v4();
        ledger
            .insert_account(BillingAccount::new(user_id, "kim@clinic.kr", "Dr. Kim"))
            .await;
        (ledger, user_id)
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (ledger, user_id) = ledger_with_user().await;
        let sub = Subscription::active(
            user_id,
            SubscriptionTier::Basic,
            BillingInterval::Monthly,
            "pk_1",
            Utc::now(),
        );
        ledger
            .commit(LedgerWrite::new().insert_subscription(sub.clone()))
            .await
            .unwrap();

        let mut first = sub.clone();
        first.cancel_at = Some(first.current_period_end);
        ledger
            .commit(LedgerWrite::new().update_subscription(first))
            .await
            .unwrap();

        // Second writer still holds version 0
        let mut second = sub;
        second.status = SubscriptionStatus::Canceled;
        let err = ledger
            .commit(LedgerWrite::new().update_subscription(second))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn test_second_open_subscription_is_rejected_atomically() {
        let (ledger, user_id) = ledger_with_user().await;
        let now = Utc::now();
        let first = Subscription::active(
            user_id,
            SubscriptionTier::Basic,
            BillingInterval::Monthly,
            "pk_1",
            now,
        );
        ledger
            .commit(LedgerWrite::new().insert_subscription(first))
            .await
            .unwrap();

        let second = Subscription::active(
            user_id,
            SubscriptionTier::Clinic,
            BillingInterval::Monthly,
            "pk_2",
            now,
        );
        let err = ledger
            .commit(
                LedgerWrite::new()
                    .insert_subscription(second)
                    .set_projection(ProjectionUpdate {
                        user_id,
                        tier: SubscriptionTier::Clinic,
                        expires_at: None,
                    }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ConcurrentModification(_)));

        // Nothing from the failed write leaked
        let account = ledger.account(user_id).await.unwrap().unwrap();
        assert_eq!(account.tier, SubscriptionTier::Free);
        assert_eq!(ledger.subscriptions_for_user(user_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_trial_claim_is_one_shot() {
        let (ledger, user_id) = ledger_with_user().await;
        ledger
            .commit(LedgerWrite::new().claim_trial(user_id))
            .await
            .unwrap();
        let err = ledger
            .commit(LedgerWrite::new().claim_trial(user_id))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::TrialAlreadyUsed));
    }

    #[tokio::test]
    async fn test_usage_stops_at_limit() {
        let (ledger, user_id) = ledger_with_user().await;
        let period = (Utc::now(), Utc::now() + Duration::days(30));

        for expected in 1..=2 {
            let count = ledger
                .increment_usage(user_id, UsageType::AiQuery, period, Some(2))
                .await
                .unwrap();
            assert_eq!(count, Some(expected));
        }
        let blocked = ledger
            .increment_usage(user_id, UsageType::AiQuery, period, Some(2))
            .await
            .unwrap();
        assert_eq!(blocked, None);
        assert_eq!(
            ledger
                .usage_count(user_id, UsageType::AiQuery, period.0)
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_transmission_claims() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();

        assert!(ledger.claim_transmission("tx-1", "PAYMENT_DONE", now).await.unwrap());
        // In flight
        assert!(!ledger.claim_transmission("tx-1", "PAYMENT_DONE", now).await.unwrap());

        ledger.finish_transmission("tx-1", Ok(())).await.unwrap();
        assert!(!ledger.claim_transmission("tx-1", "PAYMENT_DONE", now).await.unwrap());

        // Failed processing may be retried
        assert!(ledger.claim_transmission("tx-2", "PAYMENT_FAILED", now).await.unwrap());
        ledger
            .finish_transmission("tx-2", Err("db down".to_string()))
            .await
            .unwrap();
        assert!(ledger.claim_transmission("tx-2", "PAYMENT_FAILED", now).await.unwrap());
    }

    #[tokio::test]
    async fn test_stuck_transmission_is_reclaimed_after_timeout() {
        let ledger = InMemoryLedger::new();
        let now = Utc::now();
        assert!(ledger.claim_transmission("tx-3", "PAYMENT_DONE", now).await.unwrap());

        let later = now + Duration::minutes(TRANSMISSION_PROCESSING_TIMEOUT_MINUTES + 1);
        assert!(ledger.claim_transmission("tx-3", "PAYMENT_DONE", later).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failure_applies_once() {
        let (ledger, user_id) = ledger_with_user().await;
        ledger.fail_next_commits(1);
        assert!(ledger
            .commit(LedgerWrite::new().claim_trial(user_id))
            .await
            .is_err());
        assert!(ledger
            .commit(LedgerWrite::new().claim_trial(user_id))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_commit_stamps_rows_with_ledger_clock() {
        use crate::clock::ManualClock;
        use chrono::TimeZone;

        let stamped_at = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        let ledger = InMemoryLedger::with_clock(Arc::new(ManualClock::new(stamped_at)));
        let user_id = Uuid::new_v4();
        let sub = Subscription::active(
            user_id,
            SubscriptionTier::Basic,
            BillingInterval::Monthly,
            "pk_1",
            stamped_at - Duration::days(3),
        );
        ledger
            .commit(LedgerWrite::new().insert_subscription(sub.clone()))
            .await
            .unwrap();

        let mut canceling = sub.clone();
        canceling.cancel_at = Some(canceling.current_period_end);
        ledger
            .commit(LedgerWrite::new().update_subscription(canceling))
            .await
            .unwrap();

        let stored = ledger.subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at, stamped_at);
    }

    #[test]
    fn test_deferred_cancel_excludes_past_due_from_retries() {
        let now = Utc::now();
        let mut sub = Subscription::active(
            Uuid::new_v4(),
            SubscriptionTier::Basic,
            BillingInterval::Monthly,
            "pk_1",
            now - Duration::days(40),
        );
        sub.status = SubscriptionStatus::PastDue;
        assert!(SweepQuery::PastDue.matches(&sub));

        sub.cancel_at = Some(sub.current_period_end);
        assert!(!SweepQuery::PastDue.matches(&sub));
        assert!(SweepQuery::DeferredCancelDue { now }.matches(&sub));
        assert!(!SweepQuery::DeferredCancelDue {
            now: sub.current_period_end - Duration::hours(1)
        }
        .matches(&sub));
    }
}
