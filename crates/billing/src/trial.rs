//! Free trial management
//!
//! A user gets one trial, ever. The `trial_used` flag lives on the account and
//! is claimed in the same commit that creates the TRIALING row, so a canceled
//! or expired trial row can never be used to grant a second one.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clinicpay_shared::{month_bounds, SubscriptionTier};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::email::{deliver, BillingNotice, BillingNotifier, Recipient};
use crate::error::{BillingError, BillingResult};
use crate::locks::UserLocks;
use crate::models::{Subscription, UsageType};
use crate::plans::{TRIAL_AI_LIMIT, TRIAL_DAYS, TRIAL_TIER};
use crate::store::{LedgerStore, LedgerWrite, ProjectionUpdate};

/// Whole days left, rounded up; zero once the trial has ended
pub fn days_remaining(ends_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let left = ends_at - now;
    if left <= Duration::zero() {
        return 0;
    }
    let day = Duration::days(1).num_seconds();
    let secs = left.num_seconds();
    (secs + day - 1) / day
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialStarted {
    pub subscription_id: Uuid,
    pub tier: SubscriptionTier,
    pub trial_ends_at: DateTime<Utc>,
    pub ai_limit: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrialStatus {
    pub is_trialing: bool,
    pub days_remaining: i64,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub can_start_trial: bool,
    pub ai_used: i64,
    pub ai_limit: i64,
}

#[derive(Clone)]
pub struct TrialManager {
    store: Arc<dyn LedgerStore>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn BillingNotifier>,
}

impl TrialManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        locks: UserLocks,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn BillingNotifier>,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            notifier,
        }
    }

    /// Grant the one-time PROFESSIONAL trial. No card needed.
    pub async fn start_free_trial(&self, user_id: Uuid) -> BillingResult<TrialStarted> {
        let guard = self.locks.lock(user_id).await;
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;

        if account.trial_used {
            return Err(BillingError::TrialAlreadyUsed);
        }
        if self.store.open_subscription(user_id).await?.is_some() {
            return Err(BillingError::AlreadySubscribed);
        }

        let now = self.clock.now();
        let ends_at = now + Duration::days(TRIAL_DAYS);
        let trial = Subscription::trial(user_id, TRIAL_TIER, now, ends_at);

        self.store
            .commit(
                LedgerWrite::new()
                    .insert_subscription(trial.clone())
                    .set_projection(ProjectionUpdate {
                        user_id,
                        tier: TRIAL_TIER,
                        expires_at: Some(ends_at),
                    })
                    .claim_trial(user_id),
            )
            .await?;
        drop(guard);

        tracing::info!(
            user_id = %user_id,
            subscription_id = %trial.id,
            trial_ends_at = %ends_at,
            "Free trial started"
        );
        deliver(
            self.notifier.as_ref(),
            &Recipient::from(&account),
            BillingNotice::TrialStarted { ends_at },
        )
        .await;

        Ok(TrialStarted {
            subscription_id: trial.id,
            tier: TRIAL_TIER,
            trial_ends_at: ends_at,
            ai_limit: TRIAL_AI_LIMIT,
        })
    }

    pub async fn trial_status(&self, user_id: Uuid) -> BillingResult<TrialStatus> {
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        let now = self.clock.now();

        let trial = self.store.trialing_subscription(user_id).await?;
        let has_open = self.store.open_subscription(user_id).await?.is_some();
        let (month_start, _) = month_bounds(now);
        let ai_used = self
            .store
            .usage_count(user_id, UsageType::AiQuery, month_start)
            .await?;

        let trial_ends_at = trial.as_ref().and_then(|t| t.trial_ends_at);
        Ok(TrialStatus {
            is_trialing: trial.is_some(),
            days_remaining: trial_ends_at.map_or(0, |end| days_remaining(end, now)),
            trial_ends_at,
            can_start_trial: !account.trial_used && !has_open,
            ai_used,
            ai_limit: TRIAL_AI_LIMIT,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_days_remaining_rounds_up() {
        let now = Utc::now();
        assert_eq!(days_remaining(now + Duration::days(7), now), 7);
        assert_eq!(days_remaining(now + Duration::hours(25), now), 2);
        assert_eq!(days_remaining(now + Duration::minutes(1), now), 1);
        assert_eq!(days_remaining(now, now), 0);
        assert_eq!(days_remaining(now - Duration::days(1), now), 0);
    }
}
