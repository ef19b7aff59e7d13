//! Subscription state machine
//!
//! ```text
//! ACTIVE   --renewal ok-------------> ACTIVE     (period rolled, retries reset)
//! ACTIVE   --renewal failed---------> PAST_DUE   (retries stay 0)
//! PAST_DUE --retry ok---------------> ACTIVE     (period rolled, retries reset)
//! PAST_DUE --retry failed, n+1 < 3--> PAST_DUE   (retries n+1)
//! PAST_DUE --retry failed, n+1 = 3--> CANCELED   (projection FREE)
//! ACTIVE   --schedule cancel--------> ACTIVE     (cancel_at = period end)
//! ACTIVE|PAST_DUE --cancel_at reached--> CANCELED   (projection FREE, no charge)
//! ACTIVE|PAST_DUE --cancel now------> CANCELED   (projection FREE)
//! TRIALING --window elapsed---------> CANCELED   (projection FREE)
//! TRIALING --subscribed-------------> CANCELED   (trial_converted; new row is ACTIVE)
//! ```
//!
//! [`transition`] is pure. [`SubscriptionLifecycle`] applies it under the
//! user's lock and commits the row together with the projection.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::locks::{UserLockGuard, UserLocks};
use crate::models::{Subscription, SubscriptionStatus};
use crate::store::{LedgerStore, LedgerWrite, ProjectionUpdate};

/// Failed retries after which a PAST_DUE subscription is canceled
pub const MAX_RETRY: i32 = 3;

/// Error recorded when the gateway reports a failed payment asynchronously
pub const WEBHOOK_FAILURE_MESSAGE: &str = "결제 실패 (웹훅)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    RenewalSucceeded { charge_ref: String },
    RenewalFailed { reason: String },
    RetrySucceeded { charge_ref: String },
    RetryFailed { reason: String },
    ScheduleCancel,
    CancelImmediately,
    DeferredCancelDue,
    TrialExpired,
    TrialConverted,
    /// Gateway reported the paying charge as canceled
    PaymentCanceled,
    /// Gateway reported a failed payment
    PaymentFailed { reason: String },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RenewalSucceeded { .. } => "renewal_succeeded",
            LifecycleEvent::RenewalFailed { .. } => "renewal_failed",
            LifecycleEvent::RetrySucceeded { .. } => "retry_succeeded",
            LifecycleEvent::RetryFailed { .. } => "retry_failed",
            LifecycleEvent::ScheduleCancel => "schedule_cancel",
            LifecycleEvent::CancelImmediately => "cancel_immediately",
            LifecycleEvent::DeferredCancelDue => "deferred_cancel_due",
            LifecycleEvent::TrialExpired => "trial_expired",
            LifecycleEvent::TrialConverted => "trial_converted",
            LifecycleEvent::PaymentCanceled => "payment_canceled",
            LifecycleEvent::PaymentFailed { .. } => "payment_failed",
        }
    }
}

/// Outcome of applying an event to a subscription
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied {
        subscription: Subscription,
        projection: Option<ProjectionUpdate>,
    },
    /// Already in the target state, or the event no longer applies
    Ignored,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        match self {
            Transition::Applied { subscription, .. } => Some(subscription),
            Transition::Ignored => None,
        }
    }

    /// The write set for this transition, empty when ignored
    pub fn into_write(self) -> LedgerWrite {
        match self {
            Transition::Applied {
                subscription,
                projection,
            } => {
                let write = LedgerWrite::new().update_subscription(subscription);
                match projection {
                    Some(update) => write.set_projection(update),
                    None => write,
                }
            }
            Transition::Ignored => LedgerWrite::new(),
        }
    }
}

fn invalid(sub: &Subscription, event: &LifecycleEvent) -> BillingError {
    BillingError::InvalidTransition {
        from: sub.status.to_string(),
        event: event.name().to_string(),
    }
}

/// Next period when rolling forward from the previous period end.
/// Falls back to `now` as the anchor if the subscription lapsed for a whole period.
pub fn next_period(sub: &Subscription, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = sub.current_period_end;
    let end = sub.interval.advance(start);
    if end <= now {
        (now, sub.interval.advance(now))
    } else {
        (start, end)
    }
}

fn roll_forward(sub: &Subscription, charge_ref: &str, now: DateTime<Utc>) -> Transition {
    let (start, end) = next_period(sub, now);
    let mut next = sub.clone();
    next.status = SubscriptionStatus::Active;
    next.current_period_start = start;
    next.current_period_end = end;
    next.gateway_charge_ref = Some(charge_ref.to_string());
    next.payment_retry_count = 0;
    next.last_payment_error = None;
    Transition::Applied {
        projection: Some(ProjectionUpdate {
            user_id: sub.user_id,
            tier: sub.tier,
            expires_at: Some(end),
        }),
        subscription: next,
    }
}

fn cancel(sub: &Subscription, now: DateTime<Utc>) -> Transition {
    let mut next = sub.clone();
    next.status = SubscriptionStatus::Canceled;
    next.canceled_at = Some(now);
    Transition::Applied {
        subscription: next,
        projection: Some(ProjectionUpdate::free(sub.user_id)),
    }
}

/// Apply one event to a subscription
pub fn transition(
    sub: &Subscription,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> BillingResult<Transition> {
    use SubscriptionStatus::*;

    match (event, sub.status) {
        (LifecycleEvent::RenewalSucceeded { charge_ref }, Active) => {
            Ok(roll_forward(sub, charge_ref, now))
        }
        (LifecycleEvent::RetrySucceeded { charge_ref }, PastDue) => {
            Ok(roll_forward(sub, charge_ref, now))
        }
        (LifecycleEvent::RenewalSucceeded { .. }, _)
        | (LifecycleEvent::RetrySucceeded { .. }, _) => Err(invalid(sub, event)),

        (LifecycleEvent::RenewalFailed { reason }, Active) => {
            let mut next = sub.clone();
            next.status = PastDue;
            next.payment_retry_count = 0;
            next.last_payment_error = Some(reason.clone());
            Ok(Transition::Applied {
                subscription: next,
                projection: None,
            })
        }
        (LifecycleEvent::RenewalFailed { .. }, _) => Err(invalid(sub, event)),

        (LifecycleEvent::RetryFailed { reason }, PastDue) => {
            let retries = sub.payment_retry_count + 1;
            if retries >= MAX_RETRY {
                let mut canceled = cancel(sub, now);
                if let Transition::Applied { subscription, .. } = &mut canceled {
                    subscription.payment_retry_count = retries;
                    subscription.last_payment_error = Some(reason.clone());
                }
                Ok(canceled)
            } else {
                let mut next = sub.clone();
                next.payment_retry_count = retries;
                next.last_payment_error = Some(reason.clone());
                Ok(Transition::Applied {
                    subscription: next,
                    projection: None,
                })
            }
        }
        (LifecycleEvent::RetryFailed { .. }, _) => Err(invalid(sub, event)),

        (LifecycleEvent::ScheduleCancel, Active) => {
            if sub.cancel_at.is_some() {
                return Ok(Transition::Ignored);
            }
            let mut next = sub.clone();
            next.cancel_at = Some(sub.current_period_end);
            Ok(Transition::Applied {
                subscription: next,
                projection: None,
            })
        }
        (LifecycleEvent::ScheduleCancel, _) => Err(invalid(sub, event)),

        (LifecycleEvent::CancelImmediately, Active | PastDue) => Ok(cancel(sub, now)),
        (LifecycleEvent::CancelImmediately, Canceled) => Ok(Transition::Ignored),
        (LifecycleEvent::CancelImmediately, _) => Err(invalid(sub, event)),

        (LifecycleEvent::DeferredCancelDue, Active | PastDue) => match sub.cancel_at {
            Some(at) if at <= now => Ok(cancel(sub, now)),
            _ => Ok(Transition::Ignored),
        },
        (LifecycleEvent::DeferredCancelDue, _) => Ok(Transition::Ignored),

        (LifecycleEvent::TrialExpired, Trialing) => match sub.trial_ends_at {
            Some(at) if at <= now => Ok(cancel(sub, now)),
            _ => Ok(Transition::Ignored),
        },
        (LifecycleEvent::TrialExpired, _) => Ok(Transition::Ignored),

        (LifecycleEvent::TrialConverted, Trialing) => {
            let mut next = sub.clone();
            next.status = Canceled;
            next.canceled_at = Some(now);
            next.trial_converted = true;
            Ok(Transition::Applied {
                subscription: next,
                projection: None,
            })
        }
        (LifecycleEvent::TrialConverted, _) => Err(invalid(sub, event)),

        (LifecycleEvent::PaymentCanceled, Active | PastDue) => Ok(cancel(sub, now)),
        (LifecycleEvent::PaymentCanceled, _) => Ok(Transition::Ignored),

        (LifecycleEvent::PaymentFailed { reason }, Active) => {
            let mut next = sub.clone();
            next.status = PastDue;
            next.last_payment_error = Some(reason.clone());
            Ok(Transition::Applied {
                subscription: next,
                projection: None,
            })
        }
        (LifecycleEvent::PaymentFailed { .. }, _) => Ok(Transition::Ignored),
    }
}

/// Applies non-charging transitions under the user's lock
#[derive(Clone)]
pub struct SubscriptionLifecycle {
    store: Arc<dyn LedgerStore>,
    locks: UserLocks,
    clock: Arc<dyn Clock>,
}

impl SubscriptionLifecycle {
    pub fn new(store: Arc<dyn LedgerStore>, locks: UserLocks, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            locks,
            clock,
        }
    }

    /// Lock the owner, re-read the row and apply the event
    pub async fn apply(
        &self,
        subscription_id: Uuid,
        event: LifecycleEvent,
    ) -> BillingResult<Transition> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))?;
        let guard = self.locks.lock(sub.user_id).await;
        self.apply_locked(&guard, subscription_id, event).await
    }

    /// Apply the event while the caller already holds the owner's lock
    pub async fn apply_locked(
        &self,
        guard: &UserLockGuard,
        subscription_id: Uuid,
        event: LifecycleEvent,
    ) -> BillingResult<Transition> {
        let sub = self
            .store
            .subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Subscription {}", subscription_id)))?;
        if sub.user_id != guard.user_id() {
            return Err(BillingError::InvalidRequest(format!(
                "Subscription {} does not belong to user {}",
                subscription_id,
                guard.user_id()
            )));
        }

        let outcome = transition(&sub, &event, self.clock.now())?;
        if let Transition::Applied { subscription, .. } = &outcome {
            tracing::info!(
                subscription_id = %subscription_id,
                user_id = %sub.user_id,
                event = event.name(),
                from = %sub.status,
                to = %subscription.status,
                "Subscription transition"
            );
            self.store.commit(outcome.clone().into_write()).await?;
        } else {
            tracing::debug!(
                subscription_id = %subscription_id,
                event = event.name(),
                status = %sub.status,
                "Transition not applicable, ignoring"
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use clinicpay_shared::{BillingInterval, SubscriptionTier};

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 3, 0, 0).unwrap()
    }

    fn active_sub(now: DateTime<Utc>) -> Subscription {
        Subscription::active(
            Uuid::new_v4(),
            SubscriptionTier::Professional,
            BillingInterval::Monthly,
            "pk_initial",
            now,
        )
    }

    fn applied(t: Transition) -> (Subscription, Option<ProjectionUpdate>) {
        match t {
            Transition::Applied {
                subscription,
                projection,
            } => (subscription, projection),
            Transition::Ignored => panic!("expected transition to apply"),
        }
    }

    #[test]
    fn test_renewal_rolls_from_previous_period_end() {
        let start = at(2026, 1, 15);
        let sub = active_sub(start);
        let renew_at = sub.current_period_end - Duration::hours(12);

        let (next, projection) = applied(
            transition(
                &sub,
                &LifecycleEvent::RenewalSucceeded {
                    charge_ref: "pk_2".to_string(),
                },
                renew_at,
            )
            .unwrap(),
        );

        assert_eq!(next.current_period_start, sub.current_period_end);
        assert_eq!(
            next.current_period_end,
            BillingInterval::Monthly.advance(sub.current_period_end)
        );
        assert_eq!(next.payment_retry_count, 0);
        assert_eq!(next.gateway_charge_ref.as_deref(), Some("pk_2"));
        let projection = projection.unwrap();
        assert_eq!(projection.tier, SubscriptionTier::Professional);
        assert_eq!(projection.expires_at, Some(next.current_period_end));
    }

    #[test]
    fn test_lapsed_subscription_is_anchored_at_now() {
        let sub = active_sub(at(2026, 1, 15));
        let much_later = at(2026, 6, 1);
        let (start, end) = next_period(&sub, much_later);
        assert_eq!(start, much_later);
        assert_eq!(end, BillingInterval::Monthly.advance(much_later));
    }

    #[test]
    fn test_failed_renewal_moves_to_past_due_without_retry_increment() {
        let sub = active_sub(at(2026, 1, 15));
        let (next, projection) = applied(
            transition(
                &sub,
                &LifecycleEvent::RenewalFailed {
                    reason: "잔액 부족".to_string(),
                },
                at(2026, 2, 15),
            )
            .unwrap(),
        );
        assert_eq!(next.status, SubscriptionStatus::PastDue);
        assert_eq!(next.payment_retry_count, 0);
        assert_eq!(next.last_payment_error.as_deref(), Some("잔액 부족"));
        assert!(projection.is_none());
    }

    #[test]
    fn test_retry_failures_cancel_at_max() {
        let now = at(2026, 2, 15);
        let mut sub = active_sub(at(2026, 1, 15));
        sub.status = SubscriptionStatus::PastDue;
        let failed = LifecycleEvent::RetryFailed {
            reason: "한도 초과".to_string(),
        };

        for expected in 1..MAX_RETRY {
            let (next, _) = applied(transition(&sub, &failed, now).unwrap());
            assert_eq!(next.status, SubscriptionStatus::PastDue);
            assert_eq!(next.payment_retry_count, expected);
            sub = next;
        }

        let (last, projection) = applied(transition(&sub, &failed, now).unwrap());
        assert_eq!(last.status, SubscriptionStatus::Canceled);
        assert_eq!(last.payment_retry_count, MAX_RETRY);
        assert_eq!(projection, Some(ProjectionUpdate::free(sub.user_id)));
    }

    #[test]
    fn test_retry_success_resets_count() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.status = SubscriptionStatus::PastDue;
        sub.payment_retry_count = 2;
        let (next, _) = applied(
            transition(
                &sub,
                &LifecycleEvent::RetrySucceeded {
                    charge_ref: "pk_retry".to_string(),
                },
                at(2026, 2, 16),
            )
            .unwrap(),
        );
        assert_eq!(next.status, SubscriptionStatus::Active);
        assert_eq!(next.payment_retry_count, 0);
        assert!(next.last_payment_error.is_none());
    }

    #[test]
    fn test_schedule_cancel_is_idempotent() {
        let sub = active_sub(at(2026, 1, 15));
        let (scheduled, _) =
            applied(transition(&sub, &LifecycleEvent::ScheduleCancel, at(2026, 1, 20)).unwrap());
        assert_eq!(scheduled.cancel_at, Some(sub.current_period_end));
        assert_eq!(scheduled.status, SubscriptionStatus::Active);

        let again = transition(&scheduled, &LifecycleEvent::ScheduleCancel, at(2026, 1, 21)).unwrap();
        assert_eq!(again, Transition::Ignored);
    }

    #[test]
    fn test_deferred_cancel_waits_for_cancel_at() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.cancel_at = Some(sub.current_period_end);

        let early = transition(&sub, &LifecycleEvent::DeferredCancelDue, at(2026, 2, 1)).unwrap();
        assert_eq!(early, Transition::Ignored);

        let (canceled, projection) = applied(
            transition(&sub, &LifecycleEvent::DeferredCancelDue, sub.current_period_end).unwrap(),
        );
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(projection.is_some());

        let twice = transition(&canceled, &LifecycleEvent::DeferredCancelDue, at(2026, 3, 1)).unwrap();
        assert_eq!(twice, Transition::Ignored);
    }

    #[test]
    fn test_past_due_with_deferred_cancel_is_canceled_at_cancel_at() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.cancel_at = Some(sub.current_period_end);
        let (past_due, _) = applied(
            transition(
                &sub,
                &LifecycleEvent::PaymentFailed {
                    reason: WEBHOOK_FAILURE_MESSAGE.to_string(),
                },
                at(2026, 1, 20),
            )
            .unwrap(),
        );
        assert_eq!(past_due.status, SubscriptionStatus::PastDue);

        let (canceled, projection) = applied(
            transition(
                &past_due,
                &LifecycleEvent::DeferredCancelDue,
                sub.current_period_end,
            )
            .unwrap(),
        );
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert_eq!(projection, Some(ProjectionUpdate::free(sub.user_id)));
    }

    #[test]
    fn test_webhook_events_are_idempotent_on_terminal_rows() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.status = SubscriptionStatus::Canceled;

        for event in [
            LifecycleEvent::PaymentCanceled,
            LifecycleEvent::PaymentFailed {
                reason: WEBHOOK_FAILURE_MESSAGE.to_string(),
            },
            LifecycleEvent::CancelImmediately,
        ] {
            assert_eq!(transition(&sub, &event, at(2026, 1, 20)).unwrap(), Transition::Ignored);
        }
    }

    #[test]
    fn test_webhook_failure_on_past_due_is_ignored() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.status = SubscriptionStatus::PastDue;
        sub.payment_retry_count = 1;
        let outcome = transition(
            &sub,
            &LifecycleEvent::PaymentFailed {
                reason: WEBHOOK_FAILURE_MESSAGE.to_string(),
            },
            at(2026, 2, 16),
        )
        .unwrap();
        assert_eq!(outcome, Transition::Ignored);
    }

    #[test]
    fn test_renewal_of_canceled_row_is_invalid() {
        let mut sub = active_sub(at(2026, 1, 15));
        sub.status = SubscriptionStatus::Canceled;
        let err = transition(
            &sub,
            &LifecycleEvent::RenewalSucceeded {
                charge_ref: "pk".to_string(),
            },
            at(2026, 2, 15),
        )
        .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition { .. }));
    }

    #[test]
    fn test_trial_expiry_and_conversion() {
        let now = at(2026, 3, 1);
        let trial = Subscription::trial(
            Uuid::new_v4(),
            SubscriptionTier::Professional,
            now,
            now + Duration::days(7),
        );

        let early = transition(&trial, &LifecycleEvent::TrialExpired, now + Duration::days(3)).unwrap();
        assert_eq!(early, Transition::Ignored);

        let (expired, projection) = applied(
            transition(&trial, &LifecycleEvent::TrialExpired, now + Duration::days(7)).unwrap(),
        );
        assert_eq!(expired.status, SubscriptionStatus::Canceled);
        assert!(!expired.trial_converted);
        assert_eq!(projection, Some(ProjectionUpdate::free(trial.user_id)));

        let (converted, projection) = applied(
            transition(&trial, &LifecycleEvent::TrialConverted, now + Duration::days(2)).unwrap(),
        );
        assert_eq!(converted.status, SubscriptionStatus::Canceled);
        assert!(converted.trial_converted);
        assert!(projection.is_none());
    }
}
