//! Usage metering
//!
//! Counters are per user, per usage type and per calendar month in the billing
//! timezone. A counter at its limit is left untouched and the use is refused.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{BillingError, BillingResult};
use crate::models::{BillingAccount, UsageType};
use crate::plans::{self, TRIAL_AI_LIMIT};
use crate::store::LedgerStore;
use clinicpay_shared::month_bounds;

#[derive(Debug, Clone, Serialize)]
pub struct UsageQuota {
    pub used: i64,
    /// `None` for unlimited
    pub limit: Option<i64>,
    pub is_trial: bool,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub ai_query: UsageQuota,
    /// Start of the next counting month
    pub reset_date: DateTime<Utc>,
}

#[derive(Clone)]
pub struct UsageMeter {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl UsageMeter {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Limit for the user's current plan, plus trial end when trialing
    async fn limit_for(
        &self,
        account: &BillingAccount,
        usage_type: UsageType,
    ) -> BillingResult<(Option<i64>, Option<DateTime<Utc>>)> {
        match usage_type {
            UsageType::AiQuery => {
                if let Some(trial) = self.store.trialing_subscription(account.user_id).await? {
                    return Ok((Some(TRIAL_AI_LIMIT), trial.trial_ends_at));
                }
                Ok((plans::price_of(account.tier).included_queries, None))
            }
        }
    }

    /// Count one use if the user is still within their limit
    pub async fn track_usage(&self, user_id: Uuid, usage_type: UsageType) -> BillingResult<bool> {
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        let (limit, _) = self.limit_for(&account, usage_type).await?;
        let period = month_bounds(self.clock.now());

        let counted = self
            .store
            .increment_usage(user_id, usage_type, period, limit)
            .await?;

        match counted {
            Some(count) => {
                tracing::debug!(user_id = %user_id, usage_type = %usage_type, count, "Usage tracked");
                Ok(true)
            }
            None => {
                tracing::info!(
                    user_id = %user_id,
                    usage_type = %usage_type,
                    limit = ?limit,
                    "Usage limit reached"
                );
                Ok(false)
            }
        }
    }

    pub async fn usage_summary(&self, user_id: Uuid) -> BillingResult<UsageSummary> {
        let account = self
            .store
            .account(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User {}", user_id)))?;
        let (limit, trial_ends_at) = self.limit_for(&account, UsageType::AiQuery).await?;
        let (month_start, month_end) = month_bounds(self.clock.now());
        let used = self
            .store
            .usage_count(user_id, UsageType::AiQuery, month_start)
            .await?;

        Ok(UsageSummary {
            ai_query: UsageQuota {
                used,
                limit,
                is_trial: trial_ends_at.is_some(),
                trial_ends_at,
            },
            reset_date: month_end,
        })
    }
}
