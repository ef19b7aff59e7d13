//! Ledger consistency checks
//!
//! Read-only SQL checks that can be run after a deploy, a webhook replay or a
//! manual data fix. Each violation carries enough context to find the rows.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::lifecycle::MAX_RETRY;

/// One broken invariant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub user_ids: Vec<Uuid>,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money may be moving incorrectly
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: DateTime<Utc>,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: DateTime<Utc>,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OpenSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct OrphanTierRow {
    user_id: Uuid,
    subscription_tier: String,
    subscription_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct TierMismatchRow {
    user_id: Uuid,
    subscription_id: Uuid,
    projected_tier: String,
    subscription_tier: String,
}

#[derive(Debug, sqlx::FromRow)]
struct OverRefundRow {
    payment_id: Uuid,
    user_id: Uuid,
    amount: i64,
    refunded: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct RetryOverflowRow {
    subscription_id: Uuid,
    user_id: Uuid,
    payment_retry_count: i32,
}

const CHECKS: [&str; 5] = [
    "single_open_subscription",
    "paid_tier_has_subscription",
    "tier_matches_subscription",
    "refunds_within_amount",
    "retry_count_within_max",
];

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let checked_at = Utc::now();
        let mut violations = Vec::new();

        violations.extend(self.check_single_open_subscription().await?);
        violations.extend(self.check_paid_tier_has_subscription().await?);
        violations.extend(self.check_tier_matches_subscription().await?);
        violations.extend(self.check_refunds_within_amount().await?);
        violations.extend(self.check_retry_count_within_max().await?);

        let summary = InvariantCheckSummary::from_violations(checked_at, CHECKS.len(), violations);
        if summary.healthy {
            tracing::info!(checks_run = summary.checks_run, "Billing invariants hold");
        } else {
            tracing::error!(
                checks_failed = summary.checks_failed,
                violations = summary.violations.len(),
                "Billing invariant violations found"
            );
        }
        Ok(summary)
    }

    /// Two open rows would mean two renewals for one user
    async fn check_single_open_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OpenSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('ACTIVE', 'PAST_DUE')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_open_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} ACTIVE/PAST_DUE subscriptions (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_paid_tier_has_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OrphanTierRow> = sqlx::query_as(
            r#"
            SELECT u.id AS user_id, u.subscription_tier, u.subscription_expires_at
            FROM users u
            WHERE u.subscription_tier <> 'FREE'
              AND NOT EXISTS (
                  SELECT 1 FROM subscriptions s
                  WHERE s.user_id = u.id
                    AND s.status IN ('ACTIVE', 'PAST_DUE', 'TRIALING')
              )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "paid_tier_has_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User is on tier '{}' with no live subscription",
                    row.subscription_tier
                ),
                context: serde_json::json!({
                    "subscription_tier": row.subscription_tier,
                    "subscription_expires_at": row.subscription_expires_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    async fn check_tier_matches_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<TierMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                u.id AS user_id,
                s.id AS subscription_id,
                u.subscription_tier AS projected_tier,
                s.tier AS subscription_tier
            FROM users u
            JOIN subscriptions s ON s.user_id = u.id
            WHERE s.status = 'ACTIVE'
              AND s.tier <> u.subscription_tier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "tier_matches_subscription".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User tier '{}' differs from ACTIVE subscription tier '{}'",
                    row.projected_tier, row.subscription_tier
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "projected_tier": row.projected_tier,
                    "subscription_tier": row.subscription_tier,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    async fn check_refunds_within_amount(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<OverRefundRow> = sqlx::query_as(
            r#"
            SELECT
                p.id AS payment_id,
                p.user_id,
                p.amount,
                SUM(r.amount)::BIGINT AS refunded
            FROM payments p
            JOIN refunds r ON r.payment_id = p.id
            WHERE r.status = 'COMPLETED'
            GROUP BY p.id, p.user_id, p.amount
            HAVING SUM(r.amount) > p.amount
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refunds_within_amount".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Completed refunds ({}원) exceed payment amount ({}원)",
                    row.refunded, row.amount
                ),
                context: serde_json::json!({
                    "payment_id": row.payment_id,
                    "amount": row.amount,
                    "refunded": row.refunded,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_retry_count_within_max(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<RetryOverflowRow> = sqlx::query_as(
            r#"
            SELECT id AS subscription_id, user_id, payment_retry_count
            FROM subscriptions
            WHERE status = 'PAST_DUE'
              AND payment_retry_count > $1
            "#,
        )
        .bind(MAX_RETRY)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "retry_count_within_max".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "PAST_DUE subscription has {} retries (max {})",
                    row.payment_retry_count, MAX_RETRY
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "payment_retry_count": row.payment_retry_count,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single check by name; unknown names find nothing
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_open_subscription" => self.check_single_open_subscription().await,
            "paid_tier_has_subscription" => self.check_paid_tier_has_subscription().await,
            "tier_matches_subscription" => self.check_tier_matches_subscription().await,
            "refunds_within_amount" => self.check_refunds_within_amount().await,
            "retry_count_within_max" => self.check_retry_count_within_max().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
