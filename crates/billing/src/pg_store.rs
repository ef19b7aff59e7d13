//! Postgres ledger
//!
//! `commit` runs in one transaction: the affected user rows are locked
//! `FOR UPDATE`, subscription updates are guarded by `version`, and the partial
//! unique index on open subscriptions backs the one-open-subscription rule.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BillingAccount, Payment, Refund, StoredCard, Subscription, SubscriptionStatus, UsageType,
};
use crate::store::{
    LedgerStore, LedgerWrite, SweepQuery, TRANSMISSION_PROCESSING_TIMEOUT_MINUTES,
};

const OPEN_SUBSCRIPTION_INDEX: &str = "subscriptions_one_open_per_user";

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, tier, status, billing_interval, gateway_charge_ref,
    current_period_start, current_period_end, cancel_at, canceled_at,
    payment_retry_count, last_payment_error, is_trial, trial_started_at,
    trial_ends_at, trial_converted, trial_ending_notified, version,
    created_at, updated_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, user_id, subscription_id, order_id, order_name, tier, billing_interval,
    amount, base_amount, overage_amount, overage_count, refunded_amount, status,
    payment_key, card_company, card_number, receipt_url, failure_code,
    failure_message, paid_at, failed_at, refunded_at, created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    id: Uuid,
    email: String,
    name: String,
    subscription_tier: String,
    subscription_expires_at: Option<DateTime<Utc>>,
    billing_key: Option<String>,
    card_company: Option<String>,
    card_number: Option<String>,
    trial_used: bool,
}

impl TryFrom<AccountRow> for BillingAccount {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(BillingAccount {
            user_id: row.id,
            email: row.email,
            name: row.name,
            tier: parse_column(&row.subscription_tier)?,
            expires_at: row.subscription_expires_at,
            billing_key: row.billing_key,
            card_company: row.card_company,
            card_number: row.card_number,
            trial_used: row.trial_used,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    tier: String,
    status: String,
    billing_interval: String,
    gateway_charge_ref: Option<String>,
    current_period_start: DateTime<Utc>,
    current_period_end: DateTime<Utc>,
    cancel_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    payment_retry_count: i32,
    last_payment_error: Option<String>,
    is_trial: bool,
    trial_started_at: Option<DateTime<Utc>>,
    trial_ends_at: Option<DateTime<Utc>>,
    trial_converted: bool,
    trial_ending_notified: bool,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            tier: parse_column(&row.tier)?,
            status: parse_column(&row.status)?,
            interval: parse_column(&row.billing_interval)?,
            gateway_charge_ref: row.gateway_charge_ref,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at: row.cancel_at,
            canceled_at: row.canceled_at,
            payment_retry_count: row.payment_retry_count,
            last_payment_error: row.last_payment_error,
            is_trial: row.is_trial,
            trial_started_at: row.trial_started_at,
            trial_ends_at: row.trial_ends_at,
            trial_converted: row.trial_converted,
            trial_ending_notified: row.trial_ending_notified,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    subscription_id: Option<Uuid>,
    order_id: String,
    order_name: String,
    tier: String,
    billing_interval: String,
    amount: i64,
    base_amount: i64,
    overage_amount: i64,
    overage_count: i32,
    refunded_amount: i64,
    status: String,
    payment_key: Option<String>,
    card_company: Option<String>,
    card_number: Option<String>,
    receipt_url: Option<String>,
    failure_code: Option<String>,
    failure_message: Option<String>,
    paid_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    refunded_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            user_id: row.user_id,
            subscription_id: row.subscription_id,
            order_id: row.order_id,
            order_name: row.order_name,
            tier: parse_column(&row.tier)?,
            interval: parse_column(&row.billing_interval)?,
            amount: row.amount,
            base_amount: row.base_amount,
            overage_amount: row.overage_amount,
            overage_count: row.overage_count,
            refunded_amount: row.refunded_amount,
            status: parse_column(&row.status)?,
            payment_key: row.payment_key,
            card_company: row.card_company,
            card_number: row.card_number,
            receipt_url: row.receipt_url,
            failure_code: row.failure_code,
            failure_message: row.failure_message,
            paid_at: row.paid_at,
            failed_at: row.failed_at,
            refunded_at: row.refunded_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    payment_id: Uuid,
    user_id: Uuid,
    amount: i64,
    reason: String,
    status: String,
    refund_key: Option<String>,
    failure_reason: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = BillingError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(Refund {
            id: row.id,
            payment_id: row.payment_id,
            user_id: row.user_id,
            amount: row.amount,
            reason: row.reason,
            status: parse_column(&row.status)?,
            refund_key: row.refund_key,
            failure_reason: row.failure_reason,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

fn parse_column<T>(value: &str) -> BillingResult<T>
where
    T: std::str::FromStr<Err = clinicpay_shared::ParseEnumError>,
{
    value
        .parse()
        .map_err(|e: clinicpay_shared::ParseEnumError| BillingError::Database(e.to_string()))
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Map a write error, recognising the open-subscription index
fn map_write_err(e: sqlx::Error) -> BillingError {
    let hit_open_index = e
        .as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|c| c == OPEN_SUBSCRIPTION_INDEX);
    if hit_open_index {
        BillingError::ConcurrentModification(
            "User already has an open subscription".to_string(),
        )
    } else {
        BillingError::Database(e.to_string())
    }
}

/// Ledger backed by Postgres
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_subscription(
        &self,
        filter: &str,
        bind: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {} ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS, filter
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(bind)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        row.map(Subscription::try_from).transpose()
    }

    async fn update_subscription(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
    ) -> BillingResult<()> {
        let rows_affected = sqlx::query(
            r#"
            UPDATE subscriptions SET
                tier = $3,
                status = $4,
                billing_interval = $5,
                gateway_charge_ref = $6,
                current_period_start = $7,
                current_period_end = $8,
                cancel_at = $9,
                canceled_at = $10,
                payment_retry_count = $11,
                last_payment_error = $12,
                trial_converted = $13,
                trial_ending_notified = $14,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            "#,
        )
        .bind(sub.id)
        .bind(sub.version)
        .bind(sub.tier.as_str())
        .bind(sub.status.as_str())
        .bind(sub.interval.as_str())
        .bind(&sub.gateway_charge_ref)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at)
        .bind(sub.canceled_at)
        .bind(sub.payment_retry_count)
        .bind(&sub.last_payment_error)
        .bind(sub.trial_converted)
        .bind(sub.trial_ending_notified)
        .execute(&mut **tx)
        .await
        .map_err(map_write_err)?
        .rows_affected();

        if rows_affected == 0 {
            // Optimistic lock failed - someone else modified the row
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process",
                sub.id
            )));
        }
        Ok(())
    }

    async fn insert_subscription(
        tx: &mut Transaction<'_, Postgres>,
        sub: &Subscription,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, tier, status, billing_interval, gateway_charge_ref,
                current_period_start, current_period_end, cancel_at, canceled_at,
                payment_retry_count, last_payment_error, is_trial, trial_started_at,
                trial_ends_at, trial_converted, trial_ending_notified, version,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(sub.id)
        .bind(sub.user_id)
        .bind(sub.tier.as_str())
        .bind(sub.status.as_str())
        .bind(sub.interval.as_str())
        .bind(&sub.gateway_charge_ref)
        .bind(sub.current_period_start)
        .bind(sub.current_period_end)
        .bind(sub.cancel_at)
        .bind(sub.canceled_at)
        .bind(sub.payment_retry_count)
        .bind(&sub.last_payment_error)
        .bind(sub.is_trial)
        .bind(sub.trial_started_at)
        .bind(sub.trial_ends_at)
        .bind(sub.trial_converted)
        .bind(sub.trial_ending_notified)
        .bind(sub.version)
        .bind(sub.created_at)
        .bind(sub.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(map_write_err)?;
        Ok(())
    }

    async fn upsert_payment(
        tx: &mut Transaction<'_, Postgres>,
        p: &Payment,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, user_id, subscription_id, order_id, order_name, tier, billing_interval,
                amount, base_amount, overage_amount, overage_count, refunded_amount, status,
                payment_key, card_company, card_number, receipt_url, failure_code,
                failure_message, paid_at, failed_at, refunded_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                    $16, $17, $18, $19, $20, $21, $22, $23, NOW())
            ON CONFLICT (id) DO UPDATE SET
                subscription_id = EXCLUDED.subscription_id,
                refunded_amount = EXCLUDED.refunded_amount,
                status = EXCLUDED.status,
                payment_key = EXCLUDED.payment_key,
                card_company = EXCLUDED.card_company,
                card_number = EXCLUDED.card_number,
                receipt_url = EXCLUDED.receipt_url,
                failure_code = EXCLUDED.failure_code,
                failure_message = EXCLUDED.failure_message,
                paid_at = EXCLUDED.paid_at,
                failed_at = EXCLUDED.failed_at,
                refunded_at = EXCLUDED.refunded_at,
                updated_at = NOW()
            "#,
        )
        .bind(p.id)
        .bind(p.user_id)
        .bind(p.subscription_id)
        .bind(&p.order_id)
        .bind(&p.order_name)
        .bind(p.tier.as_str())
        .bind(p.interval.as_str())
        .bind(p.amount)
        .bind(p.base_amount)
        .bind(p.overage_amount)
        .bind(p.overage_count)
        .bind(p.refunded_amount)
        .bind(p.status.as_str())
        .bind(&p.payment_key)
        .bind(&p.card_company)
        .bind(&p.card_number)
        .bind(&p.receipt_url)
        .bind(&p.failure_code)
        .bind(&p.failure_message)
        .bind(p.paid_at)
        .bind(p.failed_at)
        .bind(p.refunded_at)
        .bind(p.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn upsert_refund(tx: &mut Transaction<'_, Postgres>, r: &Refund) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO refunds (
                id, payment_id, user_id, amount, reason, status, refund_key,
                failure_reason, processed_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                refund_key = EXCLUDED.refund_key,
                failure_reason = EXCLUDED.failure_reason,
                processed_at = EXCLUDED.processed_at
            "#,
        )
        .bind(r.id)
        .bind(r.payment_id)
        .bind(r.user_id)
        .bind(r.amount)
        .bind(&r.reason)
        .bind(r.status.as_str())
        .bind(&r.refund_key)
        .bind(&r.failure_reason)
        .bind(r.processed_at)
        .bind(r.created_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn account(&self, user_id: Uuid) -> BillingResult<Option<BillingAccount>> {
        let row: Option<AccountRow> = sqlx::query_as(
            r#"
            SELECT id, email, name, subscription_tier, subscription_expires_at,
                   billing_key, card_company, card_number, trial_used
            FROM users WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        row.map(BillingAccount::try_from).transpose()
    }

    async fn set_card(&self, user_id: Uuid, card: Option<StoredCard>) -> BillingResult<bool> {
        let (billing_key, card_company, card_number) = match card {
            Some(card) => (Some(card.billing_key), card.card_company, card.card_number),
            None => (None, None, None),
        };
        let rows_affected = sqlx::query(
            r#"
            UPDATE users SET
                billing_key = $2,
                card_company = $3,
                card_number = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(billing_key)
        .bind(card_company)
        .bind(card_number)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?
        .rows_affected();
        Ok(rows_affected > 0)
    }

    async fn subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription("id = $1", id).await
    }

    async fn open_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription("user_id = $1 AND status IN ('ACTIVE', 'PAST_DUE')", user_id)
            .await
    }

    async fn trialing_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription("user_id = $1 AND status = 'TRIALING'", user_id)
            .await
    }

    async fn latest_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.fetch_subscription("user_id = $1", user_id).await
    }

    async fn subscription_by_charge_ref(
        &self,
        charge_ref: &str,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE gateway_charge_ref = $1 ORDER BY created_at DESC LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        let row: Option<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(charge_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        row.map(Subscription::try_from).transpose()
    }

    async fn subscriptions_for_sweep(
        &self,
        query: SweepQuery,
    ) -> BillingResult<Vec<Subscription>> {
        let (filter, at) = match query {
            SweepQuery::RenewalDue { before } => (
                "status = 'ACTIVE' AND cancel_at IS NULL AND current_period_end <= $1",
                Some(before),
            ),
            SweepQuery::DeferredCancelDue { now } => (
                "status IN ('ACTIVE', 'PAST_DUE') AND cancel_at IS NOT NULL AND cancel_at <= $1",
                Some(now),
            ),
            SweepQuery::PastDue => ("status = 'PAST_DUE' AND cancel_at IS NULL", None),
            SweepQuery::TrialExpired { now } => (
                "status = 'TRIALING' AND trial_ends_at <= $1",
                Some(now),
            ),
            SweepQuery::TrialEndingSoon { before } => (
                "status = 'TRIALING' AND trial_ending_notified = FALSE AND trial_ends_at <= $1",
                Some(before),
            ),
        };

        let sql = format!(
            "SELECT {} FROM subscriptions WHERE {} ORDER BY current_period_end ASC",
            SUBSCRIPTION_COLUMNS, filter
        );
        let mut q = sqlx::query_as::<_, SubscriptionRow>(&sql);
        if let Some(at) = at {
            q = q.bind(at);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        convert_all(rows)
    }

    async fn payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        row.map(Payment::try_from).transpose()
    }

    async fn payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE order_id = $1", PAYMENT_COLUMNS);
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        row.map(Payment::try_from).transpose()
    }

    async fn payments_for_user(
        &self,
        user_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> BillingResult<(Vec<Payment>, i64)> {
        let sql = format!(
            r#"
            SELECT {} FROM payments
            WHERE user_id = $1 AND status <> 'PENDING'
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
            PAYMENT_COLUMNS
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payments WHERE user_id = $1 AND status <> 'PENDING'",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;

        Ok((convert_all(rows)?, total))
    }

    async fn refunds_for_user(&self, user_id: Uuid) -> BillingResult<Vec<Refund>> {
        let rows: Vec<RefundRow> = sqlx::query_as(
            r#"
            SELECT id, payment_id, user_id, amount, reason, status, refund_key,
                   failure_reason, processed_at, created_at
            FROM refunds
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        convert_all(rows)
    }

    async fn commit(&self, write: LedgerWrite) -> BillingResult<()> {
        if write.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;

        // Lock every affected user row in a stable order
        let mut user_ids: Vec<Uuid> = write
            .updated_subscriptions
            .iter()
            .chain(write.inserted_subscriptions.iter())
            .map(|s| s.user_id)
            .chain(write.projection.map(|p| p.user_id))
            .chain(write.claim_trial)
            .collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        if !user_ids.is_empty() {
            sqlx::query("SELECT id FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE")
                .bind(&user_ids)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        // Updates first so a canceled predecessor frees the open-subscription slot
        for sub in &write.updated_subscriptions {
            Self::update_subscription(&mut tx, sub).await?;
        }
        for sub in &write.inserted_subscriptions {
            Self::insert_subscription(&mut tx, sub).await?;
        }
        for payment in &write.payments {
            Self::upsert_payment(&mut tx, payment).await?;
        }
        for refund in &write.refunds {
            Self::upsert_refund(&mut tx, refund).await?;
        }

        if let Some(update) = write.projection {
            let rows_affected = sqlx::query(
                r#"
                UPDATE users SET
                    subscription_tier = $2,
                    subscription_expires_at = $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(update.user_id)
            .bind(update.tier.as_str())
            .bind(update.expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?
            .rows_affected();
            if rows_affected == 0 {
                return Err(BillingError::NotFound(format!("User {}", update.user_id)));
            }
        }

        if let Some(user_id) = write.claim_trial {
            let rows_affected = sqlx::query(
                "UPDATE users SET trial_used = TRUE, updated_at = NOW() WHERE id = $1 AND trial_used = FALSE",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?
            .rows_affected();
            if rows_affected == 0 {
                return Err(BillingError::TrialAlreadyUsed);
            }
        }

        if let Some((user_id, period_start)) = write.reset_usage {
            sqlx::query("UPDATE usage_tracking SET count = 0 WHERE user_id = $1 AND period_start = $2")
                .bind(user_id)
                .bind(period_start)
                .execute(&mut *tx)
                .await
                .map_err(|e| BillingError::Database(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }

    async fn increment_usage(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period: (DateTime<Utc>, DateTime<Utc>),
        limit: Option<i64>,
    ) -> BillingResult<Option<i64>> {
        if limit.is_some_and(|l| l <= 0) {
            return Ok(None);
        }

        let count: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO usage_tracking (user_id, usage_type, period_start, period_end, count)
            VALUES ($1, $2, $3, $4, 1)
            ON CONFLICT (user_id, usage_type, period_start) DO UPDATE SET
                count = usage_tracking.count + 1
            WHERE $5::BIGINT IS NULL OR usage_tracking.count < $5
            RETURNING count
            "#,
        )
        .bind(user_id)
        .bind(usage_type.as_str())
        .bind(period.0)
        .bind(period.1)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(count)
    }

    async fn usage_count(
        &self,
        user_id: Uuid,
        usage_type: UsageType,
        period_start: DateTime<Utc>,
    ) -> BillingResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM usage_tracking WHERE user_id = $1 AND usage_type = $2 AND period_start = $3",
        )
        .bind(user_id)
        .bind(usage_type.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(count.unwrap_or(0))
    }

    async fn claim_transmission(
        &self,
        transmission_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<bool> {
        // INSERT...ON CONFLICT...RETURNING: only one concurrent caller gets a row back.
        // Failed or long-stuck transmissions may be re-claimed.
        let stuck_before = now - Duration::minutes(TRANSMISSION_PROCESSING_TIMEOUT_MINUTES);
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_transmissions
                (transmission_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', $3)
            ON CONFLICT (transmission_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = $3,
                error_message = NULL
            WHERE webhook_transmissions.processing_result = 'error'
               OR (webhook_transmissions.processing_result = 'processing'
                   AND webhook_transmissions.processing_started_at < $4)
            RETURNING transmission_id
            "#,
        )
        .bind(transmission_id)
        .bind(event_type)
        .bind(now)
        .bind(stuck_before)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                transmission_id = %transmission_id,
                error = %e,
                "Failed to claim webhook transmission"
            );
            BillingError::Database(e.to_string())
        })?;

        Ok(claimed.is_some())
    }

    async fn finish_transmission(
        &self,
        transmission_id: &str,
        outcome: Result<(), String>,
    ) -> BillingResult<()> {
        let (result, error_message) = match outcome {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e)),
        };
        sqlx::query(
            r#"
            UPDATE webhook_transmissions
            SET processing_result = $2, error_message = $3
            WHERE transmission_id = $1
            "#,
        )
        .bind(transmission_id)
        .bind(result)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(|e| BillingError::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_column_rejects_unknown_status() {
        let parsed: BillingResult<SubscriptionStatus> = parse_column("ACTIVE");
        assert_eq!(parsed.unwrap(), SubscriptionStatus::Active);

        let bad: BillingResult<SubscriptionStatus> = parse_column("active");
        assert!(matches!(bad, Err(BillingError::Database(_))));
    }

    #[test]
    fn test_subscription_row_conversion() {
        let now = Utc::now();
        let row = SubscriptionRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            tier: "BASIC".to_string(),
            status: "PAST_DUE".to_string(),
            billing_interval: "YEARLY".to_string(),
            gateway_charge_ref: Some("pk_1".to_string()),
            current_period_start: now,
            current_period_end: now,
            cancel_at: None,
            canceled_at: None,
            payment_retry_count: 2,
            last_payment_error: Some("잔액 부족".to_string()),
            is_trial: false,
            trial_started_at: None,
            trial_ends_at: None,
            trial_converted: false,
            trial_ending_notified: false,
            version: 7,
            created_at: now,
            updated_at: now,
        };
        let sub = Subscription::try_from(row).unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PastDue);
        assert_eq!(sub.interval, clinicpay_shared::BillingInterval::Yearly);
        assert_eq!(sub.version, 7);
    }
}
