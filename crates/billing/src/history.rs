//! Payment history

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::Payment;
use crate::store::LedgerStore;

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct PaymentPage {
    pub payments: Vec<Payment>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

#[derive(Clone)]
pub struct BillingHistoryService {
    store: Arc<dyn LedgerStore>,
}

impl BillingHistoryService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Settled payments, newest first. `page` starts at 1.
    pub async fn payment_history(
        &self,
        user_id: Uuid,
        page: Option<i64>,
        limit: Option<i64>,
    ) -> BillingResult<PaymentPage> {
        let page = page.unwrap_or(1).max(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = (page - 1).saturating_mul(limit);

        let (payments, total) = self
            .store
            .payments_for_user(user_id, offset, limit)
            .await?;

        Ok(PaymentPage {
            payments,
            total,
            page,
            limit,
        })
    }
}
