//! Subscription routes

use axum::{
    extract::{Extension, Query, State},
    Json,
};
use clinicpay_billing::{
    BillingInterval, CardDetails, CardRegistration, PaymentPage, Plan, Refund, RefundResult,
    SubscribeResult, SubscriptionInfo, SubscriptionSummary, SubscriptionTier, TrialStarted,
    TrialStatus, UsageSummary,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::CurrentUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

const DEFAULT_REFUND_REASON: &str = "고객 요청";

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    pub tier: SubscriptionTier,
    #[serde(default)]
    pub interval: BillingInterval,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub payment_id: Uuid,
    pub reason: Option<String>,
    /// Omit for a full refund
    pub amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

/// GET /subscription/plans
pub async fn list_plans() -> Json<Vec<Plan>> {
    Json(clinicpay_billing::list_plans())
}

/// GET /subscription/client-key
pub async fn client_key(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "client_key": state.billing.subscriptions.client_key() }))
}

/// GET /subscription/info
pub async fn subscription_info(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<SubscriptionInfo>> {
    let info = state.billing.subscriptions.subscription_info(user_id).await?;
    Ok(Json(info))
}

/// GET /subscription/usage
pub async fn usage_summary(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<UsageSummary>> {
    let summary = state.billing.usage.usage_summary(user_id).await?;
    Ok(Json(summary))
}

/// POST /subscription/register-card
pub async fn register_card(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(card): Json<CardDetails>,
) -> ApiResult<Json<CardRegistration>> {
    if card.card_number.trim().is_empty() || card.expiry_year.trim().is_empty() {
        return Err(ApiError::Validation(
            "카드 번호와 유효기간을 입력해 주세요.".to_string(),
        ));
    }

    let registration = state
        .billing
        .subscriptions
        .register_card(user_id, &card)
        .await?;
    Ok(Json(registration))
}

/// POST /subscription/subscribe
pub async fn subscribe(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<SubscribeRequest>,
) -> ApiResult<Json<SubscribeResult>> {
    let result = state
        .billing
        .subscriptions
        .subscribe(user_id, req.tier, req.interval)
        .await?;
    Ok(Json(result))
}

/// POST /subscription/cancel
pub async fn cancel(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state.billing.subscriptions.cancel(user_id).await?;
    Ok(Json(summary))
}

/// POST /subscription/cancel-immediately
pub async fn cancel_immediately(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state
        .billing
        .subscriptions
        .cancel_immediately(user_id)
        .await?;
    Ok(Json(summary))
}

/// GET /subscription/payments
pub async fn payment_history(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<PaymentPage>> {
    let page = state
        .billing
        .history
        .payment_history(user_id, query.page, query.limit)
        .await?;
    Ok(Json(page))
}

/// POST /subscription/refund
pub async fn request_refund(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<RefundRequest>,
) -> ApiResult<Json<RefundResult>> {
    if matches!(req.amount, Some(amount) if amount <= 0) {
        return Err(ApiError::Validation(
            "환불 금액은 0보다 커야 합니다.".to_string(),
        ));
    }

    let reason = req
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REFUND_REASON);

    let result = state
        .billing
        .refunds
        .request_refund(user_id, req.payment_id, reason, req.amount)
        .await?;
    Ok(Json(result))
}

/// GET /subscription/refunds
pub async fn refund_history(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<Vec<Refund>>> {
    let refunds = state.billing.refunds.refund_history(user_id).await?;
    Ok(Json(refunds))
}

/// POST /subscription/trial/start
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<TrialStarted>> {
    let started = state.billing.trials.start_free_trial(user_id).await?;
    Ok(Json(started))
}

/// GET /subscription/trial/status
pub async fn trial_status(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> ApiResult<Json<TrialStatus>> {
    let status = state.billing.trials.trial_status(user_id).await?;
    Ok(Json(status))
}
