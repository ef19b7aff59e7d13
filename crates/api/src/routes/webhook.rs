//! Toss Payments webhook endpoint
//!
//! The body is taken as a raw string so the signature is checked against the
//! exact bytes that were signed.

use axum::{extract::State, http::HeaderMap, Json};
use clinicpay_billing::webhooks::{
    SIGNATURE_HEADER, TRANSMISSION_ID_HEADER, TRANSMISSION_TIME_HEADER,
};
use clinicpay_billing::{BillingError, WebhookOutcome};
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// POST /webhook/toss
pub async fn toss_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .billing
        .webhooks
        .handle(
            &body,
            header(&headers, SIGNATURE_HEADER),
            header(&headers, TRANSMISSION_TIME_HEADER),
            header(&headers, TRANSMISSION_ID_HEADER),
        )
        .await
        .map_err(|e| match e {
            // Bad signatures and malformed bodies stay 4xx
            e @ (BillingError::InvalidSignature | BillingError::InvalidRequest(_)) => {
                ApiError::Billing(e)
            }
            other => ApiError::WebhookProcessing(other),
        })?;

    let result = match outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored => "ignored",
    };
    Ok(Json(json!({ "success": true, "result": result })))
}
