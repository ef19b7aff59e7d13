//! API routes

mod subscription;
mod webhook;

#[cfg(test)]
mod route_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_user, state::AppState};

pub fn create_router(state: AppState) -> Router {
    // Routes behind the upstream identity header
    let user_routes = Router::new()
        .route("/subscription/info", get(subscription::subscription_info))
        .route("/subscription/usage", get(subscription::usage_summary))
        .route(
            "/subscription/register-card",
            post(subscription::register_card),
        )
        .route("/subscription/subscribe", post(subscription::subscribe))
        .route("/subscription/cancel", post(subscription::cancel))
        .route(
            "/subscription/cancel-immediately",
            post(subscription::cancel_immediately),
        )
        .route("/subscription/payments", get(subscription::payment_history))
        .route("/subscription/refund", post(subscription::request_refund))
        .route("/subscription/refunds", get(subscription::refund_history))
        .route("/subscription/trial/start", post(subscription::start_trial))
        .route("/subscription/trial/status", get(subscription::trial_status))
        .route_layer(middleware::from_fn(require_user));

    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/webhook/toss", post(webhook::toss_webhook))
        .route("/subscription/plans", get(subscription::list_plans))
        .route("/subscription/client-key", get(subscription::client_key));

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
