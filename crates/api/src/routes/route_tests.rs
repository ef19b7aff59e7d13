//! Router tests against the in-memory ledger and scripted gateway

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use clinicpay_billing::testing::{ScriptedCharge, ScriptedGateway};
use clinicpay_billing::webhooks::{
    SIGNATURE_HEADER, TRANSMISSION_ID_HEADER, TRANSMISSION_TIME_HEADER,
};
use clinicpay_billing::{
    BillingAccount, BillingService, InMemoryLedger, ManualClock, RecordingNotifier, TossConfig,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use crate::{auth::USER_ID_HEADER, config::Config, routes::create_router, state::AppState};

const WEBHOOK_SECRET: &str = "whsec_routes";

struct TestApp {
    router: Router,
    store: Arc<InMemoryLedger>,
    gateway: Arc<ScriptedGateway>,
}

fn test_app() -> TestApp {
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap(),
    ));
    let store = Arc::new(InMemoryLedger::with_clock(clock.clone()));
    let gateway = Arc::new(ScriptedGateway::new());
    let billing = BillingService::new(
        TossConfig {
            secret_key: "test_sk".to_string(),
            client_key: "test_ck_routes".to_string(),
            api_base_url: "http://localhost".to_string(),
            timeout: Duration::from_millis(100),
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            require_webhook_signature: false,
        },
        store.clone(),
        gateway.clone(),
        Arc::new(RecordingNotifier::new()),
        clock,
    );
    let config = Config {
        database_url: "postgres://localhost/clinicpay_test".to_string(),
        migration_database_url: None,
        bind_address: "127.0.0.1:0".to_string(),
        run_migrations: false,
        allowed_origins: vec![],
    };

    TestApp {
        router: create_router(AppState::new(config, billing)),
        store,
        gateway,
    }
}

impl TestApp {
    async fn user(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.store
            .insert_account(BillingAccount::new(user_id, "clinic@example.com", "서울치과"))
            .await;
        user_id
    }

    async fn call(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn get(&self, path: &str, user_id: Option<Uuid>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri(path);
        if let Some(id) = user_id {
            builder = builder.header(USER_ID_HEADER, id.to_string());
        }
        self.call(builder.body(Body::empty()).unwrap()).await
    }

    async fn post(&self, path: &str, user_id: Uuid, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header(USER_ID_HEADER, user_id.to_string())
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.call(request).await
    }

    async fn register_card(&self, user_id: Uuid) {
        let (status, _) = self
            .post(
                "/subscription/register-card",
                user_id,
                json!({
                    "card_number": "4330123412345678",
                    "expiry_year": "29",
                    "expiry_month": "12",
                    "card_password": "12",
                    "identity_number": "900101"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn webhook(&self, body: &str, headers: &[(&str, String)]) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("POST").uri("/webhook/toss");
        for (name, value) in headers {
            builder = builder.header(*name, value.as_str());
        }
        self.call(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }
}

fn sign(body: &str, time: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).unwrap();
    mac.update(body.as_bytes());
    mac.update(b":");
    mac.update(time.as_bytes());
    format!("v1:{}", BASE64.encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, body) = app.get("/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_public_routes_need_no_user() {
    let app = test_app();

    let (status, plans) = app.get("/subscription/plans", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(plans.as_array().is_some_and(|p| !p.is_empty()));

    let (status, body) = app.get("/subscription/client-key", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["client_key"], "test_ck_routes");
}

#[tokio::test]
async fn test_user_routes_require_user_header() {
    let app = test_app();

    let (status, body) = app.get("/subscription/info", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let request = Request::builder()
        .method("GET")
        .uri("/subscription/info")
        .header(USER_ID_HEADER, "clinic-42")
        .body(Body::empty())
        .unwrap();
    let (status, _) = app.call(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_subscribe_flow() {
    let app = test_app();
    let user_id = app.user().await;
    app.register_card(user_id).await;

    let (status, body) = app
        .post(
            "/subscription/subscribe",
            user_id,
            json!({ "tier": "PROFESSIONAL", "interval": "MONTHLY" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["subscription"]["status"], "ACTIVE");
    assert_eq!(app.gateway.charge_count(), 1);

    let (status, info) = app.get("/subscription/info", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["tier"], "PROFESSIONAL");
    assert_eq!(info["has_billing_key"], true);

    let (status, page) = app
        .get("/subscription/payments?page=1&limit=10", Some(user_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["total"], 1);

    // Subscribing again while ACTIVE replaces the plan
    let (status, body) = app
        .post(
            "/subscription/subscribe",
            user_id,
            json!({ "tier": "BASIC" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["subscription"]["tier"], "BASIC");
    assert_eq!(app.gateway.charge_count(), 2);

    let open: Vec<_> = app
        .store
        .subscriptions_for_user(user_id)
        .await
        .into_iter()
        .filter(|s| s.status.is_open())
        .collect();
    assert_eq!(open.len(), 1);

    let (_, info) = app.get("/subscription/info", Some(user_id)).await;
    assert_eq!(info["tier"], "BASIC");
}

#[tokio::test]
async fn test_subscribe_without_card_is_bad_request() {
    let app = test_app();
    let user_id = app.user().await;

    let (status, body) = app
        .post(
            "/subscription/subscribe",
            user_id,
            json!({ "tier": "BASIC" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "등록된 결제 수단이 없습니다.");
    assert_eq!(body["error"]["code"], "NO_BILLING_CREDENTIAL");
    assert_eq!(app.gateway.charge_count(), 0);
}

#[tokio::test]
async fn test_declined_charge_is_payment_required() {
    let app = test_app();
    let user_id = app.user().await;
    app.register_card(user_id).await;
    app.gateway
        .push(ScriptedCharge::rejected("REJECT_CARD_COMPANY"));

    let (status, body) = app
        .post(
            "/subscription/subscribe",
            user_id,
            json!({ "tier": "CLINIC", "interval": "YEARLY" }),
        )
        .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "REJECT_CARD_COMPANY");

    let (_, info) = app.get("/subscription/info", Some(user_id)).await;
    assert_eq!(info["tier"], "FREE");
}

#[tokio::test]
async fn test_cancel_then_cancel_immediately() {
    let app = test_app();
    let user_id = app.user().await;
    app.register_card(user_id).await;
    app.post(
        "/subscription/subscribe",
        user_id,
        json!({ "tier": "BASIC" }),
    )
    .await;

    let (status, body) = app
        .post("/subscription/cancel", user_id, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["cancel_at"].is_null());

    let (status, body) = app
        .post("/subscription/cancel-immediately", user_id, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "CANCELED");

    let (status, _) = app
        .post("/subscription/cancel", user_id, json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refund_full_payment() {
    let app = test_app();
    let user_id = app.user().await;
    app.register_card(user_id).await;
    let (_, subscribed) = app
        .post(
            "/subscription/subscribe",
            user_id,
            json!({ "tier": "BASIC" }),
        )
        .await;
    let payment_id = subscribed["payment_id"].clone();

    let (status, _) = app
        .post(
            "/subscription/refund",
            user_id,
            json!({ "payment_id": payment_id, "amount": 0 }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post(
            "/subscription/refund",
            user_id,
            json!({ "payment_id": payment_id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["amount"], subscribed["amount"]);
    assert_eq!(app.gateway.cancels().len(), 1);

    let (status, refunds) = app.get("/subscription/refunds", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refunds.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_trial_start_once() {
    let app = test_app();
    let user_id = app.user().await;

    let (status, body) = app
        .post("/subscription/trial/start", user_id, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "PROFESSIONAL");

    let (status, status_body) = app.get("/subscription/trial/status", Some(user_id)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(status_body["is_trialing"], true);
    assert_eq!(status_body["can_start_trial"], false);

    let (status, _) = app
        .post("/subscription/trial/start", user_id, json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_webhook_signature_and_duplicates() {
    let app = test_app();
    let body = r#"{"eventType":"DEPOSIT_CALLBACK","data":{}}"#;
    let time = "1767225600";

    let (status, _) = app
        .webhook(
            body,
            &[
                (SIGNATURE_HEADER, "v1:bm90LXRoZS1zaWduYXR1cmU=".to_string()),
                (TRANSMISSION_TIME_HEADER, time.to_string()),
            ],
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let headers = [
        (SIGNATURE_HEADER, sign(body, time)),
        (TRANSMISSION_TIME_HEADER, time.to_string()),
        (TRANSMISSION_ID_HEADER, "tx_routes_1".to_string()),
    ];
    let (status, first) = app.webhook(body, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["result"], "ignored");

    let (status, second) = app.webhook(body, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["result"], "duplicate");
}

#[tokio::test]
async fn test_webhook_malformed_body() {
    let app = test_app();
    let (status, _) = app.webhook("not json", &[]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_webhook_processing_failure_is_redelivered() {
    let app = test_app();
    let user_id = app.user().await;
    app.register_card(user_id).await;
    app.post(
        "/subscription/subscribe",
        user_id,
        json!({ "tier": "PROFESSIONAL" }),
    )
    .await;
    let payment_key = app.store.subscriptions_for_user(user_id).await[0]
        .gateway_charge_ref
        .clone()
        .unwrap();
    let body = format!(
        r#"{{"eventType":"PAYMENT_CANCELED","data":{{"paymentKey":"{}","status":"CANCELED"}}}}"#,
        payment_key
    );
    let headers = [(TRANSMISSION_ID_HEADER, "tx_routes_retry".to_string())];

    app.store.fail_next_commits(1);
    let (status, failed) = app.webhook(&body, &headers).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(failed["error"]["code"], "WEBHOOK_PROCESSING_FAILED");

    let (status, redelivered) = app.webhook(&body, &headers).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(redelivered["result"], "processed");

    let (_, info) = app.get("/subscription/info", Some(user_id)).await;
    assert_eq!(info["tier"], "FREE");
}
