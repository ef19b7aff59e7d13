//! Toss Payments HTTP client
//!
//! Thin wrapper over the provider's REST API: billing-key issuance,
//! charge-by-billing-key and payment cancellation.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CancelReceipt, CardDetails, ChargeReceipt, ChargeRequest, GatewayError,
    GatewayPaymentStatus, IssuedBillingKey, PaymentGateway,
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.tosspayments.com/v1";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Gateway configuration
#[derive(Clone)]
pub struct TossConfig {
    pub secret_key: String,
    /// Publishable key for the front-end card widget
    pub client_key: String,
    pub api_base_url: String,
    pub timeout: Duration,
    /// Shared secret for webhook signatures
    pub webhook_secret: Option<String>,
    /// Reject webhook deliveries that carry no signature
    pub require_webhook_signature: bool,
}

impl std::fmt::Debug for TossConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TossConfig")
            .field("client_key", &self.client_key)
            .field("api_base_url", &self.api_base_url)
            .field("timeout", &self.timeout)
            .field("webhook_secret_set", &self.webhook_secret.is_some())
            .field("require_webhook_signature", &self.require_webhook_signature)
            .finish()
    }
}

impl TossConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("TOSS_SECRET_KEY")
            .map_err(|_| BillingError::Config("TOSS_SECRET_KEY not set".to_string()))?;
        if secret_key.trim().is_empty() {
            return Err(BillingError::Config("TOSS_SECRET_KEY is empty".to_string()));
        }

        let timeout_secs = std::env::var("TOSS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            secret_key,
            client_key: std::env::var("TOSS_CLIENT_KEY").unwrap_or_default(),
            api_base_url: std::env::var("TOSS_API_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
            timeout: Duration::from_secs(timeout_secs),
            webhook_secret: std::env::var("TOSS_WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            require_webhook_signature: std::env::var("TOSS_WEBHOOK_REQUIRE_SIGNATURE")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct IssueBillingKeyBody<'a> {
    customer_key: &'a str,
    card_number: &'a str,
    card_expiration_year: &'a str,
    card_expiration_month: &'a str,
    card_password: &'a str,
    customer_identity_number: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BillingKeyResponse {
    billing_key: String,
    card_company: Option<String>,
    card: Option<CardInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CardInfo {
    number: Option<String>,
    issuer_code: Option<String>,
    card_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChargeBody<'a> {
    customer_key: &'a str,
    amount: i64,
    order_id: &'a str,
    order_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_name: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResponse {
    payment_key: String,
    order_id: String,
    status: String,
    approved_at: Option<DateTime<chrono::FixedOffset>>,
    total_amount: Option<i64>,
    card: Option<CardInfo>,
    receipt: Option<ReceiptInfo>,
    #[serde(default)]
    cancels: Vec<CancelInfo>,
}

#[derive(Debug, Deserialize)]
struct ReceiptInfo {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelInfo {
    transaction_key: Option<String>,
    cancel_amount: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody<'a> {
    cancel_reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cancel_amount: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

/// Toss Payments API client
#[derive(Clone)]
pub struct TossClient {
    http: Client,
    config: TossConfig,
}

impl TossClient {
    pub fn new(config: TossConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(TossConfig::from_env()?)
    }

    pub fn config(&self) -> &TossConfig {
        &self.config
    }

    async fn post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
        idempotency_key: Option<&str>,
    ) -> Result<String, GatewayError> {
        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);

        let mut request = self
            .http
            .post(&url)
            .basic_auth(&self.config.secret_key, Option::<&str>::None)
            .json(body);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout
            } else {
                GatewayError::Http(e.to_string())
            }
        })?;

        tracing::debug!(path = %path, status = %status, "Toss API response");

        if status.is_success() {
            return Ok(text);
        }

        Err(parse_error_body(status, &text))
    }
}

fn parse_error_body(status: StatusCode, text: &str) -> GatewayError {
    match serde_json::from_str::<ErrorBody>(text) {
        Ok(body) => GatewayError::Rejected {
            code: body.code,
            message: body.message,
        },
        Err(_) => GatewayError::Rejected {
            code: if status.is_server_error() {
                "PROVIDER_ERROR".to_string()
            } else {
                "UNKNOWN_ERROR".to_string()
            },
            message: format!("HTTP {}", status.as_u16()),
        },
    }
}

fn decode<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, GatewayError> {
    serde_json::from_str(text).map_err(|e| GatewayError::Decode(e.to_string()))
}

#[async_trait]
impl PaymentGateway for TossClient {
    async fn issue_billing_key(
        &self,
        customer_key: &str,
        card: &CardDetails,
    ) -> Result<IssuedBillingKey, GatewayError> {
        let body = IssueBillingKeyBody {
            customer_key,
            card_number: &card.card_number,
            card_expiration_year: &card.expiry_year,
            card_expiration_month: &card.expiry_month,
            card_password: &card.card_password,
            customer_identity_number: &card.identity_number,
        };

        let text = self
            .post("/billing/authorizations/card", &body, None)
            .await?;
        let parsed: BillingKeyResponse = decode(&text)?;

        let (card_number, issuer_code, card_type) = match parsed.card {
            Some(card) => (card.number, card.issuer_code, card.card_type),
            None => (None, None, None),
        };

        tracing::info!(customer_key = %customer_key, "Billing key issued");

        Ok(IssuedBillingKey {
            billing_key: parsed.billing_key,
            card_company: parsed.card_company.or(issuer_code),
            card_number,
            card_type,
        })
    }

    async fn charge_billing_key(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeReceipt, GatewayError> {
        let body = ChargeBody {
            customer_key: &request.customer_key,
            amount: request.amount,
            order_id: &request.order_id,
            order_name: &request.order_name,
            customer_email: request.customer_email.as_deref(),
            customer_name: request.customer_name.as_deref(),
        };

        // Retried charges for the same order are answered from the provider's cache
        let path = format!("/billing/{}", request.billing_key);
        let text = self
            .post(&path, &body, Some(&request.order_id))
            .await?;
        let parsed: PaymentResponse = decode(&text)?;

        let (card_number, card_company) = match parsed.card {
            Some(card) => (card.number, card.issuer_code),
            None => (None, None),
        };

        Ok(ChargeReceipt {
            payment_key: parsed.payment_key,
            order_id: parsed.order_id,
            status: GatewayPaymentStatus::parse(&parsed.status),
            approved_at: parsed.approved_at.map(|t| t.with_timezone(&Utc)),
            total_amount: parsed.total_amount.unwrap_or(request.amount),
            card_company,
            card_number,
            receipt_url: parsed.receipt.and_then(|r| r.url),
        })
    }

    async fn cancel_payment(
        &self,
        payment_key: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<CancelReceipt, GatewayError> {
        let body = CancelBody {
            cancel_reason: reason,
            cancel_amount: amount,
        };

        let path = format!("/payments/{}/cancel", payment_key);
        let text = self.post(&path, &body, None).await?;
        let parsed: PaymentResponse = decode(&text)?;

        let last = parsed.cancels.last();
        Ok(CancelReceipt {
            payment_key: parsed.payment_key,
            status: GatewayPaymentStatus::parse(&parsed.status),
            refund_key: last.and_then(|c| c.transaction_key.clone()),
            canceled_amount: last
                .and_then(|c| c.cancel_amount)
                .or(amount)
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(url: &str) -> TossConfig {
        TossConfig {
            secret_key: "test_sk_123".to_string(),
            client_key: "test_ck_123".to_string(),
            api_base_url: url.to_string(),
            timeout: Duration::from_secs(5),
            webhook_secret: None,
            require_webhook_signature: false,
        }
    }

    fn charge_request() -> ChargeRequest {
        ChargeRequest {
            billing_key: "bk_1".to_string(),
            customer_key: "customer_abc".to_string(),
            amount: 99000,
            order_id: "order_abc_1".to_string(),
            order_name: "ClinicPay Professional 플랜 (월간)".to_string(),
            customer_email: Some("doctor@example.com".to_string()),
            customer_name: None,
        }
    }

    #[tokio::test]
    async fn test_charge_sends_basic_auth_and_parses_done() {
        let mut server = mockito::Server::new_async().await;
        // base64("test_sk_123:")
        let mock = server
            .mock("POST", "/billing/bk_1")
            .match_header("authorization", "Basic dGVzdF9za18xMjM6")
            .match_header("idempotency-key", "order_abc_1")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "customerKey": "customer_abc",
                "amount": 99000,
                "orderId": "order_abc_1",
            })))
            .with_status(200)
            .with_body(
                r#"{"paymentKey":"pk_1","orderId":"order_abc_1","status":"DONE",
                    "approvedAt":"2026-03-01T09:00:00+09:00","totalAmount":99000,
                    "card":{"number":"4330****5678","issuerCode":"61"},
                    "receipt":{"url":"https://receipt.example/1"}}"#,
            )
            .create_async()
            .await;

        let client = TossClient::new(config_for(&server.url())).unwrap();
        let receipt = client.charge_billing_key(&charge_request()).await.unwrap();

        mock.assert_async().await;
        assert!(receipt.is_done());
        assert_eq!(receipt.payment_key, "pk_1");
        assert_eq!(receipt.total_amount, 99000);
        assert_eq!(receipt.card_number.as_deref(), Some("4330****5678"));
        assert_eq!(receipt.receipt_url.as_deref(), Some("https://receipt.example/1"));
    }

    #[tokio::test]
    async fn test_charge_rejection_carries_gateway_code() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/billing/bk_1")
            .with_status(400)
            .with_body(r#"{"code":"NOT_ENOUGH_CARD_BALANCE","message":"잔액 부족"}"#)
            .create_async()
            .await;

        let client = TossClient::new(config_for(&server.url())).unwrap();
        let err = client.charge_billing_key(&charge_request()).await.unwrap_err();

        assert_eq!(err.code(), "NOT_ENOUGH_CARD_BALANCE");
    }

    #[tokio::test]
    async fn test_unparseable_server_error_maps_to_provider_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/billing/bk_1")
            .with_status(502)
            .with_body("<html>bad gateway</html>")
            .create_async()
            .await;

        let client = TossClient::new(config_for(&server.url())).unwrap();
        let err = client.charge_billing_key(&charge_request()).await.unwrap_err();

        assert_eq!(err.code(), "PROVIDER_ERROR");
    }

    #[tokio::test]
    async fn test_issue_billing_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/billing/authorizations/card")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "customerKey": "customer_abc",
                "cardExpirationYear": "29",
            })))
            .with_status(200)
            .with_body(
                r#"{"billingKey":"bk_new","cardCompany":"신한",
                    "card":{"number":"4330********5678","cardType":"신용"}}"#,
            )
            .create_async()
            .await;

        let client = TossClient::new(config_for(&server.url())).unwrap();
        let card = CardDetails {
            card_number: "4330123412345678".to_string(),
            expiry_year: "29".to_string(),
            expiry_month: "12".to_string(),
            card_password: "12".to_string(),
            identity_number: "900101".to_string(),
        };
        let issued = client.issue_billing_key("customer_abc", &card).await.unwrap();

        assert_eq!(issued.billing_key, "bk_new");
        assert_eq!(issued.card_company.as_deref(), Some("신한"));
        assert_eq!(issued.card_number.as_deref(), Some("4330********5678"));
    }

    #[tokio::test]
    async fn test_cancel_returns_last_transaction_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/payments/pk_1/cancel")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "cancelReason": "고객 요청",
                "cancelAmount": 5000,
            })))
            .with_status(200)
            .with_body(
                r#"{"paymentKey":"pk_1","orderId":"order_abc_1","status":"PARTIAL_CANCELED",
                    "cancels":[{"transactionKey":"tx_1","cancelAmount":1000},
                               {"transactionKey":"tx_2","cancelAmount":5000}]}"#,
            )
            .create_async()
            .await;

        let client = TossClient::new(config_for(&server.url())).unwrap();
        let receipt = client
            .cancel_payment("pk_1", "고객 요청", Some(5000))
            .await
            .unwrap();

        assert_eq!(receipt.refund_key.as_deref(), Some("tx_2"));
        assert_eq!(receipt.canceled_amount, 5000);
        assert_eq!(receipt.status, GatewayPaymentStatus::PartialCanceled);
    }

    #[test]
    #[serial_test::serial]
    fn test_config_from_env_defaults() {
        std::env::set_var("TOSS_SECRET_KEY", "sk_env");
        std::env::remove_var("TOSS_API_BASE_URL");
        std::env::remove_var("TOSS_TIMEOUT_SECS");
        std::env::remove_var("TOSS_WEBHOOK_SECRET");

        let config = TossConfig::from_env().unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(config.webhook_secret.is_none());

        std::env::remove_var("TOSS_SECRET_KEY");
        assert!(TossConfig::from_env().is_err());
    }
}
