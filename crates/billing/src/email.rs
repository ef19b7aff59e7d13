//! Billing notifications
//!
//! Notices go out after the billing state they describe has been committed.
//! Delivery failures are logged and never roll anything back.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clinicpay_shared::{billing_tz, SubscriptionTier};
use serde::Serialize;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::error::{BillingError, BillingResult};
use crate::models::BillingAccount;

pub const DEFAULT_RESEND_API_URL: &str = "https://api.resend.com";
const DEFAULT_FROM: &str = "ClinicPay <billing@clinicpay.kr>";
const DEFAULT_APP_URL: &str = "https://clinicpay.kr";
const SEND_ATTEMPTS: usize = 3;

/// Something the user should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingNotice {
    TrialStarted {
        ends_at: DateTime<Utc>,
    },
    TrialEnding {
        days_remaining: i64,
        ends_at: DateTime<Utc>,
    },
    TrialExpired,
    PaymentFailed {
        reason: String,
        retry_count: i32,
    },
    SubscriptionRenewed {
        tier: SubscriptionTier,
        amount: i64,
        next_billing_date: DateTime<Utc>,
    },
    /// Canceled after exhausting payment retries
    SubscriptionCanceled {
        reason: String,
    },
}

impl BillingNotice {
    pub fn kind(&self) -> &'static str {
        match self {
            BillingNotice::TrialStarted { .. } => "trial_started",
            BillingNotice::TrialEnding { .. } => "trial_ending",
            BillingNotice::TrialExpired => "trial_expired",
            BillingNotice::PaymentFailed { .. } => "payment_failed",
            BillingNotice::SubscriptionRenewed { .. } => "subscription_renewed",
            BillingNotice::SubscriptionCanceled { .. } => "subscription_canceled",
        }
    }
}

/// Who receives a notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub email: String,
    pub name: String,
}

impl From<&BillingAccount> for Recipient {
    fn from(account: &BillingAccount) -> Self {
        Self {
            email: account.email.clone(),
            name: account.name.clone(),
        }
    }
}

#[async_trait]
pub trait BillingNotifier: Send + Sync {
    async fn notify(&self, recipient: &Recipient, notice: BillingNotice) -> BillingResult<()>;
}

/// Send a notice, logging instead of failing
pub async fn deliver(notifier: &dyn BillingNotifier, recipient: &Recipient, notice: BillingNotice) {
    let kind = notice.kind();
    if let Err(e) = notifier.notify(recipient, notice).await {
        tracing::warn!(
            to = %recipient.email,
            notice = kind,
            error = %e,
            "Failed to send billing notification"
        );
    }
}

/// Used when email is not configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

#[async_trait]
impl BillingNotifier for NoopNotifier {
    async fn notify(&self, recipient: &Recipient, notice: BillingNotice) -> BillingResult<()> {
        tracing::debug!(
            to = %recipient.email,
            notice = notice.kind(),
            "Email not configured, skipping billing notification"
        );
        Ok(())
    }
}

/// Keeps every notice in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(Recipient, BillingNotice)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Recipient, BillingNotice)> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|(_, n)| n.kind()).collect()
    }
}

#[async_trait]
impl BillingNotifier for RecordingNotifier {
    async fn notify(&self, recipient: &Recipient, notice: BillingNotice) -> BillingResult<()> {
        match self.sent.lock() {
            Ok(mut sent) => sent.push((recipient.clone(), notice)),
            Err(poisoned) => poisoned.into_inner().push((recipient.clone(), notice)),
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub api_url: String,
    pub from: String,
    pub app_url: String,
}

impl std::fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &"[REDACTED]")
            .field("api_url", &self.api_url)
            .field("from", &self.from)
            .field("app_url", &self.app_url)
            .finish()
    }
}

impl EmailConfig {
    /// `None` when `RESEND_API_KEY` is unset or empty
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("RESEND_API_KEY").ok().filter(|k| !k.is_empty())?;
        Some(Self {
            api_key,
            api_url: DEFAULT_RESEND_API_URL.to_string(),
            from: std::env::var("EMAIL_FROM").unwrap_or_else(|_| DEFAULT_FROM.to_string()),
            app_url: std::env::var("APP_URL").unwrap_or_else(|_| DEFAULT_APP_URL.to_string()),
        })
    }
}

#[derive(Debug, Serialize)]
struct ResendEmail<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

/// Rendered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailContent {
    pub subject: String,
    pub html: String,
}

fn kst_date(at: DateTime<Utc>) -> String {
    at.with_timezone(&billing_tz()).format("%Y년 %m월 %d일").to_string()
}

fn format_krw(amount: i64) -> String {
    let digits = amount.abs().to_string();
    let mut out = String::new();
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    if amount < 0 {
        out.insert(0, '-');
    }
    format!("{}원", out)
}

pub fn render(notice: &BillingNotice, recipient: &Recipient, app_url: &str) -> EmailContent {
    let billing_url = format!("{}/subscription", app_url);
    let (subject, body) = match notice {
        BillingNotice::TrialStarted { ends_at } => (
            "[ClinicPay] 무료 체험이 시작되었습니다".to_string(),
            format!(
                "<p>Professional 플랜 7일 무료 체험이 시작되었습니다.</p>\
                 <p>체험 종료일: {}</p>",
                kst_date(*ends_at)
            ),
        ),
        BillingNotice::TrialEnding {
            days_remaining,
            ends_at,
        } => (
            format!("[ClinicPay] 무료 체험이 {}일 후 종료됩니다", days_remaining),
            format!(
                "<p>무료 체험이 {}에 종료됩니다.</p>\
                 <p>계속 이용하시려면 <a href=\"{}\">구독을 시작</a>해 주세요.</p>",
                kst_date(*ends_at),
                billing_url
            ),
        ),
        BillingNotice::TrialExpired => (
            "[ClinicPay] 무료 체험이 종료되었습니다".to_string(),
            format!(
                "<p>무료 체험이 종료되어 Free 플랜으로 전환되었습니다.</p>\
                 <p><a href=\"{}\">플랜 보기</a></p>",
                billing_url
            ),
        ),
        BillingNotice::PaymentFailed {
            reason,
            retry_count,
        } => {
            let next_step = if *retry_count < crate::lifecycle::MAX_RETRY {
                format!(
                    "시스템에서 자동으로 결제를 재시도합니다. (재시도 {}/{}회)",
                    retry_count,
                    crate::lifecycle::MAX_RETRY
                )
            } else {
                "재시도 횟수를 초과했습니다. 카드 정보를 업데이트해 주세요.".to_string()
            };
            (
                "[ClinicPay] 결제 실패 알림".to_string(),
                format!(
                    "<p>구독 결제에 실패했습니다.</p><p>사유: {}</p><p>{}</p>\
                     <p><a href=\"{}\">결제 수단 관리</a></p>",
                    reason, next_step, billing_url
                ),
            )
        }
        BillingNotice::SubscriptionRenewed {
            tier,
            amount,
            next_billing_date,
        } => (
            "[ClinicPay] 구독이 갱신되었습니다".to_string(),
            format!(
                "<p>{} 플랜 구독이 갱신되었습니다.</p>\
                 <p>결제 금액: {}</p><p>다음 결제일: {}</p>",
                tier.display_name(),
                format_krw(*amount),
                kst_date(*next_billing_date)
            ),
        ),
        BillingNotice::SubscriptionCanceled { reason } => (
            "[ClinicPay] 구독이 해지되었습니다".to_string(),
            format!(
                "<p>결제 재시도가 모두 실패하여 구독이 해지되었습니다.</p>\
                 <p>마지막 실패 사유: {}</p>\
                 <p><a href=\"{}\">다시 구독하기</a></p>",
                reason, billing_url
            ),
        ),
    };

    EmailContent {
        subject,
        html: format!("<p>{}님, 안녕하세요.</p>{}", recipient.name, body),
    }
}

/// Sends notices through the Resend HTTP API
#[derive(Clone)]
pub struct EmailNotifier {
    http: reqwest::Client,
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BillingError::Config(format!("email http client: {}", e)))?;
        Ok(Self { http, config })
    }

    async fn send_once(&self, payload: &ResendEmail<'_>) -> Result<(), String> {
        let response = self
            .http
            .post(format!("{}/emails", self.config.api_url))
            .bearer_auth(&self.config.api_key)
            .json(payload)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("status {}: {}", status, body))
        }
    }
}

#[async_trait]
impl BillingNotifier for EmailNotifier {
    async fn notify(&self, recipient: &Recipient, notice: BillingNotice) -> BillingResult<()> {
        let content = render(&notice, recipient, &self.config.app_url);
        let payload = ResendEmail {
            from: &self.config.from,
            to: [recipient.email.as_str()],
            subject: &content.subject,
            html: &content.html,
        };

        let strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(SEND_ATTEMPTS - 1);

        Retry::start(strategy, || self.send_once(&payload))
            .await
            .map_err(BillingError::Notification)?;

        tracing::info!(
            to = %recipient.email,
            notice = notice.kind(),
            "Billing notification sent"
        );
        Ok(())
    }
}

/// Email when configured, otherwise a no-op
pub fn notifier_from_env() -> BillingResult<Arc<dyn BillingNotifier>> {
    match EmailConfig::from_env() {
        Some(config) => Ok(Arc::new(EmailNotifier::new(config)?)),
        None => {
            tracing::warn!("RESEND_API_KEY not set, billing emails disabled");
            Ok(Arc::new(NoopNotifier))
        }
    }
}
