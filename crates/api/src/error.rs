//! API error responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use clinicpay_billing::BillingError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error(transparent)]
    Billing(#[from] BillingError),
    /// Verified delivery that failed while being applied; the provider redelivers on 5xx
    #[error("webhook processing failed: {0}")]
    WebhookProcessing(BillingError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::WebhookProcessing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Billing(e) => match e {
                BillingError::InvalidSignature
                | BillingError::InvalidRequest(_)
                | BillingError::NoBillingCredential => StatusCode::BAD_REQUEST,
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::AlreadySubscribed
                | BillingError::TrialAlreadyUsed
                | BillingError::InvalidTransition { .. }
                | BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
                BillingError::ChargeFailed { .. }
                | BillingError::RefundFailed(_)
                | BillingError::MaxRetriesExceeded => StatusCode::PAYMENT_REQUIRED,
                BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
                BillingError::Database(_)
                | BillingError::Config(_)
                | BillingError::Notification(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Machine-readable error code; charge failures carry the gateway code
    pub fn code(&self) -> String {
        let code = match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::WebhookProcessing(_) => "WEBHOOK_PROCESSING_FAILED",
            ApiError::Billing(e) => match e {
                BillingError::ChargeFailed { code, .. } => return code.clone(),
                BillingError::NoBillingCredential => "NO_BILLING_CREDENTIAL",
                BillingError::InvalidSignature => "INVALID_SIGNATURE",
                BillingError::NotFound(_) => "NOT_FOUND",
                BillingError::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
                BillingError::TrialAlreadyUsed => "TRIAL_ALREADY_USED",
                BillingError::AlreadySubscribed => "ALREADY_SUBSCRIBED",
                BillingError::InvalidTransition { .. } => "INVALID_TRANSITION",
                BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
                BillingError::RefundFailed(_) => "REFUND_FAILED",
                BillingError::InvalidRequest(_) => "INVALID_REQUEST",
                BillingError::Gateway(_) => "GATEWAY_ERROR",
                BillingError::Database(_)
                | BillingError::Config(_)
                | BillingError::Notification(_) => "INTERNAL_ERROR",
            },
        };
        code.to_string()
    }

    /// Message safe to show the caller
    fn public_message(&self) -> String {
        match self {
            ApiError::Billing(BillingError::ChargeFailed { reason, .. }) => reason.clone(),
            ApiError::Billing(BillingError::NoBillingCredential) => {
                "등록된 결제 수단이 없습니다.".to_string()
            }
            ApiError::Billing(BillingError::TrialAlreadyUsed) => {
                "이미 무료 체험을 사용하셨습니다.".to_string()
            }
            ApiError::Billing(BillingError::AlreadySubscribed) => {
                "이미 구독 중입니다.".to_string()
            }
            _ if self.status().is_server_error() => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.public_message(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinicpay_billing::GatewayError;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::Unauthorized, StatusCode::UNAUTHORIZED),
            (
                BillingError::InvalidSignature.into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                BillingError::NotFound("x".into()).into(),
                StatusCode::NOT_FOUND,
            ),
            (BillingError::AlreadySubscribed.into(), StatusCode::CONFLICT),
            (BillingError::TrialAlreadyUsed.into(), StatusCode::CONFLICT),
            (
                BillingError::RefundFailed("window closed".into()).into(),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::ChargeFailed {
                    code: "REJECT_CARD_COMPANY".into(),
                    reason: "카드사 거절".into(),
                }
                .into(),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                BillingError::Gateway(GatewayError::Timeout).into(),
                StatusCode::BAD_GATEWAY,
            ),
            (
                BillingError::Database("down".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::WebhookProcessing(BillingError::NotFound("sub".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.status(), expected, "{:?}", error);
        }
    }

    #[test]
    fn test_server_errors_hide_details() {
        let error: ApiError = BillingError::Database("password=secret".into()).into();
        assert_eq!(error.public_message(), "Internal server error");
        assert_eq!(error.code(), "INTERNAL_ERROR");
    }

    #[test]
    fn test_charge_failure_carries_gateway_code() {
        let error: ApiError = BillingError::ChargeFailed {
            code: "EXCEED_MAX_AMOUNT".into(),
            reason: "한도를 초과했습니다.".into(),
        }
        .into();
        assert_eq!(error.code(), "EXCEED_MAX_AMOUNT");
        assert_eq!(error.public_message(), "한도를 초과했습니다.");
    }
}
