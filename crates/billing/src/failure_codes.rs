//! Gateway failure code catalog
//!
//! Maps the payment provider's error codes to user-facing messages and
//! retry/notify hints. Unknown codes fall back to a retryable generic failure.

use serde::Serialize;

/// Broad reason a payment failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// Card limits, expiry, loss, invalid billing key
    CardIssue,
    SystemError,
    UserInput,
    PolicyViolation,
    Unknown,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureCategory::CardIssue => "card_issue",
            FailureCategory::SystemError => "system_error",
            FailureCategory::UserInput => "user_input",
            FailureCategory::PolicyViolation => "policy_violation",
            FailureCategory::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Description of a gateway failure code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    pub code: &'static str,
    pub category: FailureCategory,
    pub user_message: &'static str,
    pub action_required: &'static str,
    pub retryable: bool,
    pub notify_user: bool,
}

pub const UNKNOWN_FAILURE: FailureInfo = FailureInfo {
    code: "UNKNOWN_ERROR",
    category: FailureCategory::Unknown,
    user_message: "결제 처리 중 오류가 발생했습니다.",
    action_required: "잠시 후 다시 시도해 주세요. 문제가 지속되면 고객센터에 문의해 주세요.",
    retryable: true,
    notify_user: true,
};

pub const TIMEOUT_FAILURE: FailureInfo = FailureInfo {
    code: "TIMEOUT",
    category: FailureCategory::SystemError,
    user_message: "결제 응답이 지연되고 있습니다.",
    action_required: "잠시 후 결제 내역을 확인해 주세요.",
    retryable: true,
    notify_user: false,
};

const fn info(
    code: &'static str,
    category: FailureCategory,
    user_message: &'static str,
    action_required: &'static str,
    retryable: bool,
    notify_user: bool,
) -> FailureInfo {
    FailureInfo {
        code,
        category,
        user_message,
        action_required,
        retryable,
        notify_user,
    }
}

use FailureCategory::*;

static CATALOG: &[FailureInfo] = &[
    info(
        "CARD_COMPANY_CHECK_FAILED",
        SystemError,
        "카드사 점검 중입니다.",
        "잠시 후 다시 시도해 주세요.",
        true,
        false,
    ),
    info(
        "EXCEED_MAX_CARD_INSTALLMENT_PLAN",
        PolicyViolation,
        "할부 개월 수 한도를 초과했습니다.",
        "할부 개월 수를 줄이거나 다른 카드를 사용해 주세요.",
        false,
        false,
    ),
    info(
        "NOT_SUPPORTED_INSTALLMENT_PLAN_CARD_OR_MERCHANT",
        PolicyViolation,
        "할부가 지원되지 않는 카드입니다.",
        "다른 카드를 사용하거나 일시불로 결제해 주세요.",
        false,
        false,
    ),
    info(
        "INVALID_CARD_EXPIRATION",
        CardIssue,
        "카드 유효기간이 만료되었습니다.",
        "유효한 카드 정보를 입력해 주세요.",
        false,
        true,
    ),
    info(
        "INVALID_STOPPED_CARD",
        CardIssue,
        "정지된 카드입니다.",
        "카드사에 문의하시거나 다른 카드를 사용해 주세요.",
        false,
        true,
    ),
    info(
        "EXCEED_MAX_DAILY_PAYMENT_COUNT",
        PolicyViolation,
        "일일 결제 횟수 한도를 초과했습니다.",
        "내일 다시 시도하시거나 다른 카드를 사용해 주세요.",
        false,
        false,
    ),
    info(
        "EXCEED_MAX_PAYMENT_AMOUNT",
        CardIssue,
        "결제 금액이 한도를 초과했습니다.",
        "카드 한도를 확인하시거나 다른 카드를 사용해 주세요.",
        false,
        true,
    ),
    info(
        "INVALID_CARD_LOST_OR_STOLEN",
        CardIssue,
        "분실 또는 도난 신고된 카드입니다.",
        "카드사에 문의해 주세요.",
        false,
        true,
    ),
    info(
        "RESTRICTED_CARD",
        CardIssue,
        "사용이 제한된 카드입니다.",
        "카드사에 문의하시거나 다른 카드를 사용해 주세요.",
        false,
        true,
    ),
    info(
        "INVALID_CARD_NUMBER",
        UserInput,
        "카드 번호가 올바르지 않습니다.",
        "카드 번호를 다시 확인해 주세요.",
        false,
        false,
    ),
    info(
        "INVALID_CARD_PASSWORD",
        UserInput,
        "카드 비밀번호가 올바르지 않습니다.",
        "비밀번호를 다시 확인해 주세요.",
        false,
        false,
    ),
    info(
        "NOT_ENOUGH_CARD_BALANCE",
        CardIssue,
        "카드 잔액이 부족합니다.",
        "카드 잔액을 확인하시거나 다른 카드를 사용해 주세요.",
        false,
        true,
    ),
    info(
        "INVALID_BILLING_KEY",
        CardIssue,
        "등록된 결제 수단이 유효하지 않습니다.",
        "결제 수단을 다시 등록해 주세요.",
        false,
        true,
    ),
    info(
        "BILLING_KEY_EXPIRED",
        CardIssue,
        "결제 수단이 만료되었습니다.",
        "새로운 결제 수단을 등록해 주세요.",
        false,
        true,
    ),
    info(
        "PROVIDER_ERROR",
        SystemError,
        "결제 처리 중 오류가 발생했습니다.",
        "잠시 후 다시 시도해 주세요.",
        true,
        false,
    ),
    info(
        "FAILED_INTERNAL_SYSTEM_PROCESSING",
        SystemError,
        "시스템 오류가 발생했습니다.",
        "잠시 후 다시 시도해 주세요. 문제가 지속되면 고객센터에 문의해 주세요.",
        true,
        false,
    ),
    info(
        "ALREADY_CANCELED_PAYMENT",
        PolicyViolation,
        "이미 취소된 결제입니다.",
        "결제 내역을 확인해 주세요.",
        false,
        false,
    ),
    info(
        "NOT_CANCELABLE_PAYMENT",
        PolicyViolation,
        "취소할 수 없는 결제입니다.",
        "고객센터에 문의해 주세요.",
        false,
        true,
    ),
    info(
        "EXCEED_CANCEL_AMOUNT",
        PolicyViolation,
        "환불 요청 금액이 결제 금액을 초과합니다.",
        "환불 금액을 확인해 주세요.",
        false,
        false,
    ),
    info(
        "INVALID_REQUEST",
        UserInput,
        "잘못된 요청입니다.",
        "입력 정보를 확인하고 다시 시도해 주세요.",
        false,
        false,
    ),
    info(
        "UNAUTHORIZED_KEY",
        PolicyViolation,
        "결제 시스템 인증 오류입니다.",
        "고객센터에 문의해 주세요.",
        false,
        true,
    ),
];

/// Look up a gateway error code
pub fn classify(code: &str) -> FailureInfo {
    if code == TIMEOUT_FAILURE.code {
        return TIMEOUT_FAILURE;
    }
    CATALOG
        .iter()
        .find(|entry| entry.code == code)
        .copied()
        .unwrap_or(UNKNOWN_FAILURE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_code_is_classified() {
        let info = classify("NOT_ENOUGH_CARD_BALANCE");
        assert_eq!(info.category, FailureCategory::CardIssue);
        assert!(!info.retryable);
        assert!(info.notify_user);
    }

    #[test]
    fn test_unknown_code_falls_back_to_retryable() {
        let info = classify("SOMETHING_NEW");
        assert_eq!(info.code, "UNKNOWN_ERROR");
        assert_eq!(info.category, FailureCategory::Unknown);
        assert!(info.retryable);
    }

    #[test]
    fn test_timeout_is_system_error() {
        let info = classify("TIMEOUT");
        assert_eq!(info.category, FailureCategory::SystemError);
        assert!(info.retryable);
    }

    #[test]
    fn test_catalog_codes_are_unique() {
        let mut codes: Vec<_> = CATALOG.iter().map(|e| e.code).collect();
        codes.sort_unstable();
        let before = codes.len();
        codes.dedup();
        assert_eq!(before, codes.len());
    }
}
