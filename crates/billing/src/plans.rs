//! Plan catalog and pricing (KRW, VAT included)

use clinicpay_shared::{BillingInterval, SubscriptionTier};
use serde::Serialize;

/// Length of the one-time free trial
pub const TRIAL_DAYS: i64 = 7;
/// Tier granted while trialing
pub const TRIAL_TIER: SubscriptionTier = SubscriptionTier::Professional;
/// Monthly AI query allowance while trialing
pub const TRIAL_AI_LIMIT: i64 = 30;

/// Price and allowance of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPrice {
    pub monthly: i64,
    pub yearly: i64,
    /// `None` means unlimited
    pub included_queries: Option<i64>,
    pub overage_price: i64,
}

pub fn price_of(tier: SubscriptionTier) -> PlanPrice {
    match tier {
        SubscriptionTier::Free => PlanPrice {
            monthly: 0,
            yearly: 0,
            included_queries: Some(10),
            overage_price: 0,
        },
        SubscriptionTier::Basic => PlanPrice {
            monthly: 19_900,
            yearly: 199_000,
            included_queries: Some(50),
            overage_price: 500,
        },
        SubscriptionTier::Professional => PlanPrice {
            monthly: 99_000,
            yearly: 990_000,
            included_queries: Some(300),
            overage_price: 300,
        },
        SubscriptionTier::Clinic => PlanPrice {
            monthly: 199_000,
            yearly: 1_990_000,
            included_queries: None,
            overage_price: 0,
        },
    }
}

/// Amount charged for one period
pub fn amount_for(tier: SubscriptionTier, interval: BillingInterval) -> i64 {
    let price = price_of(tier);
    match interval {
        BillingInterval::Monthly => price.monthly,
        BillingInterval::Yearly => price.yearly,
    }
}

pub fn order_name(tier: SubscriptionTier, interval: BillingInterval) -> String {
    format!(
        "ClinicPay {} 플랜 ({})",
        tier.display_name(),
        interval.label()
    )
}

/// Plan as shown on the pricing page
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    pub tier: SubscriptionTier,
    pub name: &'static str,
    pub description: &'static str,
    pub features: Vec<String>,
    pub monthly_price: i64,
    pub yearly_price: i64,
    /// -1 for unlimited
    pub ai_query_limit: i64,
    pub overage_price: i64,
    pub can_exceed: bool,
}

impl Plan {
    fn build(tier: SubscriptionTier, description: &'static str, features: Vec<String>) -> Self {
        let price = price_of(tier);
        Self {
            tier,
            name: tier.display_name(),
            description,
            features,
            monthly_price: price.monthly,
            yearly_price: price.yearly,
            ai_query_limit: price.included_queries.unwrap_or(-1),
            overage_price: price.overage_price,
            can_exceed: price.overage_price > 0,
        }
    }
}

pub fn list_plans() -> Vec<Plan> {
    let basic = price_of(SubscriptionTier::Basic);
    let professional = price_of(SubscriptionTier::Professional);

    vec![
        Plan::build(
            SubscriptionTier::Free,
            "학생/수련생을 위한 무료 플랜",
            vec![
                "AI 쿼리 10회/월".to_string(),
                "기본 검색 기능".to_string(),
                "커뮤니티 읽기".to_string(),
            ],
        ),
        Plan::build(
            SubscriptionTier::Basic,
            "개인 사용자를 위한 기본 플랜",
            vec![
                "AI 쿼리 50회/월 포함".to_string(),
                format!("초과 시 {}원/건", basic.overage_price),
                "전체 검색 기능".to_string(),
                "커뮤니티 참여".to_string(),
                "이메일 지원".to_string(),
            ],
        ),
        Plan::build(
            SubscriptionTier::Professional,
            "진료 중인 의료진을 위한 전문가 플랜",
            vec![
                "AI 쿼리 300회/월 포함".to_string(),
                format!("초과 시 {}원/건", professional.overage_price),
                "고급 분석 기능".to_string(),
                "처방 비교 무제한".to_string(),
                "우선 지원".to_string(),
            ],
        ),
        Plan::build(
            SubscriptionTier::Clinic,
            "의원 단위 운영을 위한 최상위 플랜",
            vec![
                "AI 쿼리 무제한".to_string(),
                "모든 기능 이용".to_string(),
                "다중 계정 지원".to_string(),
                "전담 지원".to_string(),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_table() {
        assert_eq!(amount_for(SubscriptionTier::Basic, BillingInterval::Monthly), 19_900);
        assert_eq!(amount_for(SubscriptionTier::Basic, BillingInterval::Yearly), 199_000);
        assert_eq!(
            amount_for(SubscriptionTier::Professional, BillingInterval::Monthly),
            99_000
        );
        assert_eq!(
            amount_for(SubscriptionTier::Clinic, BillingInterval::Yearly),
            1_990_000
        );
        assert_eq!(amount_for(SubscriptionTier::Free, BillingInterval::Monthly), 0);
    }

    #[test]
    fn test_order_name() {
        assert_eq!(
            order_name(SubscriptionTier::Professional, BillingInterval::Yearly),
            "ClinicPay Professional 플랜 (연간)"
        );
    }

    #[test]
    fn test_clinic_plan_is_unlimited() {
        let plans = list_plans();
        assert_eq!(plans.len(), 4);
        let clinic = plans
            .iter()
            .find(|p| p.tier == SubscriptionTier::Clinic)
            .unwrap();
        assert_eq!(clinic.ai_query_limit, -1);
        assert!(!clinic.can_exceed);
    }
}
