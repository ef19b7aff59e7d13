//! Subscription tier and billing interval

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::time::billing_tz;

/// Error returned when a stored or external string is not a known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Service tier held on the user projection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Basic,
    Professional,
    Clinic,
}

impl SubscriptionTier {
    pub const ALL: [SubscriptionTier; 4] = [
        SubscriptionTier::Free,
        SubscriptionTier::Basic,
        SubscriptionTier::Professional,
        SubscriptionTier::Clinic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "FREE",
            SubscriptionTier::Basic => "BASIC",
            SubscriptionTier::Professional => "PROFESSIONAL",
            SubscriptionTier::Clinic => "CLINIC",
        }
    }

    /// Human-facing plan name
    pub fn display_name(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "Free",
            SubscriptionTier::Basic => "Basic",
            SubscriptionTier::Professional => "Professional",
            SubscriptionTier::Clinic => "Clinic",
        }
    }

    pub fn is_paid(&self) -> bool {
        !matches!(self, SubscriptionTier::Free)
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionTier {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FREE" => Ok(SubscriptionTier::Free),
            "BASIC" => Ok(SubscriptionTier::Basic),
            "PROFESSIONAL" => Ok(SubscriptionTier::Professional),
            "CLINIC" => Ok(SubscriptionTier::Clinic),
            _ => Err(ParseEnumError::new("subscription tier", s)),
        }
    }
}

/// How often a subscription is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingInterval {
    #[default]
    Monthly,
    Yearly,
}

impl BillingInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "MONTHLY",
            BillingInterval::Yearly => "YEARLY",
        }
    }

    /// Korean label used in order names
    pub fn label(&self) -> &'static str {
        match self {
            BillingInterval::Monthly => "월간",
            BillingInterval::Yearly => "연간",
        }
    }

    fn months(&self) -> u32 {
        match self {
            BillingInterval::Monthly => 1,
            BillingInterval::Yearly => 12,
        }
    }

    /// Advance `from` by one interval on the billing-timezone calendar.
    ///
    /// Month-end dates clamp (Jan 31 + 1 month = Feb 28/29).
    pub fn advance(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        let local = from.with_timezone(&billing_tz());
        match local.checked_add_months(Months::new(self.months())) {
            Some(next) => next.with_timezone(&Utc),
            None => match self {
                BillingInterval::Monthly => from + Duration::days(30),
                BillingInterval::Yearly => from + Duration::days(365),
            },
        }
    }
}

impl fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BillingInterval {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MONTHLY" => Ok(BillingInterval::Monthly),
            "YEARLY" | "ANNUAL" => Ok(BillingInterval::Yearly),
            _ => Err(ParseEnumError::new("billing interval", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tier_round_trips_through_str() {
        for tier in SubscriptionTier::ALL {
            assert_eq!(tier.as_str().parse::<SubscriptionTier>().unwrap(), tier);
        }
        assert_eq!(
            "professional".parse::<SubscriptionTier>().unwrap(),
            SubscriptionTier::Professional
        );
        assert!("ENTERPRISE".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_tier_serializes_uppercase() {
        let json = serde_json::to_string(&SubscriptionTier::Clinic).unwrap();
        assert_eq!(json, "\"CLINIC\"");
    }

    #[test]
    fn test_monthly_advance_is_one_calendar_month() {
        let start = Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap();
        let end = BillingInterval::Monthly.advance(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 4, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_advance_clamps_month_end() {
        // Jan 31 10:00 KST
        let start = Utc.with_ymd_and_hms(2026, 1, 31, 1, 0, 0).unwrap();
        let end = BillingInterval::Monthly.advance(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2026, 2, 28, 1, 0, 0).unwrap());
    }

    #[test]
    fn test_yearly_advance() {
        let start = Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap();
        let end = BillingInterval::Yearly.advance(start);
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_interval_accepts_annual_alias() {
        assert_eq!(
            "annual".parse::<BillingInterval>().unwrap(),
            BillingInterval::Yearly
        );
    }
}
