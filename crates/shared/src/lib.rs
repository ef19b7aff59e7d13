#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ClinicPay shared types
//!
//! Domain enums and infrastructure helpers used by every crate in the workspace.

pub mod db;
pub mod time;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use time::{billing_tz, month_bounds, BILLING_UTC_OFFSET_HOURS};
pub use types::{BillingInterval, ParseEnumError, SubscriptionTier};
