// API server clippy configuration
#![allow(clippy::result_large_err)] // ApiError wraps BillingError
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ClinicPay API Server
//!
//! HTTP surface for subscription billing: plans, card registration,
//! subscribe and cancel, refunds, usage, trials and the Toss Payments
//! webhook endpoint.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
