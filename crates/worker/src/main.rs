// Worker clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! ClinicPay Background Worker
//!
//! Runs the scheduled billing sweeps (all triggers in KST):
//! - Renewal charges (daily at 09:00)
//! - Deferred-cancel expiry (daily at 00:00)
//! - Trial expiry (daily at 00:05)
//! - Trial-ending notices (daily at 10:00)
//! - Failed-payment retries (hourly)
//! - Ledger invariant report (daily at 03:30)

mod schedule;

use clinicpay_billing::{BillingService, InvariantChecker};
use clinicpay_shared::create_pool;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting ClinicPay Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&database_url).await?;

    let billing = BillingService::from_env(pool.clone())?;
    info!("Billing service initialized");

    let (mut scheduler, jobs) =
        schedule::build_scheduler(&billing.sweeps, Some(InvariantChecker::new(pool))).await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("ClinicPay Worker started with {} scheduled jobs", jobs);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;

    Ok(())
}
