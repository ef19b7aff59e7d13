//! Cron wiring for the billing sweeps
//!
//! Every trigger fires in the billing timezone (KST). The expressions use the
//! six-field form with a leading seconds column.

use clinicpay_billing::{InvariantChecker, SweepKind, SweepService};
use clinicpay_shared::billing_tz;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};

pub const SWEEP_KINDS: [SweepKind; 5] = [
    SweepKind::Renewal,
    SweepKind::Expiry,
    SweepKind::TrialExpiry,
    SweepKind::TrialNotice,
    SweepKind::Retry,
];

/// Nightly consistency report, after the midnight sweeps have settled
pub const DEFAULT_INVARIANT_CRON: &str = "0 30 3 * * *";
pub const INVARIANT_CRON_ENV: &str = "BILLING_CRON_INVARIANTS";

pub fn default_cron(kind: SweepKind) -> &'static str {
    match kind {
        SweepKind::Renewal => "0 0 9 * * *",
        SweepKind::Expiry => "0 0 0 * * *",
        SweepKind::TrialExpiry => "0 5 0 * * *",
        SweepKind::TrialNotice => "0 0 10 * * *",
        SweepKind::Retry => "0 0 * * * *",
    }
}

pub fn cron_env_var(kind: SweepKind) -> &'static str {
    match kind {
        SweepKind::Renewal => "BILLING_CRON_RENEWAL",
        SweepKind::Expiry => "BILLING_CRON_EXPIRY",
        SweepKind::TrialExpiry => "BILLING_CRON_TRIAL_EXPIRY",
        SweepKind::TrialNotice => "BILLING_CRON_TRIAL_NOTICE",
        SweepKind::Retry => "BILLING_CRON_RETRY",
    }
}

/// One sweep and the cron expression that triggers it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSchedule {
    pub kind: SweepKind,
    pub cron: String,
}

fn cron_from_env(var: &str, default: &str) -> String {
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Sweep schedules with any environment overrides applied
pub fn sweep_schedules() -> Vec<SweepSchedule> {
    SWEEP_KINDS
        .iter()
        .map(|&kind| SweepSchedule {
            kind,
            cron: cron_from_env(cron_env_var(kind), default_cron(kind)),
        })
        .collect()
}

pub fn sweep_job(schedule: &SweepSchedule, sweeps: SweepService) -> Result<Job, JobSchedulerError> {
    let kind = schedule.kind;
    Job::new_async_tz(schedule.cron.as_str(), billing_tz(), move |_uuid, _l| {
        let sweeps = sweeps.clone();
        Box::pin(async move {
            info!(sweep = kind.as_str(), "Running scheduled billing sweep");
            match sweeps.run(kind).await {
                Ok(report) => {
                    if report.failed > 0 {
                        warn!(
                            sweep = kind.as_str(),
                            failed = report.failed,
                            "Billing sweep finished with failures"
                        );
                    }
                }
                Err(e) => error!(sweep = kind.as_str(), error = %e, "Billing sweep aborted"),
            }
        })
    })
}

pub fn invariant_job(cron: &str, checker: InvariantChecker) -> Result<Job, JobSchedulerError> {
    let checker = std::sync::Arc::new(checker);
    Job::new_async_tz(cron, billing_tz(), move |_uuid, _l| {
        let checker = checker.clone();
        Box::pin(async move {
            info!("Running billing invariant checks");
            match checker.run_all_checks().await {
                Ok(summary) => {
                    for violation in &summary.violations {
                        error!(
                            invariant = %violation.invariant,
                            severity = %violation.severity,
                            user_ids = ?violation.user_ids,
                            description = %violation.description,
                            "Billing invariant violated"
                        );
                    }
                }
                Err(e) => error!(error = %e, "Billing invariant checks failed"),
            }
        })
    })
}

/// Register every sweep (and the invariant report, when a checker is given)
pub async fn build_scheduler(
    sweeps: &SweepService,
    checker: Option<InvariantChecker>,
) -> Result<(JobScheduler, usize), JobSchedulerError> {
    let scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    for schedule in sweep_schedules() {
        scheduler.add(sweep_job(&schedule, sweeps.clone())?).await?;
        info!(
            sweep = schedule.kind.as_str(),
            cron = %schedule.cron,
            "Scheduled billing sweep (KST)"
        );
        jobs += 1;
    }

    if let Some(checker) = checker {
        let cron = cron_from_env(INVARIANT_CRON_ENV, DEFAULT_INVARIANT_CRON);
        scheduler.add(invariant_job(&cron, checker)?).await?;
        info!(cron = %cron, "Scheduled billing invariant checks (KST)");
        jobs += 1;
    }

    Ok((scheduler, jobs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use clinicpay_billing::testing::ScriptedGateway;
    use clinicpay_billing::{BillingService, InMemoryLedger, NoopNotifier, SystemClock, TossConfig};
    use serial_test::serial;

    fn sweeps() -> SweepService {
        BillingService::new(
            TossConfig {
                secret_key: "test_sk".to_string(),
                client_key: "test_ck".to_string(),
                api_base_url: "http://localhost".to_string(),
                timeout: Duration::from_millis(100),
                webhook_secret: None,
                require_webhook_signature: false,
            },
            Arc::new(InMemoryLedger::new()),
            Arc::new(ScriptedGateway::new()),
            Arc::new(NoopNotifier),
            Arc::new(SystemClock),
        )
        .sweeps
    }

    fn clear_env() {
        for kind in SWEEP_KINDS {
            std::env::remove_var(cron_env_var(kind));
        }
    }

    #[test]
    #[serial]
    fn test_default_schedules() {
        clear_env();
        let schedules = sweep_schedules();
        assert_eq!(schedules.len(), 5);

        let cron = |kind| {
            schedules
                .iter()
                .find(|s| s.kind == kind)
                .map(|s| s.cron.clone())
                .unwrap()
        };
        assert_eq!(cron(SweepKind::Renewal), "0 0 9 * * *");
        assert_eq!(cron(SweepKind::Expiry), "0 0 0 * * *");
        assert_eq!(cron(SweepKind::TrialExpiry), "0 5 0 * * *");
        assert_eq!(cron(SweepKind::TrialNotice), "0 0 10 * * *");
        assert_eq!(cron(SweepKind::Retry), "0 0 * * * *");
    }

    #[test]
    #[serial]
    fn test_env_override() {
        clear_env();
        std::env::set_var("BILLING_CRON_RETRY", " 0 */30 * * * * ");
        std::env::set_var("BILLING_CRON_RENEWAL", "   ");

        let schedules = sweep_schedules();
        let retry = schedules.iter().find(|s| s.kind == SweepKind::Retry).unwrap();
        assert_eq!(retry.cron, "0 */30 * * * *");
        let renewal = schedules
            .iter()
            .find(|s| s.kind == SweepKind::Renewal)
            .unwrap();
        assert_eq!(renewal.cron, "0 0 9 * * *");

        clear_env();
    }

    #[tokio::test]
    async fn test_every_default_cron_parses() {
        let sweeps = sweeps();
        for kind in SWEEP_KINDS {
            let schedule = SweepSchedule {
                kind,
                cron: default_cron(kind).to_string(),
            };
            assert!(sweep_job(&schedule, sweeps.clone()).is_ok(), "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_invalid_cron_is_rejected() {
        let schedule = SweepSchedule {
            kind: SweepKind::Renewal,
            cron: "every morning".to_string(),
        };
        assert!(sweep_job(&schedule, sweeps()).is_err());
    }
}
