// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries gateway errors with provider messages
#![allow(clippy::too_many_arguments)] // Payment rows are built from many gateway fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! ClinicPay Billing Module
//!
//! Recurring card billing on Toss Payments billing keys.
//!
//! ## Features
//!
//! - **Card Registration**: Exchange card details for a reusable billing key
//! - **Subscriptions**: Charge, renew, retry and cancel monthly or yearly plans
//! - **Sweeps**: Scheduled renewal, expiry, retry and trial passes
//! - **Free Trial**: One PROFESSIONAL trial per user, no card required
//! - **Webhooks**: Signed, deduplicated Toss Payments events
//! - **Refunds**: Full and partial refunds within the refund window
//! - **Usage Metering**: Monthly AI query quotas per plan
//! - **Email Notifications**: Trial, renewal, failure and cancel notices
//! - **Invariant Checks**: Read-only ledger consistency reports

pub mod charge;
pub mod client;
pub mod clock;
pub mod email;
pub mod error;
pub mod failure_codes;
pub mod gateway;
pub mod history;
pub mod invariants;
pub mod lifecycle;
pub mod locks;
pub mod models;
pub mod orders;
pub mod pg_store;
pub mod plans;
pub mod refund;
pub mod store;
pub mod subscriptions;
pub mod sweeps;
pub mod testing;
pub mod trial;
pub mod usage;
pub mod webhooks;


// Charge
pub use charge::{ChargeExecutor, ChargeOutcome, AUTO_REFUND_REASON};

// Client
pub use client::{TossClient, TossConfig};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Email
pub use email::{
    notifier_from_env, BillingNotice, BillingNotifier, EmailConfig, EmailNotifier, NoopNotifier,
    Recipient, RecordingNotifier,
};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    CancelReceipt, CardDetails, ChargeReceipt, ChargeRequest, GatewayError, GatewayPaymentStatus,
    IssuedBillingKey, PaymentGateway,
};

// History
pub use history::{BillingHistoryService, PaymentPage};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Lifecycle
pub use lifecycle::{LifecycleEvent, SubscriptionLifecycle, Transition, MAX_RETRY};

// Locks
pub use locks::{UserLockGuard, UserLocks};

// Models
pub use models::{
    BillingAccount, Payment, PaymentStatus, Refund, RefundStatus, StoredCard, Subscription,
    SubscriptionStatus, UsageType,
};

// Plans
pub use plans::{list_plans, Plan};

// Refund
pub use refund::{RefundResult, RefundService};

// Store
pub use pg_store::PgLedger;
pub use store::{InMemoryLedger, LedgerStore, LedgerWrite};

// Subscriptions
pub use subscriptions::{
    CardRegistration, SubscribeResult, SubscriptionInfo, SubscriptionService,
    SubscriptionSummary,
};

// Sweeps
pub use sweeps::{SweepKind, SweepReport, SweepService};

// Trial
pub use trial::{TrialManager, TrialStarted, TrialStatus};

// Usage
pub use usage::{UsageMeter, UsageSummary};

// Webhooks
pub use webhooks::{WebhookConfig, WebhookHandler, WebhookOutcome};

pub use clinicpay_shared::{BillingInterval, SubscriptionTier};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn LedgerStore>,
    pub subscriptions: SubscriptionService,
    pub sweeps: SweepService,
    pub webhooks: WebhookHandler,
    pub trials: TrialManager,
    pub refunds: RefundService,
    pub usage: UsageMeter,
    pub history: BillingHistoryService,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = TossConfig::from_env()?;
        let gateway: Arc<dyn PaymentGateway> = Arc::new(TossClient::new(config.clone())?);
        let store: Arc<dyn LedgerStore> = Arc::new(PgLedger::new(pool));
        let notifier = notifier_from_env()?;

        Ok(Self::new(config, store, gateway, notifier, Arc::new(SystemClock)))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        config: TossConfig,
        store: Arc<dyn LedgerStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn BillingNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let locks = UserLocks::new();
        let lifecycle = SubscriptionLifecycle::new(store.clone(), locks.clone(), clock.clone());
        let charges = ChargeExecutor::new(
            store.clone(),
            gateway.clone(),
            locks.clone(),
            clock.clone(),
            config.timeout,
        );

        Self {
            subscriptions: SubscriptionService::new(
                store.clone(),
                gateway.clone(),
                charges.clone(),
                lifecycle.clone(),
                config.client_key.clone(),
            ),
            sweeps: SweepService::new(
                store.clone(),
                charges.clone(),
                lifecycle.clone(),
                notifier.clone(),
                clock.clone(),
            ),
            webhooks: WebhookHandler::new(
                store.clone(),
                lifecycle,
                charges,
                clock.clone(),
                WebhookConfig {
                    secret: config.webhook_secret,
                    require_signature: config.require_webhook_signature,
                },
            ),
            trials: TrialManager::new(store.clone(), locks.clone(), clock.clone(), notifier),
            refunds: RefundService::new(store.clone(), gateway, locks, clock.clone()),
            usage: UsageMeter::new(store.clone(), clock),
            history: BillingHistoryService::new(store.clone()),
            store,
        }
    }
}
