// Billing crate clippy configuration
#![allow(clippy::too_many_arguments)] // Some gateway operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! LoopSync Billing Module
//!
//! Handles Razorpay integration: credit ledger, subscription lifecycle,
//! webhook reconciliation, trial eligibility and upgrade proration.
//!
//! ## Features
//!
//! - **Credit Ledger**: Free and prepaid balances, metered consumption with
//!   trial-window ordering, append-only audit log
//! - **Subscription Store**: One ACTIVE row per customer, one-time and
//!   recurring mandates, best-effort provider cancellation
//! - **Webhook Reconciliation**: Idempotent handling of Razorpay events
//! - **Trial Eligibility**: One free trial per email, monotonic usage flag
//! - **Upgrades**: Unused-time proration rolled into prepaid credits
//! - **Email Notifications**: Payment success/failure, cancellation

pub mod client;
pub mod customers;
pub mod eligibility;
pub mod email;
pub mod error;
pub mod ledger;
pub mod plans;
pub mod subscriptions;
pub mod upgrade;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{
    GatewayCustomer, GatewayOrder, GatewayPayment, GatewayPlan, GatewaySubscription,
    RazorpayClient, RazorpayConfig,
};

// Customers
pub use customers::{CustomerDirectory, CustomerRecord};

// Eligibility
pub use eligibility::{EligibilityOracle, EligibleEmailRecord};

// Email
pub use email::{BillingEmailService, EmailConfig};

// Error
pub use error::{BillingError, BillingResult};

// Ledger
pub use ledger::{
    plan_consumption, plan_deduction, Balances, BillingOverview, ConsumptionPlan, CreditLedger,
    DeductFrom, DeductionPlan, Direction, EntrySource, EntryType, LedgerEntryRecord, UsageRecord,
};

// Plans
pub use plans::{
    cycle_from_dates, expected_amount_paise, infer_plan_from_amount, BillingCycle, PlanCatalog,
    PlanCode, PlanRecord, TRIAL_CHARGE_PAISE, TRIAL_WINDOW_DAYS,
};

// Subscriptions
pub use subscriptions::{
    add_months, expires_for_cycle, AutopayStatus, SubscriptionRecord, SubscriptionService,
    SubscriptionView,
};

// Upgrade
pub use upgrade::{
    prorated_credit_paise, rollover_credit_rupees, PrepaidCredit, UpgradeQuote, UpgradeService,
};

// Webhooks
pub use webhooks::{
    assess_activation, ActivationCheck, GatewayEvent, PaymentEntity, SubscriptionEntity,
    SubscriptionItem, WebhookHandler, WebhookOutcome,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub gateway: RazorpayClient,
    pub customers: CustomerDirectory,
    pub plans: PlanCatalog,
    pub ledger: CreditLedger,
    pub subscriptions: SubscriptionService,
    pub eligibility: EligibilityOracle,
    pub upgrade: UpgradeService,
    pub email: BillingEmailService,
    pub webhooks: WebhookHandler,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(RazorpayConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: RazorpayConfig, pool: PgPool) -> Self {
        let gateway = RazorpayClient::new(config);
        let email_service = BillingEmailService::from_env();

        Self {
            customers: CustomerDirectory::new(pool.clone()),
            plans: PlanCatalog::new(pool.clone()),
            ledger: CreditLedger::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone(), gateway.clone()),
            eligibility: EligibilityOracle::new(pool.clone()),
            upgrade: UpgradeService::new(pool.clone(), gateway.clone()),
            email: email_service.clone(),
            webhooks: WebhookHandler::new(pool, gateway.clone(), email_service),
            gateway,
        }
    }
}
