//! Upgrade and proration
//!
//! Quotes the unused-time credit of the current cycle and starts the new
//! provider-side subscription. Floor at every step of the proration so the
//! platform never over-credits from rounding. Nothing is activated or
//! cancelled here: the new mandate converges through the webhook path once
//! its first charge succeeds.

use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::RazorpayClient;
use crate::error::BillingResult;
use crate::ledger::{CreditLedger, EntryType};
use crate::plans::{BillingCycle, PlanCatalog};
use crate::subscriptions::{upgrade_amount_paise, SubscriptionService};

/// Unused-time credit quote for the active subscription.
#[derive(Debug, Clone, Serialize)]
pub struct PrepaidCredit {
    pub credit_paise: i64,
    pub source_subscription_id: Option<String>,
    pub source_plan_code: Option<String>,
}

impl PrepaidCredit {
    fn zero() -> Self {
        Self {
            credit_paise: 0,
            source_subscription_id: None,
            source_plan_code: None,
        }
    }
}

/// Floor-everywhere proration: whole days left times the floored per-day
/// rate of the cycle price.
pub fn prorated_credit_paise(price_paise: i64, cycle_days: i64, days_left: i64) -> i64 {
    if cycle_days <= 0 || days_left <= 0 {
        return 0;
    }
    (price_paise / cycle_days) * days_left
}

/// Rollover amount in rupees. Paise convert without loss, so a sub-rupee
/// remainder is carried into the ledger rather than forfeited.
pub fn rollover_credit_rupees(credit_paise: i64) -> f64 {
    credit_paise.max(0) as f64 / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeQuote {
    pub provider_subscription_id: String,
    pub amount_paise: i64,
    pub currency: String,
    pub billing_cycle: String,
    pub is_recurring: bool,
}

pub struct UpgradeService {
    pool: PgPool,
    gateway: RazorpayClient,
    ledger: CreditLedger,
}

impl UpgradeService {
    pub fn new(pool: PgPool, gateway: RazorpayClient) -> Self {
        let ledger = CreditLedger::new(pool.clone());
        Self {
            pool,
            gateway,
            ledger,
        }
    }

    fn subscriptions(&self) -> SubscriptionService {
        SubscriptionService::new(self.pool.clone(), self.gateway.clone())
    }

    /// Credit for the unused remainder of the active cycle. Zero when there
    /// is no ACTIVE subscription or it has already lapsed.
    pub async fn compute_prepaid_credit(&self, user_id: Uuid) -> BillingResult<PrepaidCredit> {
        let Some(active) = self.subscriptions().get_active(user_id).await? else {
            return Ok(PrepaidCredit::zero());
        };
        let plan = PlanCatalog::new(self.pool.clone())
            .require_by_id(active.plan_id)
            .await?;

        let now = OffsetDateTime::now_utc();
        if active.expires_at <= now {
            return Ok(PrepaidCredit {
                credit_paise: 0,
                source_subscription_id: active.provider_subscription_id,
                source_plan_code: Some(plan.code),
            });
        }

        let days_left = (active.expires_at - now).whole_days().max(0);
        let cycle_days = plan.cycle().days();
        let credit_paise = prorated_credit_paise(plan.price, cycle_days, days_left);

        Ok(PrepaidCredit {
            credit_paise,
            source_subscription_id: active.provider_subscription_id,
            source_plan_code: Some(plan.code),
        })
    }

    /// Start the upgrade: create the provider-side plan, customer and
    /// subscription for the target cycle, and roll the proration credit
    /// into the prepaid ledger immediately. Activation of the new row and
    /// cancellation of the old one are deferred to the webhook path after
    /// the first charge succeeds.
    pub async fn create_upgrade_subscription(
        &self,
        user_id: Uuid,
        email: &str,
        contact: Option<&str>,
        new_plan_code: &str,
        billing_cycle: BillingCycle,
    ) -> BillingResult<UpgradeQuote> {
        let plan = PlanCatalog::new(self.pool.clone())
            .require_by_code(new_plan_code)
            .await?;
        let amount_paise = upgrade_amount_paise(&plan.code, billing_cycle, plan.price);

        let credit = self.compute_prepaid_credit(user_id).await?;
        let credit_rupees = rollover_credit_rupees(credit.credit_paise);

        let cycle_label = billing_cycle.gateway_interval();
        let name = format!("LoopSync {} {cycle_label}", plan.name);
        let description = format!("LoopSync {} subscription ({cycle_label})", plan.name);

        let gateway_plan = self
            .gateway
            .create_plan(
                &plan.id.to_string(),
                amount_paise,
                &plan.currency,
                cycle_label,
                &name,
                &description,
            )
            .await?;

        let mut customer_notes = HashMap::new();
        customer_notes.insert("userId".to_string(), user_id.to_string());
        let customer = self
            .gateway
            .create_customer(email, email, contact.unwrap_or(""), Some(&customer_notes))
            .await?;

        let mut notes = HashMap::new();
        notes.insert("planCode".to_string(), plan.code.clone());
        notes.insert("userId".to_string(), user_id.to_string());
        notes.insert(
            "upgradeFromSubscriptionId".to_string(),
            credit.source_subscription_id.clone().unwrap_or_default(),
        );
        notes.insert("billingCycle".to_string(), billing_cycle.as_str().to_string());
        notes.insert("creditRupees".to_string(), format!("{credit_rupees}"));

        // No start_at: the first charge happens immediately on authorization
        let subscription = self
            .gateway
            .create_subscription(&gateway_plan.id, Some(&customer.id), 1, Some(&notes), None, true)
            .await?;

        // Roll the unused-time credit into prepaid now, independent of the
        // new charge outcome; a failure here must not block the upgrade
        if credit_rupees > 0.0 {
            let reference = credit
                .source_subscription_id
                .as_deref()
                .unwrap_or("unknown");
            if let Err(e) = self
                .ledger
                .add_credits(
                    email,
                    EntryType::Prepaid,
                    (credit_rupees * 100.0).round(),
                    "UPGRADE_ROLLOVER",
                    reference,
                )
                .await
            {
                tracing::warn!(
                    %user_id,
                    email = %email,
                    credit_rupees,
                    error = %e,
                    "Upgrade rollover credit failed, upgrade proceeds"
                );
            }
        }

        tracing::info!(
            %user_id,
            plan = %plan.code,
            cycle = %billing_cycle,
            amount_paise,
            credit_paise = credit.credit_paise,
            provider_subscription_id = %subscription.id,
            "Upgrade subscription created"
        );

        Ok(UpgradeQuote {
            provider_subscription_id: subscription.id,
            amount_paise,
            currency: plan.currency,
            billing_cycle: billing_cycle.as_str().to_string(),
            is_recurring: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Scenario: 75900 paise over a 30-day cycle with 15 days left prices the
    // per-day rate at 2530 and the credit at 37950.
    #[test]
    fn test_prorated_credit_example() {
        assert_eq!(prorated_credit_paise(75_900, 30, 15), 37_950);
    }

    #[test]
    fn test_prorated_credit_floors_per_day() {
        // 100 / 30 floors to 3 per day, never 3.33
        assert_eq!(prorated_credit_paise(100, 30, 10), 30);
    }

    #[test]
    fn test_prorated_credit_zero_cases() {
        assert_eq!(prorated_credit_paise(75_900, 30, 0), 0);
        assert_eq!(prorated_credit_paise(75_900, 30, -3), 0);
        assert_eq!(prorated_credit_paise(75_900, 0, 10), 0);
    }

    #[test]
    fn test_prorated_credit_annual() {
        // 739900 / 365 = 2027 per day
        assert_eq!(prorated_credit_paise(739_900, 365, 100), 202_700);
    }

    #[test]
    fn test_rollover_keeps_sub_rupee_remainder() {
        assert_eq!(rollover_credit_rupees(37_999), 379.99);
        assert_eq!(rollover_credit_rupees(37_950), 379.5);
        assert_eq!(rollover_credit_rupees(-5), 0.0);
        // Converting back to paise for the ledger restores the exact credit
        assert_eq!((rollover_credit_rupees(37_999) * 100.0).round(), 37_999.0);
    }
}
