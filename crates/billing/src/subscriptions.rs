//! Subscription store
//!
//! Authoritative row per subscription. Lifecycle is ACTIVE then CANCELED,
//! terminal; rows are never deleted. At most one ACTIVE row per customer,
//! converged by the reconciler's auto-cancel step rather than a database
//! constraint, because an upgrade intentionally creates a second ACTIVE row
//! for a moment before the superseded one is canceled.

use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use loopsync_shared::{AccountType, SubscriptionStatus};

use crate::client::RazorpayClient;
use crate::customers::CustomerDirectory;
use crate::error::{BillingError, BillingResult};
use crate::plans::{
    cycle_from_dates, expected_amount_paise, BillingCycle, PlanCatalog, PlanCode,
    TRIAL_WINDOW_DAYS,
};

pub const PROVIDER_RAZORPAY: &str = "RAZORPAY";

/// Calendar month arithmetic, clamping the day to the target month's length
/// (Jan 31 + 1 month = Feb 28/29). Falls back to 30-day steps if the computed
/// date is unrepresentable.
pub fn add_months(dt: OffsetDateTime, months: i32) -> OffsetDateTime {
    let month0 = dt.month() as i32 - 1 + months;
    let year = dt.year() + month0.div_euclid(12);
    let Ok(month) = time::Month::try_from((month0.rem_euclid(12) + 1) as u8) else {
        return dt + Duration::days(30 * i64::from(months));
    };
    let day = dt.day().min(time::util::days_in_year_month(year, month));
    match time::Date::from_calendar_date(year, month, day) {
        Ok(date) => dt.replace_date(date),
        Err(_) => dt + Duration::days(30 * i64::from(months)),
    }
}

/// Cycle end date: +1 calendar month or +1 calendar year from the start.
pub fn expires_for_cycle(start: OffsetDateTime, cycle: BillingCycle) -> OffsetDateTime {
    match cycle {
        BillingCycle::Monthly => add_months(start, 1),
        BillingCycle::Annual => add_months(start, 12),
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub auto_renew: bool,
    pub payment_provider: String,
    pub provider_subscription_id: Option<String>,
    pub provider_payment_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub cancel_at: Option<OffsetDateTime>,
}

impl SubscriptionRecord {
    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active.as_str()
    }

    pub fn derived_cycle(&self) -> BillingCycle {
        cycle_from_dates(self.started_at, self.expires_at)
    }

    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        let remaining = self.expires_at - now;
        if !remaining.is_positive() {
            return 0;
        }
        let whole = remaining.whole_days();
        if remaining - Duration::days(whole) > Duration::ZERO {
            whole + 1
        } else {
            whole
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, status, started_at, expires_at, \
     auto_renew, payment_provider, provider_subscription_id, provider_payment_id, cancel_at";

/// Detailed view of the active subscription for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: Uuid,
    pub plan_name: String,
    pub plan_code: String,
    pub plan_amount: i64,
    pub plan_currency: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub auto_renew: bool,
    pub billing_cycle: String,
    pub payment_provider: String,
    pub provider_subscription_id: Option<String>,
    pub provider_payment_id: Option<String>,
    pub is_free_trial: bool,
}

/// Local and provider-side mandate state for the autopay check.
#[derive(Debug, Clone, Serialize)]
pub struct AutopayStatus {
    pub has_active_local_subscription: bool,
    pub local: Option<AutopayLocal>,
    pub provider_status: Option<String>,
    pub is_autopay_cancelled: bool,
    pub should_restrict: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AutopayLocal {
    pub status: String,
    pub auto_renew: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub days_remaining: i64,
    pub plan_code: String,
    pub plan_name: String,
    pub is_free_trial: bool,
    pub provider_subscription_id: Option<String>,
}

#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    customers: CustomerDirectory,
    gateway: RazorpayClient,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, gateway: RazorpayClient) -> Self {
        let customers = CustomerDirectory::new(pool.clone());
        Self {
            pool,
            customers,
            gateway,
        }
    }

    fn plans(&self) -> PlanCatalog {
        PlanCatalog::new(self.pool.clone())
    }

    /// Create a one-time (non-recurring) subscription. Expiry follows the
    /// plan's stored billing cycle; the owning account becomes a customer.
    pub async fn create_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider: &str,
        provider_subscription_id: Option<&str>,
        provider_payment_id: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.plans().require_by_id(plan_id).await?;
        let started_at = OffsetDateTime::now_utc();
        let expires_at = expires_for_cycle(started_at, plan.cycle());

        let subscription = self
            .insert(
                user_id,
                plan_id,
                started_at,
                expires_at,
                provider,
                provider_subscription_id,
                provider_payment_id,
            )
            .await?;
        self.customers
            .set_account_type(user_id, AccountType::Customer)
            .await?;
        tracing::info!(
            %user_id,
            subscription_id = %subscription.id,
            plan = %plan.code,
            "Subscription created"
        );
        Ok(subscription)
    }

    /// Create a recurring subscription linked to a provider mandate. An
    /// explicit start date backdates or defers the validity window; the
    /// provider id doubles as the payment id for recurring rows.
    pub async fn create_recurring_subscription(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        provider_subscription_id: &str,
        start_date: Option<OffsetDateTime>,
        override_cycle: Option<BillingCycle>,
    ) -> BillingResult<SubscriptionRecord> {
        let plan = self.plans().require_by_id(plan_id).await?;
        let started_at = start_date.unwrap_or_else(OffsetDateTime::now_utc);
        let cycle = override_cycle.unwrap_or_else(|| plan.cycle());
        let expires_at = expires_for_cycle(started_at, cycle);

        let subscription = self
            .insert(
                user_id,
                plan_id,
                started_at,
                expires_at,
                PROVIDER_RAZORPAY,
                Some(provider_subscription_id),
                Some(provider_subscription_id),
            )
            .await?;
        self.customers
            .set_account_type(user_id, AccountType::Customer)
            .await?;
        tracing::info!(
            %user_id,
            subscription_id = %subscription.id,
            provider_subscription_id,
            cycle = %cycle,
            "Recurring subscription created"
        );
        Ok(subscription)
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert(
        &self,
        user_id: Uuid,
        plan_id: Uuid,
        started_at: OffsetDateTime,
        expires_at: OffsetDateTime,
        provider: &str,
        provider_subscription_id: Option<&str>,
        provider_payment_id: Option<&str>,
    ) -> BillingResult<SubscriptionRecord> {
        let subscription: SubscriptionRecord = sqlx::query_as(&format!(
            "INSERT INTO subscriptions
                 (user_id, plan_id, status, started_at, expires_at, auto_renew,
                  payment_provider, provider_subscription_id, provider_payment_id)
             VALUES ($1, $2, '{active}', $3, $4, TRUE, $5, $6, $7)
             RETURNING {SUBSCRIPTION_COLUMNS}",
            active = SubscriptionStatus::Active.as_str()
        ))
        .bind(user_id)
        .bind(plan_id)
        .bind(started_at)
        .bind(expires_at)
        .bind(provider)
        .bind(provider_subscription_id)
        .bind(provider_payment_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription)
    }

    pub async fn get_active(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE user_id = $1 AND status = '{active}'
             ORDER BY created_at DESC LIMIT 1",
            active = SubscriptionStatus::Active.as_str()
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    pub async fn find_by_provider_id(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE provider_subscription_id = $1"
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Any row linked to this provider id, or any row for the user. Used by
    /// the reconciler's upsert-by-provider-id step.
    pub async fn find_for_activation(
        &self,
        provider_subscription_id: &str,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let subscription: Option<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE provider_subscription_id = $1 OR user_id = $2
             ORDER BY (provider_subscription_id = $1) DESC, created_at DESC
             LIMIT 1"
        ))
        .bind(provider_subscription_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Reactivate an existing row and refresh its provider linkage. Safe
    /// under replay: all assignments are absolute.
    pub async fn mark_active(
        &self,
        subscription_id: Uuid,
        provider_subscription_id: &str,
        started_at: Option<OffsetDateTime>,
    ) -> BillingResult<SubscriptionRecord> {
        let subscription: SubscriptionRecord = sqlx::query_as(&format!(
            "UPDATE subscriptions
             SET status = '{active}',
                 provider_subscription_id = $2,
                 auto_renew = TRUE,
                 started_at = COALESCE($3, started_at),
                 updated_at = NOW()
             WHERE id = $1
             RETURNING {SUBSCRIPTION_COLUMNS}",
            active = SubscriptionStatus::Active.as_str()
        ))
        .bind(subscription_id)
        .bind(provider_subscription_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(subscription)
    }

    /// Cancel locally and best-effort on the provider. The provider call
    /// failing never blocks the local transition.
    pub async fn cancel(&self, subscription_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let subscription = self
            .find_by_id(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotFound(subscription_id.to_string()))?;

        if let Some(provider_id) = subscription.provider_subscription_id.as_deref() {
            if let Err(e) = self.gateway.cancel_subscription(provider_id, false).await {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    provider_subscription_id = provider_id,
                    error = %e,
                    "Provider-side cancel failed, cancelling locally anyway"
                );
            }
        }
        self.cancel_local(subscription_id).await
    }

    /// Local CANCELED transition only; used when the provider already knows
    /// (webhook-driven cancellation).
    pub async fn cancel_local(&self, subscription_id: Uuid) -> BillingResult<SubscriptionRecord> {
        let subscription: SubscriptionRecord = sqlx::query_as(&format!(
            "UPDATE subscriptions
             SET status = '{canceled}', cancel_at = NOW(), updated_at = NOW()
             WHERE id = $1
             RETURNING {SUBSCRIPTION_COLUMNS}",
            canceled = SubscriptionStatus::Canceled.as_str()
        ))
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await?;
        tracing::info!(subscription_id = %subscription_id, "Subscription cancelled");
        Ok(subscription)
    }

    /// Cancel every other ACTIVE row for the customer, provider-side best
    /// effort then local. This is the convergence step that keeps one ACTIVE
    /// row per customer after an upgrade.
    pub async fn cancel_other_active(&self, user_id: Uuid, keep_id: Uuid) -> BillingResult<()> {
        let others: Vec<SubscriptionRecord> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
             WHERE user_id = $1 AND status = '{active}' AND id <> $2",
            active = SubscriptionStatus::Active.as_str()
        ))
        .bind(user_id)
        .bind(keep_id)
        .fetch_all(&self.pool)
        .await?;

        for prev in others {
            if let Some(provider_id) = prev.provider_subscription_id.as_deref() {
                if let Err(e) = self.gateway.cancel_subscription(provider_id, false).await {
                    tracing::warn!(
                        subscription_id = %prev.id,
                        provider_subscription_id = provider_id,
                        error = %e,
                        "Provider cancel of superseded subscription failed"
                    );
                }
            }
            self.cancel_local(prev.id).await?;
            tracing::info!(
                %user_id,
                superseded = %prev.id,
                kept = %keep_id,
                "Superseded subscription cancelled"
            );
        }
        Ok(())
    }

    /// Trial window check: PRO plan, trial claimed for the email, and within
    /// the window of the start date.
    async fn is_free_trial(
        &self,
        plan_code: &str,
        email: &str,
        started_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        if PlanCode::from_code(plan_code) != Some(PlanCode::Pro) {
            return Ok(false);
        }
        let used: Option<bool> =
            sqlx::query_scalar("SELECT is_used FROM eligible_emails WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        if used != Some(true) {
            return Ok(false);
        }
        Ok(OffsetDateTime::now_utc() - started_at <= Duration::days(TRIAL_WINDOW_DAYS))
    }

    /// Detailed active-subscription DTO, with the cycle and amount re-derived
    /// from the validity window and the authoritative price table.
    pub async fn active_subscription_view(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<SubscriptionView>> {
        let Some(subscription) = self.get_active(user_id).await? else {
            return Ok(None);
        };
        let plan = self.plans().require_by_id(subscription.plan_id).await?;
        let user = self.customers.require_by_id(user_id).await?;

        let cycle = subscription.derived_cycle();
        let is_free_trial = self
            .is_free_trial(&plan.code, &user.email, subscription.started_at)
            .await?;

        Ok(Some(SubscriptionView {
            id: subscription.id,
            user_id: subscription.user_id,
            plan_id: subscription.plan_id,
            plan_name: plan.display_name(),
            plan_code: plan.code.clone(),
            plan_amount: plan.amount_for_cycle(cycle),
            plan_currency: plan.currency,
            status: subscription.status,
            started_at: subscription.started_at,
            expires_at: subscription.expires_at,
            auto_renew: subscription.auto_renew,
            billing_cycle: cycle.as_str().to_string(),
            payment_provider: subscription.payment_provider,
            provider_subscription_id: subscription.provider_subscription_id,
            provider_payment_id: subscription.provider_payment_id,
            is_free_trial,
        }))
    }

    /// Compare the local row against the provider's view of the mandate. The
    /// restriction flag is set when there is no local ACTIVE row or the
    /// provider reports the mandate terminated.
    pub async fn verify_autopay_status(&self, user_id: Uuid) -> BillingResult<AutopayStatus> {
        let Some(subscription) = self.get_active(user_id).await? else {
            return Ok(AutopayStatus {
                has_active_local_subscription: false,
                local: None,
                provider_status: None,
                is_autopay_cancelled: false,
                should_restrict: true,
            });
        };
        let plan = self.plans().require_by_id(subscription.plan_id).await?;
        let user = self.customers.require_by_id(user_id).await?;
        let is_free_trial = self
            .is_free_trial(&plan.code, &user.email, subscription.started_at)
            .await?;

        let mut provider_status = None;
        let mut is_autopay_cancelled = false;
        if let Some(provider_id) = subscription.provider_subscription_id.as_deref() {
            match self.gateway.fetch_subscription(provider_id).await {
                Ok(remote) => {
                    is_autopay_cancelled = remote.is_terminated();
                    provider_status = remote.status;
                }
                Err(e) => {
                    tracing::warn!(
                        provider_subscription_id = provider_id,
                        error = %e,
                        "Provider subscription fetch failed during autopay check"
                    );
                }
            }
        }

        Ok(AutopayStatus {
            has_active_local_subscription: true,
            local: Some(AutopayLocal {
                status: subscription.status.clone(),
                auto_renew: subscription.auto_renew,
                started_at: subscription.started_at,
                expires_at: subscription.expires_at,
                days_remaining: subscription.days_remaining(OffsetDateTime::now_utc()),
                plan_code: plan.code,
                plan_name: plan.name,
                is_free_trial,
                provider_subscription_id: subscription.provider_subscription_id.clone(),
            }),
            provider_status,
            is_autopay_cancelled,
            should_restrict: is_autopay_cancelled,
        })
    }
}

/// Expected charge for an upgrade target, falling back for codes outside the
/// price table: annual price approximates twelve months less a 10% discount.
pub fn upgrade_amount_paise(code: &str, cycle: BillingCycle, base_price: i64) -> i64 {
    match PlanCode::from_code(code) {
        Some(plan) => expected_amount_paise(plan, cycle),
        None => match cycle {
            BillingCycle::Monthly => base_price,
            BillingCycle::Annual => ((base_price as f64) * 12.0 * 0.9).round() as i64,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_add_months_clamps_day() {
        let jan31 = datetime!(2026-01-31 10:00 UTC);
        assert_eq!(add_months(jan31, 1).date(), time::macros::date!(2026 - 02 - 28));

        let leap = datetime!(2024-01-31 10:00 UTC);
        assert_eq!(add_months(leap, 1).date(), time::macros::date!(2024 - 02 - 29));
    }

    #[test]
    fn test_add_months_crosses_year() {
        let dec = datetime!(2026-12-15 00:00 UTC);
        assert_eq!(add_months(dec, 1).date(), time::macros::date!(2027 - 01 - 15));
    }

    #[test]
    fn test_expires_for_cycle() {
        let start = datetime!(2026-03-10 08:30 UTC);
        assert_eq!(
            expires_for_cycle(start, BillingCycle::Monthly).date(),
            time::macros::date!(2026 - 04 - 10)
        );
        assert_eq!(
            expires_for_cycle(start, BillingCycle::Annual).date(),
            time::macros::date!(2027 - 03 - 10)
        );
    }

    #[test]
    fn test_days_remaining_rounds_up_partial_days() {
        let now = datetime!(2026-06-01 12:00 UTC);
        let record = SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            status: SubscriptionStatus::Active.as_str().to_string(),
            started_at: datetime!(2026-05-17 00:00 UTC),
            expires_at: datetime!(2026-06-16 00:00 UTC),
            auto_renew: true,
            payment_provider: PROVIDER_RAZORPAY.to_string(),
            provider_subscription_id: None,
            provider_payment_id: None,
            cancel_at: None,
        };
        // 14.5 days left counts as 15
        assert_eq!(record.days_remaining(now), 15);
        assert_eq!(record.days_remaining(datetime!(2026-07-01 00:00 UTC)), 0);
    }

    #[test]
    fn test_upgrade_amount_known_and_fallback() {
        assert_eq!(
            upgrade_amount_paise("PRO", BillingCycle::Annual, 75_900),
            739_900
        );
        // Unknown code: monthly uses the stored price, annual applies the
        // 12-months-less-10% fallback
        assert_eq!(upgrade_amount_paise("TEAM", BillingCycle::Monthly, 50_000), 50_000);
        assert_eq!(
            upgrade_amount_paise("TEAM", BillingCycle::Annual, 50_000),
            540_000
        );
    }
}
