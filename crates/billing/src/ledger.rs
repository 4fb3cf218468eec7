//! Credit ledger
//!
//! Owns the two per-customer balances (prepaid, free), the cumulative usage
//! counters and the append-only transaction log. Balances live as key/value
//! override rows and are a derived projection; the ledger table is the audit
//! record. All read-modify-write paths lock the override rows inside a
//! transaction so two concurrent debits cannot both pass the sufficiency
//! check against a stale balance.
//!
//! Deduction order is free-before-prepaid, with one exception: during an
//! active trial window prepaid is untouchable and consumption draws from
//! free only. The decision logic is kept in pure functions so that rule is
//! testable without a database.

use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use loopsync_shared::SubscriptionStatus;

use crate::customers::CustomerDirectory;
use crate::error::{BillingError, BillingResult};
use crate::plans::{cycle_from_dates, expected_amount_paise, PlanCode, TRIAL_WINDOW_DAYS};

pub const KEY_PREPAID: &str = "CREDITS_PREPAID";
pub const KEY_FREE: &str = "CREDITS_FREE";
pub const KEY_USAGE_USED: &str = "USAGE_USED";
pub const KEY_USAGE_PREPAID_USED: &str = "USAGE_PREPAID_USED";

const TRIAL_EXHAUSTED_MSG: &str =
    "Your 7-day free trial credits are exhausted. Please add more credits or wait until the trial period ends.";
const SUBSCRIPTION_EXHAUSTED_MSG: &str =
    "Your subscription credits are exhausted. Please add credits to continue.";

/// Round to 2 decimals. Applied only at the response boundary; internal
/// arithmetic stays unrounded so repeated operations do not drift.
pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Balances {
    pub prepaid: f64,
    pub free: f64,
}

impl Balances {
    pub fn rounded(self) -> Self {
        Self {
            prepaid: round2(self.prepaid),
            free: round2(self.free),
        }
    }

    pub fn total(&self) -> f64 {
        self.prepaid + self.free
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductFrom {
    Prepaid,
    Free,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Prepaid,
    Free,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Prepaid => "prepaid",
            EntryType::Free => "free",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Credit,
    Debit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Credit => "credit",
            Direction::Debit => "debit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Admin,
    System,
    Subscription,
}

impl EntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntrySource::Admin => "admin",
            EntrySource::System => "system",
            EntrySource::Subscription => "subscription",
        }
    }
}

/// Append-only ledger row.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LedgerEntryRecord {
    pub id: Uuid,
    pub email: String,
    pub entry_type: String,
    pub direction: String,
    pub amount: f64,
    pub reason: String,
    pub source: String,
    pub reference_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UsageRecord {
    pub id: Uuid,
    pub email: String,
    pub resource: String,
    pub cost: f64,
    pub request_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome of a planned deduction, before any write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeductionPlan {
    pub new_prepaid: f64,
    pub new_free: f64,
    pub entry_type: EntryType,
}

/// Plan a `deduct_credits` call against current balances.
///
/// `Prepaid`/`Free` fail hard when that specific pool cannot cover the
/// amount; `Auto` drains prepaid then free, clamping each at zero, and
/// succeeds even when the combined total falls short (admin-adjustment
/// path, distinct from metered consumption).
pub fn plan_deduction(
    balances: Balances,
    amount: f64,
    from: DeductFrom,
) -> Result<DeductionPlan, BillingError> {
    match from {
        DeductFrom::Prepaid => {
            if balances.prepaid <= 0.0 || balances.prepaid < amount {
                return Err(BillingError::InsufficientPrepaidCredits);
            }
            Ok(DeductionPlan {
                new_prepaid: balances.prepaid - amount,
                new_free: balances.free,
                entry_type: EntryType::Prepaid,
            })
        }
        DeductFrom::Free => {
            if balances.free <= 0.0 || balances.free < amount {
                return Err(BillingError::InsufficientFreeCredits);
            }
            Ok(DeductionPlan {
                new_prepaid: balances.prepaid,
                new_free: balances.free - amount,
                entry_type: EntryType::Free,
            })
        }
        DeductFrom::Auto => {
            let from_prepaid = balances.prepaid.min(amount).max(0.0);
            let remaining = amount - from_prepaid;
            let new_free = if remaining > 0.0 {
                (balances.free - remaining).max(0.0)
            } else {
                balances.free
            };
            Ok(DeductionPlan {
                new_prepaid: balances.prepaid - from_prepaid,
                new_free,
                entry_type: EntryType::Prepaid,
            })
        }
    }
}

/// Outcome of a planned consumption, before any write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumptionPlan {
    pub from_free: f64,
    pub from_prepaid: f64,
    pub new_prepaid: f64,
    pub new_free: f64,
}

/// Plan a metered `consume_credits` call.
///
/// In trial mode only the free pool is eligible; a shortfall fails without
/// touching prepaid. Otherwise the combined total must cover the cost, and
/// free drains before prepaid.
pub fn plan_consumption(
    balances: Balances,
    cost: f64,
    trial_mode: bool,
) -> Result<ConsumptionPlan, BillingError> {
    if trial_mode {
        if balances.free < cost {
            return Err(BillingError::UsageLimitReached {
                message: TRIAL_EXHAUSTED_MSG,
            });
        }
        return Ok(ConsumptionPlan {
            from_free: cost,
            from_prepaid: 0.0,
            new_prepaid: balances.prepaid,
            new_free: balances.free - cost,
        });
    }

    if balances.total() < cost {
        return Err(BillingError::UsageLimitReached {
            message: SUBSCRIPTION_EXHAUSTED_MSG,
        });
    }
    let from_free = balances.free.min(cost);
    let from_prepaid = cost - from_free;
    Ok(ConsumptionPlan {
        from_free,
        from_prepaid,
        new_prepaid: balances.prepaid - from_prepaid,
        new_free: balances.free - from_free,
    })
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ActiveSubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    started_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    auto_renew: bool,
    status: String,
    plan_code: String,
    plan_name: String,
    plan_price: i64,
}

impl ActiveSubscriptionRow {
    /// Cycle allotment from the authoritative price table, falling back to
    /// the stored plan price for codes outside it.
    fn cycle_allotment_paise(&self) -> i64 {
        let cycle = cycle_from_dates(self.started_at, self.expires_at);
        match PlanCode::from_code(&self.plan_code) {
            Some(code) => expected_amount_paise(code, cycle),
            None => self.plan_price,
        }
    }
}

/// Billing overview DTO: balances, usage and the active subscription summary.
#[derive(Debug, Clone, Serialize)]
pub struct BillingOverview {
    pub subscription: Option<OverviewSubscription>,
    pub credits: OverviewCredits,
    pub usage: OverviewUsage,
    pub next_invoice: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewSubscription {
    pub plan_name: String,
    pub status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub start_date: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_date: OffsetDateTime,
    pub days_remaining: i64,
    pub auto_renew: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewCredits {
    pub prepaid: f64,
    pub free: f64,
    pub cap_total: f64,
    pub cap_remaining: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverviewUsage {
    pub total: f64,
    pub prepaid_used: f64,
}

#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
    customers: CustomerDirectory,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        let customers = CustomerDirectory::new(pool.clone());
        Self { pool, customers }
    }

    async fn read_override(&self, user_id: Uuid, key: &str) -> BillingResult<f64> {
        let value: Option<f64> = sqlx::query_scalar(
            "SELECT value FROM user_feature_overrides WHERE user_id = $1 AND feature_key = $2",
        )
        .bind(user_id)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value.unwrap_or(0.0))
    }

    /// Lock and read the override rows for a user inside a transaction.
    /// Missing keys default to zero.
    async fn lock_balances(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<(Balances, f64, f64)> {
        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT feature_key, value FROM user_feature_overrides
             WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;

        let get = |key: &str| {
            rows.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .unwrap_or(0.0)
        };
        Ok((
            Balances {
                prepaid: get(KEY_PREPAID),
                free: get(KEY_FREE),
            },
            get(KEY_USAGE_USED),
            get(KEY_USAGE_PREPAID_USED),
        ))
    }

    async fn set_override(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        key: &str,
        value: f64,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO user_feature_overrides (user_id, feature_key, value)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id, feature_key)
             DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        )
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn append_entry(
        tx: &mut Transaction<'_, Postgres>,
        email: &str,
        entry_type: EntryType,
        direction: Direction,
        amount: f64,
        reason: &str,
        source: EntrySource,
        reference_id: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO credit_ledger (email, entry_type, direction, amount, reason, source, reference_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(email)
        .bind(entry_type.as_str())
        .bind(direction.as_str())
        .bind(amount)
        .bind(reason)
        .bind(source.as_str())
        .bind(reference_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn active_subscription(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<ActiveSubscriptionRow>> {
        let row: Option<ActiveSubscriptionRow> = sqlx::query_as(&format!(
            "SELECT s.id, s.user_id, s.started_at, s.expires_at, s.auto_renew, s.status,
                    p.code AS plan_code, p.name AS plan_name, p.price AS plan_price
             FROM subscriptions s
             JOIN plans p ON p.id = s.plan_id
             WHERE s.user_id = $1 AND s.status = '{active}'
             ORDER BY s.created_at DESC
             LIMIT 1",
            active = SubscriptionStatus::Active.as_str()
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn subscription_by_id(&self, id: Uuid) -> BillingResult<Option<ActiveSubscriptionRow>> {
        let row: Option<ActiveSubscriptionRow> = sqlx::query_as(
            "SELECT s.id, s.user_id, s.started_at, s.expires_at, s.auto_renew, s.status,
                    p.code AS plan_code, p.name AS plan_name, p.price AS plan_price
             FROM subscriptions s
             JOIN plans p ON p.id = s.plan_id
             WHERE s.id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Trial mode holds when the active plan is PRO, the email's trial has
    /// been claimed, and we are within the trial window of the start date.
    async fn is_trial_mode(
        &self,
        subscription: &ActiveSubscriptionRow,
        email: &str,
    ) -> BillingResult<bool> {
        if PlanCode::from_code(&subscription.plan_code) != Some(PlanCode::Pro) {
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
        let elapsed = OffsetDateTime::now_utc() - subscription.started_at;
        Ok(elapsed <= time::Duration::days(TRIAL_WINDOW_DAYS))
    }

    /// Current balances, defaulting to zero when no override rows exist.
    pub async fn get_balance(&self, user_id: Uuid) -> BillingResult<Balances> {
        let prepaid = self.read_override(user_id, KEY_PREPAID).await?;
        let free = self.read_override(user_id, KEY_FREE).await?;
        Ok(Balances { prepaid, free }.rounded())
    }

    /// Credit one pool and append a ledger entry. Admin path.
    pub async fn add_credits(
        &self,
        email: &str,
        entry_type: EntryType,
        amount: f64,
        reason: &str,
        reference_id: &str,
    ) -> BillingResult<Balances> {
        if amount <= 0.0 {
            return Err(BillingError::Internal(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        let user = self.customers.require_by_email(email).await?;

        let mut tx = self.pool.begin().await?;
        let (balances, _, _) = Self::lock_balances(&mut tx, user.id).await?;
        let new = match entry_type {
            EntryType::Prepaid => Balances {
                prepaid: balances.prepaid + amount,
                free: balances.free,
            },
            EntryType::Free => Balances {
                prepaid: balances.prepaid,
                free: balances.free + amount,
            },
        };
        Self::set_override(&mut tx, user.id, KEY_PREPAID, new.prepaid).await?;
        Self::set_override(&mut tx, user.id, KEY_FREE, new.free).await?;
        Self::append_entry(
            &mut tx,
            email,
            entry_type,
            Direction::Credit,
            amount,
            reason,
            EntrySource::Admin,
            reference_id,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(email = %email, amount, entry_type = entry_type.as_str(), "Credits added");
        Ok(new.rounded())
    }

    /// One-shot trial credit grant, guarded by the per-user claimed flag.
    pub async fn add_trial_credits(
        &self,
        email: &str,
        entry_type: EntryType,
        amount: f64,
        reason: &str,
        reference_id: &str,
    ) -> BillingResult<Balances> {
        let user = self.customers.require_by_email(email).await?;
        if user.trial_credits_claimed {
            return Err(BillingError::TrialAlreadyClaimed);
        }
        let balances = self
            .add_credits(email, entry_type, amount, reason, reference_id)
            .await?;
        self.customers.mark_trial_credits_claimed(user.id).await?;
        Ok(balances)
    }

    pub async fn trial_credits_claimed(&self, user_id: Uuid) -> BillingResult<bool> {
        let claimed: Option<bool> =
            sqlx::query_scalar("SELECT trial_credits_claimed FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(claimed.unwrap_or(false))
    }

    /// Deduct from a specific pool, or from both in `Auto` mode. Appends one
    /// debit entry. Admin path; does not touch usage counters.
    pub async fn deduct_credits(
        &self,
        email: &str,
        amount: f64,
        from: DeductFrom,
        reason: &str,
        reference_id: &str,
    ) -> BillingResult<Balances> {
        let user = self.customers.require_by_email(email).await?;

        let mut tx = self.pool.begin().await?;
        let (balances, _, _) = Self::lock_balances(&mut tx, user.id).await?;
        let plan = plan_deduction(balances, amount, from)?;

        Self::set_override(&mut tx, user.id, KEY_PREPAID, plan.new_prepaid).await?;
        Self::set_override(&mut tx, user.id, KEY_FREE, plan.new_free).await?;
        Self::append_entry(
            &mut tx,
            email,
            plan.entry_type,
            Direction::Debit,
            amount,
            reason,
            EntrySource::Admin,
            reference_id,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(email = %email, amount, "Credits deducted");
        Ok(Balances {
            prepaid: plan.new_prepaid,
            free: plan.new_free,
        }
        .rounded())
    }

    /// Metered usage path. Requires an ACTIVE subscription; enforces the
    /// trial ordering rule; updates both usage counters and appends a debit
    /// entry plus one usage-history record.
    pub async fn consume_credits(
        &self,
        email: &str,
        cost: f64,
        resource: &str,
        request_id: &str,
    ) -> BillingResult<Balances> {
        let user = self.customers.require_by_email(email).await?;
        let subscription = self
            .active_subscription(user.id)
            .await?
            .ok_or(BillingError::SubscriptionInactive)?;
        let trial_mode = self.is_trial_mode(&subscription, email).await?;

        let mut tx = self.pool.begin().await?;
        let (balances, used, prepaid_used) = Self::lock_balances(&mut tx, user.id).await?;
        let plan = plan_consumption(balances, cost, trial_mode)?;

        Self::set_override(&mut tx, user.id, KEY_PREPAID, plan.new_prepaid).await?;
        Self::set_override(&mut tx, user.id, KEY_FREE, plan.new_free).await?;
        Self::set_override(&mut tx, user.id, KEY_USAGE_USED, used + cost).await?;
        Self::set_override(
            &mut tx,
            user.id,
            KEY_USAGE_PREPAID_USED,
            prepaid_used + plan.from_prepaid,
        )
        .await?;
        let entry_type = if plan.from_prepaid > 0.0 {
            EntryType::Prepaid
        } else {
            EntryType::Free
        };
        Self::append_entry(
            &mut tx,
            email,
            entry_type,
            Direction::Debit,
            cost,
            &format!("usage:{resource}"),
            EntrySource::System,
            request_id,
        )
        .await?;
        sqlx::query(
            "INSERT INTO usage_history (email, resource, cost, request_id)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(email)
        .bind(resource)
        .bind(round2(cost))
        .bind(request_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            email = %email,
            cost,
            resource,
            trial_mode,
            from_free = plan.from_free,
            from_prepaid = plan.from_prepaid,
            "Usage consumed"
        );
        Ok(Balances {
            prepaid: plan.new_prepaid,
            free: plan.new_free,
        }
        .rounded())
    }

    /// Ledger entries in insertion order, optionally filtered by email.
    pub async fn get_ledger(&self, email: Option<&str>) -> BillingResult<Vec<LedgerEntryRecord>> {
        let entries: Vec<LedgerEntryRecord> = match email {
            Some(email) => {
                sqlx::query_as(
                    "SELECT id, email, entry_type, direction, amount, reason, source, reference_id, created_at
                     FROM credit_ledger WHERE LOWER(email) = LOWER($1) ORDER BY created_at",
                )
                .bind(email)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, email, entry_type, direction, amount, reason, source, reference_id, created_at
                     FROM credit_ledger ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(entries)
    }

    /// Usage records in insertion order, optionally filtered by email.
    pub async fn get_usage_history(&self, email: Option<&str>) -> BillingResult<Vec<UsageRecord>> {
        let records: Vec<UsageRecord> = match email {
            Some(email) => {
                sqlx::query_as(
                    "SELECT id, email, resource, cost, request_id, created_at
                     FROM usage_history WHERE LOWER(email) = LOWER($1) ORDER BY created_at",
                )
                .bind(email)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT id, email, resource, cost, request_id, created_at
                     FROM usage_history ORDER BY created_at",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }

    /// Balances, usage counters and active-subscription summary in one DTO.
    pub async fn get_overview(&self, user_id: Uuid) -> BillingResult<BillingOverview> {
        let subscription = self.active_subscription(user_id).await?;
        let prepaid = self.read_override(user_id, KEY_PREPAID).await?;
        let free = self.read_override(user_id, KEY_FREE).await?;
        let used = self.read_override(user_id, KEY_USAGE_USED).await?;
        let prepaid_used = self.read_override(user_id, KEY_USAGE_PREPAID_USED).await?;

        let cap_total = prepaid + free;
        let cap_remaining = (cap_total - used).max(0.0);

        let now = OffsetDateTime::now_utc();
        let next_invoice = subscription
            .as_ref()
            .map(|s| s.cycle_allotment_paise() as f64);
        let subscription = subscription.map(|s| {
            let remaining = s.expires_at - now;
            let days_remaining = if remaining.is_positive() {
                let whole = remaining.whole_days();
                // Ceiling: a partial day still counts
                if remaining - time::Duration::days(whole) > time::Duration::ZERO {
                    whole + 1
                } else {
                    whole
                }
            } else {
                0
            };
            OverviewSubscription {
                plan_name: s.plan_name,
                status: s.status,
                start_date: s.started_at,
                end_date: s.expires_at,
                days_remaining,
                auto_renew: s.auto_renew,
            }
        });

        Ok(BillingOverview {
            subscription,
            credits: OverviewCredits {
                prepaid: round2(prepaid),
                free: round2(free),
                cap_total: round2(cap_total),
                cap_remaining: round2(cap_remaining),
            },
            usage: OverviewUsage {
                total: round2(used),
                prepaid_used: round2(prepaid_used),
            },
            next_invoice,
        })
    }

    /// Initialize the cycle allotment for a subscription: prepaid from the
    /// plan's cycle price, free and both usage counters zeroed, one
    /// subscription-sourced credit entry appended. Balances are set, not
    /// added, so a replay converges to the same state.
    pub async fn sync_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
    ) -> BillingResult<Balances> {
        self.reinitialize(user_id, subscription_id, "Subscription activation")
            .await
    }

    /// Same re-derivation as [`sync_subscription`], tagged as a renewal.
    /// Manual recovery entry point.
    ///
    /// [`sync_subscription`]: CreditLedger::sync_subscription
    pub async fn reset_subscription(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
    ) -> BillingResult<Balances> {
        self.reinitialize(user_id, subscription_id, "Subscription renewal")
            .await
    }

    async fn reinitialize(
        &self,
        user_id: Uuid,
        subscription_id: Option<Uuid>,
        reason: &str,
    ) -> BillingResult<Balances> {
        let subscription = match subscription_id {
            Some(id) => self.subscription_by_id(id).await?,
            None => self.active_subscription(user_id).await?,
        }
        .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let user = self.customers.require_by_id(subscription.user_id).await?;
        let prepaid = subscription.cycle_allotment_paise() as f64;

        let mut tx = self.pool.begin().await?;
        Self::lock_balances(&mut tx, subscription.user_id).await?;
        Self::set_override(&mut tx, subscription.user_id, KEY_PREPAID, prepaid).await?;
        Self::set_override(&mut tx, subscription.user_id, KEY_FREE, 0.0).await?;
        Self::set_override(&mut tx, subscription.user_id, KEY_USAGE_USED, 0.0).await?;
        Self::set_override(&mut tx, subscription.user_id, KEY_USAGE_PREPAID_USED, 0.0).await?;
        Self::append_entry(
            &mut tx,
            &user.email,
            EntryType::Prepaid,
            Direction::Credit,
            prepaid,
            reason,
            EntrySource::Subscription,
            &subscription.id.to_string(),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %subscription.user_id,
            subscription_id = %subscription.id,
            prepaid,
            reason,
            "Ledger reinitialized from subscription"
        );
        Ok(Balances { prepaid, free: 0.0 }.rounded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balances(prepaid: f64, free: f64) -> Balances {
        Balances { prepaid, free }
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(1.005), 1.0);
        assert_eq!(round2(1.015), 1.01);
        assert_eq!(round2(2.999), 3.0);
        assert_eq!(round2(0.0), 0.0);
    }

    // Scenario: free=0, prepaid=500, no trial; consume 300 draws the whole
    // cost from prepaid.
    #[test]
    fn test_consume_prepaid_only() {
        let plan = plan_consumption(balances(500.0, 0.0), 300.0, false).unwrap();
        assert_eq!(plan.from_free, 0.0);
        assert_eq!(plan.from_prepaid, 300.0);
        assert_eq!(plan.new_prepaid, 200.0);
        assert_eq!(plan.new_free, 0.0);
    }

    // Scenario: trial window active with free=100, prepaid=500; a 150-cost
    // consume fails without touching prepaid.
    #[test]
    fn test_trial_never_touches_prepaid() {
        let err = plan_consumption(balances(500.0, 100.0), 150.0, true).unwrap_err();
        assert!(matches!(err, BillingError::UsageLimitReached { message }
            if message.contains("free trial")));
    }

    #[test]
    fn test_trial_consumes_free_only() {
        let plan = plan_consumption(balances(500.0, 100.0), 80.0, true).unwrap();
        assert_eq!(plan.from_prepaid, 0.0);
        assert_eq!(plan.new_prepaid, 500.0);
        assert_eq!(plan.new_free, 20.0);
    }

    #[test]
    fn test_consume_free_before_prepaid() {
        let plan = plan_consumption(balances(500.0, 100.0), 150.0, false).unwrap();
        assert_eq!(plan.from_free, 100.0);
        assert_eq!(plan.from_prepaid, 50.0);
        assert_eq!(plan.new_free, 0.0);
        assert_eq!(plan.new_prepaid, 450.0);
    }

    #[test]
    fn test_consume_exhausted_message_distinguishes() {
        let err = plan_consumption(balances(10.0, 10.0), 100.0, false).unwrap_err();
        assert!(matches!(err, BillingError::UsageLimitReached { message }
            if message.contains("subscription credits")));
    }

    // Scenario: prepaid=30; a hard prepaid deduction of 50 fails and leaves
    // balances untouched.
    #[test]
    fn test_deduct_prepaid_hard_fail() {
        let err = plan_deduction(balances(30.0, 100.0), 50.0, DeductFrom::Prepaid).unwrap_err();
        assert!(matches!(err, BillingError::InsufficientPrepaidCredits));
    }

    #[test]
    fn test_deduct_free_hard_fail() {
        let err = plan_deduction(balances(100.0, 30.0), 50.0, DeductFrom::Free).unwrap_err();
        assert!(matches!(err, BillingError::InsufficientFreeCredits));
    }

    #[test]
    fn test_deduct_auto_drains_prepaid_first() {
        let plan = plan_deduction(balances(40.0, 100.0), 60.0, DeductFrom::Auto).unwrap();
        assert_eq!(plan.new_prepaid, 0.0);
        assert_eq!(plan.new_free, 80.0);
    }

    #[test]
    fn test_deduct_auto_clamps_at_zero() {
        // Combined balance is short; auto mode still succeeds and floors both
        // pools at zero
        let plan = plan_deduction(balances(10.0, 5.0), 100.0, DeductFrom::Auto).unwrap();
        assert_eq!(plan.new_prepaid, 0.0);
        assert_eq!(plan.new_free, 0.0);
    }

    #[test]
    fn test_balances_never_negative_after_plans() {
        for (p, f, cost) in [(0.0, 0.0, 0.0), (5.0, 5.0, 10.0), (100.0, 0.0, 100.0)] {
            if let Ok(plan) = plan_consumption(balances(p, f), cost, false) {
                assert!(plan.new_prepaid >= 0.0);
                assert!(plan.new_free >= 0.0);
            }
        }
    }
}
