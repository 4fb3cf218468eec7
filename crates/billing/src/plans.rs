//! Plan catalog
//!
//! Single authoritative source for plan codes, cycle lengths and cycle
//! prices. Webhook handlers, the ledger and the upgrade flow all price
//! through this module; amount-based plan inference lives here too as a
//! documented fallback for webhook payloads that arrive without metadata.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One-time trial charges are exactly 200 paise; any recurring charge at or
/// below this is treated as trial-priced.
pub const TRIAL_CHARGE_PAISE: i64 = 200;

/// Trial window length measured from subscription start.
pub const TRIAL_WINDOW_DAYS: i64 = 7;

/// Known plan codes. The trial program applies to `Pro` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanCode {
    Pro,
    ProPrimeX,
}

impl PlanCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanCode::Pro => "PRO",
            PlanCode::ProPrimeX => "PRO_PRIME-X",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "PRO" => Some(PlanCode::Pro),
            "PRO_PRIME-X" => Some(PlanCode::ProPrimeX),
            _ => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            PlanCode::Pro => "PRO",
            PlanCode::ProPrimeX => "PRO PRIME-X",
        }
    }
}

impl std::fmt::Display for PlanCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "MONTHLY",
            BillingCycle::Annual => "ANNUAL",
        }
    }

    /// Normalize a free-form cycle string; anything that is not ANNUAL is
    /// treated as MONTHLY.
    pub fn parse_lenient(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("ANNUAL") {
            BillingCycle::Annual
        } else {
            BillingCycle::Monthly
        }
    }

    /// Nominal cycle length used for per-day proration.
    pub fn days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Annual => 365,
        }
    }

    /// Gateway-facing interval label.
    pub fn gateway_interval(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "yearly",
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Expected charge in paise for a plan/cycle pair. This table is the single
/// authoritative price list; renewals re-derive the prepaid allotment from it
/// instead of prorating, so rounding never drifts across cycles.
pub fn expected_amount_paise(code: PlanCode, cycle: BillingCycle) -> i64 {
    match (code, cycle) {
        (PlanCode::Pro, BillingCycle::Monthly) => 759 * 100,
        (PlanCode::Pro, BillingCycle::Annual) => 7399 * 100,
        (PlanCode::ProPrimeX, BillingCycle::Monthly) => 1299 * 100,
        (PlanCode::ProPrimeX, BillingCycle::Annual) => 12599 * 100,
    }
}

/// Classify a validity window when no explicit cycle is stored: spans of 300
/// days or more are annual.
pub fn cycle_from_dates(start: OffsetDateTime, end: OffsetDateTime) -> BillingCycle {
    let days = ((end - start).whole_days()).max(0);
    if days >= 300 {
        BillingCycle::Annual
    } else {
        BillingCycle::Monthly
    }
}

/// Infer the plan from a charged amount when webhook metadata is missing.
/// Checks the higher tier first so an amount covering both resolves upward.
pub fn infer_plan_from_amount(amount_paise: i64, cycle: BillingCycle) -> Option<PlanCode> {
    if amount_paise <= 0 {
        return None;
    }
    if amount_paise >= expected_amount_paise(PlanCode::ProPrimeX, cycle) {
        return Some(PlanCode::ProPrimeX);
    }
    if amount_paise >= expected_amount_paise(PlanCode::Pro, cycle) {
        return Some(PlanCode::Pro);
    }
    None
}

/// Plan row as stored in the catalog table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PlanRecord {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    /// Base price in paise for the stored billing cycle.
    pub price: i64,
    pub currency: String,
    pub billing_cycle: String,
}

impl PlanRecord {
    pub fn plan_code(&self) -> Option<PlanCode> {
        PlanCode::from_code(&self.code)
    }

    pub fn cycle(&self) -> BillingCycle {
        BillingCycle::parse_lenient(&self.billing_cycle)
    }

    /// Expected amount from the authoritative table, falling back to the
    /// stored base price for codes outside the table.
    pub fn amount_for_cycle(&self, cycle: BillingCycle) -> i64 {
        match self.plan_code() {
            Some(code) => expected_amount_paise(code, cycle),
            None => self.price,
        }
    }

    pub fn display_name(&self) -> String {
        match self.plan_code() {
            Some(code) => code.display_name().to_string(),
            None => self.name.clone(),
        }
    }
}

/// Read-side plan catalog.
pub struct PlanCatalog {
    pool: PgPool,
}

impl PlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_code(&self, code: &str) -> BillingResult<Option<PlanRecord>> {
        let plan: Option<PlanRecord> = sqlx::query_as(
            "SELECT id, code, name, price, currency, billing_cycle FROM plans WHERE code = $1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<PlanRecord>> {
        let plan: Option<PlanRecord> = sqlx::query_as(
            "SELECT id, code, name, price, currency, billing_cycle FROM plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    pub async fn require_by_code(&self, code: &str) -> BillingResult<PlanRecord> {
        self.find_by_code(code)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(code.to_string()))
    }

    pub async fn require_by_id(&self, id: Uuid) -> BillingResult<PlanRecord> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    #[test]
    fn test_price_table() {
        assert_eq!(
            expected_amount_paise(PlanCode::Pro, BillingCycle::Monthly),
            75_900
        );
        assert_eq!(
            expected_amount_paise(PlanCode::Pro, BillingCycle::Annual),
            739_900
        );
        assert_eq!(
            expected_amount_paise(PlanCode::ProPrimeX, BillingCycle::Monthly),
            129_900
        );
        assert_eq!(
            expected_amount_paise(PlanCode::ProPrimeX, BillingCycle::Annual),
            1_259_900
        );
    }

    #[test]
    fn test_cycle_inference_boundary_at_300_days() {
        let start = OffsetDateTime::now_utc();
        assert_eq!(
            cycle_from_dates(start, start + Duration::days(299)),
            BillingCycle::Monthly
        );
        assert_eq!(
            cycle_from_dates(start, start + Duration::days(300)),
            BillingCycle::Annual
        );
        assert_eq!(
            cycle_from_dates(start, start + Duration::days(365)),
            BillingCycle::Annual
        );
    }

    #[test]
    fn test_cycle_inference_never_negative() {
        let start = OffsetDateTime::now_utc();
        // An end before the start classifies as monthly rather than panicking
        assert_eq!(
            cycle_from_dates(start, start - Duration::days(10)),
            BillingCycle::Monthly
        );
    }

    #[test]
    fn test_amount_inference_resolves_upward() {
        // Exactly PRIME-X monthly resolves to the higher tier even though it
        // also covers PRO
        assert_eq!(
            infer_plan_from_amount(129_900, BillingCycle::Monthly),
            Some(PlanCode::ProPrimeX)
        );
        assert_eq!(
            infer_plan_from_amount(75_900, BillingCycle::Monthly),
            Some(PlanCode::Pro)
        );
        assert_eq!(
            infer_plan_from_amount(80_000, BillingCycle::Monthly),
            Some(PlanCode::Pro)
        );
        assert_eq!(infer_plan_from_amount(200, BillingCycle::Monthly), None);
        assert_eq!(infer_plan_from_amount(0, BillingCycle::Monthly), None);
    }

    #[test]
    fn test_lenient_cycle_parse() {
        assert_eq!(BillingCycle::parse_lenient("ANNUAL"), BillingCycle::Annual);
        assert_eq!(BillingCycle::parse_lenient("annual"), BillingCycle::Annual);
        assert_eq!(BillingCycle::parse_lenient("MONTHLY"), BillingCycle::Monthly);
        assert_eq!(BillingCycle::parse_lenient("weekly"), BillingCycle::Monthly);
        assert_eq!(BillingCycle::parse_lenient(""), BillingCycle::Monthly);
    }

    #[test]
    fn test_plan_code_round_trip() {
        assert_eq!(PlanCode::from_code("PRO"), Some(PlanCode::Pro));
        assert_eq!(PlanCode::from_code("PRO_PRIME-X"), Some(PlanCode::ProPrimeX));
        assert_eq!(PlanCode::from_code("FREE"), None);
        assert_eq!(PlanCode::ProPrimeX.display_name(), "PRO PRIME-X");
    }
}
