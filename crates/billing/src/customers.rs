//! Customer directory
//!
//! Read side of the user table plus the one mutation billing owns: promoting
//! an account to the paying tier. Everything else about users belongs to the
//! account service.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use loopsync_shared::AccountType;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub email: String,
    pub full_name: Option<String>,
    pub account_type: String,
    pub status: String,
    pub trial_credits_claimed: bool,
    pub created_at: OffsetDateTime,
}

impl CustomerRecord {
    pub fn is_verified(&self) -> bool {
        self.status.eq_ignore_ascii_case("VERIFIED")
    }

    pub fn display_name(&self) -> &str {
        self.full_name.as_deref().unwrap_or("there")
    }
}

const CUSTOMER_COLUMNS: &str =
    "id, email, full_name, account_type, status, trial_credits_claimed, created_at";

#[derive(Clone)]
pub struct CustomerDirectory {
    pool: PgPool,
}

impl CustomerDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_email(&self, email: &str) -> BillingResult<Option<CustomerRecord>> {
        let customer: Option<CustomerRecord> = sqlx::query_as(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(customer)
    }

    pub async fn find_by_id(&self, id: Uuid) -> BillingResult<Option<CustomerRecord>> {
        let customer: Option<CustomerRecord> =
            sqlx::query_as(&format!("SELECT {CUSTOMER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(customer)
    }

    pub async fn require_by_email(&self, email: &str) -> BillingResult<CustomerRecord> {
        self.find_by_email(email)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(email.to_string()))
    }

    pub async fn require_by_id(&self, id: Uuid) -> BillingResult<CustomerRecord> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| BillingError::CustomerNotFound(id.to_string()))
    }

    /// Promote or demote the account tier. Idempotent.
    pub async fn set_account_type(
        &self,
        user_id: Uuid,
        account_type: AccountType,
    ) -> BillingResult<()> {
        sqlx::query("UPDATE users SET account_type = $1 WHERE id = $2")
            .bind(account_type.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        tracing::info!(%user_id, account_type = account_type.as_str(), "Updated account tier");
        Ok(())
    }

    /// One-way flag: set when trial credits are granted, never cleared.
    pub async fn mark_trial_credits_claimed(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query("UPDATE users SET trial_credits_claimed = TRUE WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: &str, full_name: Option<&str>) -> CustomerRecord {
        CustomerRecord {
            id: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            full_name: full_name.map(|s| s.to_string()),
            account_type: "VISITOR".to_string(),
            status: status.to_string(),
            trial_credits_claimed: false,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_verified_is_case_insensitive() {
        assert!(sample("VERIFIED", None).is_verified());
        assert!(sample("verified", None).is_verified());
        assert!(!sample("UNVERIFIED", None).is_verified());
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(sample("VERIFIED", Some("Asha")).display_name(), "Asha");
        assert_eq!(sample("VERIFIED", None).display_name(), "there");
    }
}
