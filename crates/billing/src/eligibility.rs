//! Free-trial eligibility
//!
//! One row per email, created lazily the first time a verified customer is
//! checked. `is_used` is monotonic: once trial credits have been granted it
//! flips to true and never reverts.

use sqlx::PgPool;
use uuid::Uuid;

use crate::customers::CustomerDirectory;
use crate::error::BillingResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EligibleEmailRecord {
    pub email: String,
    pub is_used: bool,
}

#[derive(Clone)]
pub struct EligibilityOracle {
    pool: PgPool,
    customers: CustomerDirectory,
}

impl EligibilityOracle {
    pub fn new(pool: PgPool) -> Self {
        let customers = CustomerDirectory::new(pool.clone());
        Self { pool, customers }
    }

    async fn find(&self, email: &str) -> BillingResult<Option<EligibleEmailRecord>> {
        let row: Option<EligibleEmailRecord> = sqlx::query_as(
            "SELECT email, is_used FROM eligible_emails WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Whether this email may still receive trial-priced credits.
    ///
    /// An existing row answers directly. Otherwise, a row is created lazily
    /// for verified customers; ON CONFLICT DO NOTHING followed by a re-read
    /// makes two concurrent first-time checks converge on one row. Unknown
    /// emails are optimistically eligible.
    pub async fn check_eligibility(&self, email: &str) -> BillingResult<bool> {
        if let Some(row) = self.find(email).await? {
            return Ok(!row.is_used);
        }

        let customer = self.customers.find_by_email(email).await?;
        match customer {
            Some(c) if c.is_verified() => {
                sqlx::query(
                    "INSERT INTO eligible_emails (email, is_used) VALUES (LOWER($1), FALSE)
                     ON CONFLICT (email) DO NOTHING",
                )
                .bind(email)
                .execute(&self.pool)
                .await?;

                // Re-read: a concurrent grant may already have flipped it
                match self.find(email).await? {
                    Some(row) => Ok(!row.is_used),
                    None => Ok(true),
                }
            }
            _ => Ok(true),
        }
    }

    /// Permanently consume the email's trial eligibility. Upsert so the flag
    /// is set even when no row was ever created; never resets to false.
    pub async fn mark_email_as_used(&self, email: &str) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO eligible_emails (email, is_used) VALUES (LOWER($1), TRUE)
             ON CONFLICT (email) DO UPDATE SET is_used = TRUE",
        )
        .bind(email)
        .execute(&self.pool)
        .await?;
        tracing::info!(email = %email, "Trial eligibility marked as used");
        Ok(())
    }

    /// Trial usage flag as stored, defaulting to unused for unknown emails.
    pub async fn is_trial_used(&self, email: &str) -> BillingResult<bool> {
        Ok(self.find(email).await?.map(|r| r.is_used).unwrap_or(false))
    }

    /// Full free-trial check for checkout: any subscription history at all,
    /// in any status, disqualifies before the email flag is consulted.
    pub async fn is_eligible_for_free_trial(&self, user_id: Uuid) -> BillingResult<bool> {
        let subscription_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
        if subscription_count > 0 {
            return Ok(false);
        }
        let user = self.customers.require_by_id(user_id).await?;
        self.check_eligibility(&user.email).await
    }
}
