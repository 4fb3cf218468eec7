//! Billing error types
//!
//! Expected business outcomes (insufficient funds, inactive subscription,
//! underpaid charge) are variants returned as `Err` values so callers can
//! branch on them; only storage and malformed-payload failures are treated
//! as exceptional.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// The requested pool cannot cover the amount; no fallback to the
    /// other pool on this path.
    #[error("INSUFFICIENT_PREPAID_CREDITS: prepaid credits are insufficient for requested deduction")]
    InsufficientPrepaidCredits,

    #[error("INSUFFICIENT_FREE_CREDITS: free credits are insufficient for requested deduction")]
    InsufficientFreeCredits,

    /// Metered consumption rejected. The message distinguishes a trial
    /// exhaustion from a subscription exhaustion so clients can prompt the
    /// correct remediation.
    #[error("USAGE_LIMIT_REACHED: {message}")]
    UsageLimitReached { message: &'static str },

    #[error("SUBSCRIPTION_INACTIVE: subscription is inactive or cancelled")]
    SubscriptionInactive,

    /// A recurring charge arrived below the plan's expected cycle amount.
    #[error("UNDERPAID_SUBSCRIPTION: charged {paid} paise, expected {expected} paise")]
    UnderpaidSubscription { paid: i64, expected: i64 },

    #[error("Trial credits already claimed")]
    TrialAlreadyClaimed,

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload invalid: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::CustomerNotFound(_) => "CUSTOMER_NOT_FOUND",
            BillingError::PlanNotFound(_) => "PLAN_NOT_FOUND",
            BillingError::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            BillingError::InsufficientPrepaidCredits => "INSUFFICIENT_PREPAID_CREDITS",
            BillingError::InsufficientFreeCredits => "INSUFFICIENT_FREE_CREDITS",
            BillingError::UsageLimitReached { .. } => "USAGE_LIMIT_REACHED",
            BillingError::SubscriptionInactive => "SUBSCRIPTION_INACTIVE",
            BillingError::UnderpaidSubscription { .. } => "UNDERPAID_SUBSCRIPTION",
            BillingError::TrialAlreadyClaimed => "ALREADY_CLAIMED",
            BillingError::Gateway(_) => "GATEWAY_ERROR",
            BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
            BillingError::WebhookPayloadInvalid(_) => "WEBHOOK_PAYLOAD_INVALID",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            BillingError::InsufficientPrepaidCredits.code(),
            "INSUFFICIENT_PREPAID_CREDITS"
        );
        assert_eq!(
            BillingError::UnderpaidSubscription {
                paid: 20_000,
                expected: 75_900
            }
            .code(),
            "UNDERPAID_SUBSCRIPTION"
        );
        assert_eq!(BillingError::SubscriptionInactive.code(), "SUBSCRIPTION_INACTIVE");
    }

    #[test]
    fn test_usage_limit_message_is_surfaced() {
        let err = BillingError::UsageLimitReached {
            message: "trial exhausted",
        };
        assert!(err.to_string().contains("trial exhausted"));
    }
}
