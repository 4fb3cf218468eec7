//! Email notifications for billing events
//!
//! Transactional emails sent via the Resend API. Every send is fire-and-log
//! from the caller's point of view: a delivery failure is reported as
//! `Ok(false)` and never fails the webhook or ledger transaction that
//! triggered it.

use crate::error::BillingResult;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Resend API key
    pub resend_api_key: String,
    /// From address for emails
    pub email_from: String,
    /// App name for branding
    pub app_name: String,
    /// Support email
    pub support_email: String,
    /// Dashboard URL
    pub dashboard_url: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            resend_api_key: std::env::var("RESEND_API_KEY").unwrap_or_default(),
            email_from: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "LoopSync <noreply@loopsync.app>".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "LoopSync".to_string()),
            support_email: std::env::var("SUPPORT_EMAIL")
                .unwrap_or_else(|_| "support@loopsync.app".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://loopsync.app".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.resend_api_key.is_empty()
    }
}

fn format_inr(amount_paise: i64) -> String {
    format!("\u{20b9}{:.2}", amount_paise as f64 / 100.0)
}

/// Billing email notification service
#[derive(Clone)]
pub struct BillingEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl BillingEmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via Resend API
    ///
    /// Returns `Ok(true)` if the email was sent successfully,
    /// `Ok(false)` if sending failed (non-fatal - doesn't propagate error).
    async fn send_email(&self, to: &str, subject: &str, html: &str) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "from": self.config.email_from,
            "to": [to],
            "subject": subject,
            "html": html
        });

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .header(
                "Authorization",
                format!("Bearer {}", self.config.resend_api_key),
            )
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to, subject = %subject, "Billing email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false) // Don't fail webhooks due to email errors
            }
            Err(e) => {
                tracing::error!(
                    to = %to,
                    subject = %subject,
                    error = %e,
                    "Failed to send billing email - non-fatal"
                );
                Ok(false) // Don't fail webhooks due to email errors
            }
        }
    }

    /// Send payment success confirmation
    pub async fn send_payment_success(
        &self,
        to: &str,
        customer_name: &str,
        plan_name: &str,
        amount_paise: i64,
    ) -> BillingResult<bool> {
        let amount = format_inr(amount_paise);
        let dashboard_link = format!("{}/dashboard", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #16a34a;">Payment Successful</h2>
    <p>Hi {customer_name},</p>
    <p>Thank you! Your payment of <strong>{amount}</strong> for the <strong>{plan_name}</strong> plan has been received.</p>
    <div style="background: #f0fdf4; border: 1px solid #bbf7d0; border-radius: 8px; padding: 16px; margin: 20px 0;">
        <p style="margin: 0 0 8px 0; color: #16a34a;"><strong>Status:</strong> Paid</p>
        <p style="margin: 0 0 8px 0;"><strong>Plan:</strong> {plan_name}</p>
        <p style="margin: 0;"><strong>Amount:</strong> {amount}</p>
    </div>
    <p>Your plan benefits are now active.</p>
    <p>
        <a href="{dashboard_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Go to Dashboard
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            customer_name = customer_name,
            plan_name = plan_name,
            amount = amount,
            dashboard_link = dashboard_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Payment Received - {}", self.config.app_name),
            &html,
        )
        .await
    }

    /// Send payment failed notification (with error from the gateway)
    pub async fn send_payment_failed(
        &self,
        to: &str,
        customer_name: &str,
        amount_paise: i64,
        error_message: &str,
    ) -> BillingResult<bool> {
        let amount = format_inr(amount_paise);
        let billing_link = format!("{}/billing", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #dc2626;">Payment Failed</h2>
    <p>Hi {customer_name},</p>
    <p>We weren't able to process your payment of <strong>{amount}</strong>.</p>
    <div style="background: #fef2f2; border: 1px solid #fecaca; border-radius: 8px; padding: 16px; margin: 20px 0;">
        <p style="margin: 0; color: #dc2626;"><strong>Reason:</strong> {error_message}</p>
    </div>
    <p>Please try again or use a different payment method to avoid any interruption to your service.</p>
    <p>
        <a href="{billing_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Retry Payment
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        If you have any questions, please contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            customer_name = customer_name,
            amount = amount,
            error_message = error_message,
            billing_link = billing_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Payment Failed - {}", self.config.app_name),
            &html,
        )
        .await
    }

    /// Send subscription cancelled confirmation
    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        customer_name: &str,
        plan_name: &str,
        end_date: &str,
    ) -> BillingResult<bool> {
        let resubscribe_link = format!("{}/billing", self.config.dashboard_url);

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #333;">Subscription Cancelled</h2>
    <p>Hi {customer_name},</p>
    <p>Your <strong>{plan_name}</strong> subscription has been cancelled.</p>
    <p>You'll continue to have access to your plan features until <strong>{end_date}</strong>. After that, your account will move to the free tier.</p>
    <p>Changed your mind? You can resubscribe anytime.</p>
    <p>
        <a href="{resubscribe_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Resubscribe
        </a>
    </p>
    <p style="color: #666; font-size: 14px;">
        Questions? Contact us at <a href="mailto:{support_email}">{support_email}</a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            customer_name = customer_name,
            plan_name = plan_name,
            end_date = end_date,
            resubscribe_link = resubscribe_link,
            support_email = self.config.support_email,
            app_name = self.config.app_name,
        );

        self.send_email(
            to,
            &format!("Subscription Cancelled - {}", self.config.app_name),
            &html,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inr_formatting() {
        assert_eq!(format_inr(75_900), "\u{20b9}759.00");
        assert_eq!(format_inr(200), "\u{20b9}2.00");
        assert_eq!(format_inr(1_259_900), "\u{20b9}12599.00");
    }

    #[tokio::test]
    async fn test_unconfigured_send_is_nonfatal() {
        let service = BillingEmailService::new(EmailConfig {
            resend_api_key: String::new(),
            email_from: "LoopSync <noreply@loopsync.app>".to_string(),
            app_name: "LoopSync".to_string(),
            support_email: "support@loopsync.app".to_string(),
            dashboard_url: "https://loopsync.app".to_string(),
        });
        let sent = service
            .send_payment_success("user@example.com", "Asha", "PRO", 75_900)
            .await
            .unwrap();
        assert!(!sent);
    }
}
