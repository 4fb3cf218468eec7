//! Razorpay gateway client
//!
//! Thin adapter over the Razorpay REST API: orders, customers, plans,
//! subscriptions and payment fetches, plus HMAC signature verification for
//! checkout callbacks and webhooks. Nothing in here touches local state;
//! callers decide what a gateway failure means for them.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

const API_BASE: &str = "https://api.razorpay.com/v1";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Razorpay credentials and webhook secret
#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    pub webhook_secret: String,
}

impl RazorpayConfig {
    /// Load from `RAZORPAY_KEY_ID`, `RAZORPAY_KEY_SECRET`,
    /// `RAZORPAY_WEBHOOK_SECRET`.
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();
        let key_id = std::env::var("RAZORPAY_KEY_ID")
            .map_err(|_| BillingError::Internal("RAZORPAY_KEY_ID not set".to_string()))?;
        let key_secret = std::env::var("RAZORPAY_KEY_SECRET")
            .map_err(|_| BillingError::Internal("RAZORPAY_KEY_SECRET not set".to_string()))?;
        let webhook_secret = std::env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default();
        Ok(Self {
            key_id,
            key_secret,
            webhook_secret,
        })
    }
}

/// Provider order (one-time checkout)
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub status: String,
}

/// Provider customer
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GatewayCustomerList {
    #[serde(default)]
    items: Vec<GatewayCustomer>,
}

/// Provider subscription plan
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPlan {
    pub id: String,
}

/// Provider-side subscription state, as returned by fetch/create.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySubscription {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub total_count: Option<i64>,
    #[serde(default)]
    pub paid_count: Option<i64>,
    #[serde(default)]
    pub current_start: Option<i64>,
    #[serde(default)]
    pub current_end: Option<i64>,
    #[serde(default)]
    pub charge_at: Option<i64>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub end_at: Option<i64>,
    #[serde(default)]
    pub notes: serde_json::Value,
}

impl GatewaySubscription {
    /// Whether the provider reports the mandate as no longer charging.
    pub fn is_terminated(&self) -> bool {
        matches!(
            self.status.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("cancelled") | Some("halted") | Some("paused")
        )
    }
}

/// Provider payment
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayPayment {
    pub id: String,
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateOrderBody<'a> {
    amount: i64,
    currency: &'a str,
    receipt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a HashMap<String, String>>,
}

/// Razorpay API client. Cheap to clone; the inner reqwest client is shared.
#[derive(Clone)]
pub struct RazorpayClient {
    config: RazorpayConfig,
    http: reqwest::Client,
    base_url: String,
}

impl RazorpayClient {
    pub fn new(config: RazorpayConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            config,
            http,
            base_url: API_BASE.to_string(),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(RazorpayConfig::from_env()?))
    }

    pub fn config(&self) -> &RazorpayConfig {
        &self.config
    }

    /// Override the API base URL (tests against a local mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> BillingResult<T> {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .json(body)
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> BillingResult<T> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .basic_auth(&self.config.key_id, Some(&self.config.key_secret))
            .send()
            .await
            .map_err(|e| BillingError::Gateway(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> BillingResult<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // Razorpay errors carry {"error": {"description": ...}}
            let description = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| {
                    v.pointer("/error/description")
                        .and_then(|d| d.as_str())
                        .map(|s| s.to_string())
                })
                .unwrap_or(body);
            return Err(BillingError::Gateway(format!("{status}: {description}")));
        }
        resp.json::<T>()
            .await
            .map_err(|e| BillingError::Gateway(format!("response decode failed: {e}")))
    }

    /// Create a one-time order. Amount is an integer in paise.
    pub async fn create_order(
        &self,
        amount: i64,
        currency: &str,
        receipt: &str,
        notes: Option<&HashMap<String, String>>,
    ) -> BillingResult<GatewayOrder> {
        if amount <= 0 {
            return Err(BillingError::Gateway(format!(
                "invalid order amount: {amount}, must be a positive integer in paise"
            )));
        }
        let body = serde_json::to_value(CreateOrderBody {
            amount,
            currency,
            receipt,
            notes,
        })
        .map_err(|e| BillingError::Internal(e.to_string()))?;

        tracing::info!(amount, currency, receipt, "Creating gateway order");
        self.post("/orders", &body).await
    }

    /// Find an existing customer by email, falling back to creation. The
    /// provider rejects duplicate emails, so search-first avoids a 400 on
    /// repeat purchases.
    pub async fn create_customer(
        &self,
        name: &str,
        email: &str,
        contact: &str,
        notes: Option<&HashMap<String, String>>,
    ) -> BillingResult<GatewayCustomer> {
        match self.get::<GatewayCustomerList>("/customers?count=100").await {
            Ok(list) => {
                if let Some(existing) = list
                    .items
                    .into_iter()
                    .find(|c| c.email.as_deref() == Some(email))
                {
                    tracing::info!(customer_id = %existing.id, "Found existing gateway customer");
                    return Ok(existing);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Customer search failed, creating new one");
            }
        }

        let body = serde_json::json!({
            "name": name,
            "email": email,
            "contact": contact,
            "notes": notes,
        });
        self.post("/customers", &body).await
    }

    /// Create a provider-side subscription plan.
    pub async fn create_plan(
        &self,
        plan_ref: &str,
        amount: i64,
        currency: &str,
        interval: &str,
        name: &str,
        description: &str,
    ) -> BillingResult<GatewayPlan> {
        let body = serde_json::json!({
            "period": interval,
            "interval": 1,
            "item": {
                "name": name,
                "amount": amount,
                "currency": currency,
                "description": description,
            },
            "notes": { "planRef": plan_ref },
        });
        tracing::info!(plan_ref, amount, interval, "Creating gateway plan");
        self.post("/plans", &body).await
    }

    /// Create a recurring subscription. `start_at` (unix seconds) delays the
    /// first charge, used for trial-delayed billing. When `notify_customer`
    /// is set the provider drives the authorization flow itself.
    pub async fn create_subscription(
        &self,
        plan_id: &str,
        customer_id: Option<&str>,
        quantity: u32,
        notes: Option<&HashMap<String, String>>,
        start_at: Option<i64>,
        notify_customer: bool,
    ) -> BillingResult<GatewaySubscription> {
        let mut body = serde_json::json!({
            "plan_id": plan_id,
            // Monthly mandates run 12 cycles before renewal of the mandate
            "total_count": 12,
            "quantity": quantity,
            "notes": notes,
        });
        if let Some(map) = body.as_object_mut() {
            if let Some(cid) = customer_id {
                map.insert("customer_id".to_string(), serde_json::json!(cid));
            }
            if let Some(ts) = start_at {
                map.insert("start_at".to_string(), serde_json::json!(ts));
            }
            if notify_customer {
                map.insert("customer_notify".to_string(), serde_json::json!(1));
            }
        }
        tracing::info!(plan_id, ?start_at, notify_customer, "Creating gateway subscription");
        self.post("/subscriptions", &body).await
    }

    /// Cancel a provider-side subscription. Returns the provider's view of
    /// the subscription after cancellation.
    pub async fn cancel_subscription(
        &self,
        provider_subscription_id: &str,
        at_cycle_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        let body = serde_json::json!({
            "cancel_at_cycle_end": if at_cycle_end { 1 } else { 0 },
        });
        tracing::info!(
            provider_subscription_id,
            at_cycle_end,
            "Cancelling gateway subscription"
        );
        self.post(
            &format!("/subscriptions/{provider_subscription_id}/cancel"),
            &body,
        )
        .await
    }

    pub async fn fetch_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        self.get(&format!("/subscriptions/{provider_subscription_id}"))
            .await
    }

    pub async fn fetch_payment(&self, payment_id: &str) -> BillingResult<GatewayPayment> {
        self.get(&format!("/payments/{payment_id}")).await
    }

    /// Verify a checkout payment signature: HMAC-SHA256 of
    /// `order_id|payment_id` with the key secret.
    pub fn verify_payment_signature(
        &self,
        order_id: &str,
        payment_id: &str,
        signature: &str,
    ) -> bool {
        let payload = format!("{order_id}|{payment_id}");
        Self::hmac_matches(&self.config.key_secret, payload.as_bytes(), signature)
    }

    /// Verify a webhook body signature: HMAC-SHA256 of the raw body with the
    /// webhook secret. Callers must pass the body bytes exactly as received.
    pub fn verify_webhook_signature(&self, raw_body: &[u8], signature: &str) -> BillingResult<()> {
        if self.config.webhook_secret.is_empty() {
            tracing::error!("Webhook secret not configured");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        if Self::hmac_matches(&self.config.webhook_secret, raw_body, signature) {
            Ok(())
        } else {
            tracing::error!("Webhook signature mismatch");
            Err(BillingError::WebhookSignatureInvalid)
        }
    }

    // Comparison goes through Mac::verify_slice, which is constant-time
    fn hmac_matches(secret: &str, payload: &[u8], signature: &str) -> bool {
        let Ok(signature_bytes) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&signature_bytes).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> RazorpayClient {
        RazorpayClient::new(RazorpayConfig {
            key_id: "rzp_test_key".to_string(),
            key_secret: "secret".to_string(),
            webhook_secret: "whsec".to_string(),
        })
    }

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_payment_signature_accepts_valid() {
        let client = test_client();
        let sig = sign("secret", b"order_123|pay_456");
        assert!(client.verify_payment_signature("order_123", "pay_456", &sig));
    }

    #[test]
    fn test_payment_signature_rejects_tampered() {
        let client = test_client();
        let sig = sign("secret", b"order_123|pay_456");
        assert!(!client.verify_payment_signature("order_123", "pay_999", &sig));
    }

    #[test]
    fn test_webhook_signature_round_trip() {
        let client = test_client();
        let body = br#"{"event":"payment.captured"}"#;
        let sig = sign("whsec", body);
        assert!(client.verify_webhook_signature(body, &sig).is_ok());
        assert!(client.verify_webhook_signature(body, "deadbeef").is_err());
    }

    #[test]
    fn test_signature_rejects_malformed_hex() {
        let client = test_client();
        let body = br#"{"event":"payment.captured"}"#;
        // Correct length, wrong digest
        let mut wrong = sign("whsec", body);
        wrong.replace_range(0..2, if wrong.starts_with("00") { "11" } else { "00" });
        assert!(client.verify_webhook_signature(body, &wrong).is_err());
        // Not hex at all
        assert!(client.verify_webhook_signature(body, "zz-not-hex").is_err());
        // Truncated digest
        let truncated = &sign("whsec", body)[..10];
        assert!(client.verify_webhook_signature(body, truncated).is_err());
    }

    #[test]
    fn test_terminated_statuses() {
        for status in ["cancelled", "halted", "paused", "Cancelled"] {
            let sub = GatewaySubscription {
                id: "sub_1".to_string(),
                status: Some(status.to_string()),
                plan_id: None,
                customer_id: None,
                total_count: None,
                paid_count: None,
                current_start: None,
                current_end: None,
                charge_at: None,
                start_at: None,
                end_at: None,
                notes: serde_json::Value::Null,
            };
            assert!(sub.is_terminated(), "{status} should be terminated");
        }
        let active = GatewaySubscription {
            id: "sub_1".to_string(),
            status: Some("active".to_string()),
            plan_id: None,
            customer_id: None,
            total_count: None,
            paid_count: None,
            current_start: None,
            current_end: None,
            charge_at: None,
            start_at: None,
            end_at: None,
            notes: serde_json::Value::Null,
        };
        assert!(!active.is_terminated());
    }
}
