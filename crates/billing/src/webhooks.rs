//! Webhook reconciler
//!
//! Consumes Razorpay events and drives the subscription store and credit
//! ledger idempotently. Events are decoded into a tagged union at the ingress
//! boundary before any handler runs; unrecognized event types are
//! acknowledged without state change so the provider stops redelivering.
//!
//! Idempotency is layered: an atomic INSERT...ON CONFLICT...RETURNING claim
//! on `gateway_webhook_events` gives one worker exclusive processing rights
//! per provider event id, and every handler additionally guards its writes
//! with existence checks so replay without an event id is still safe. There
//! is no retry inside this component; redelivery is the provider's job.

use serde::Deserialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use loopsync_shared::AccountType;

use crate::client::RazorpayClient;
use crate::customers::{CustomerDirectory, CustomerRecord};
use crate::eligibility::EligibilityOracle;
use crate::email::BillingEmailService;
use crate::error::{BillingError, BillingResult};
use crate::ledger::CreditLedger;
use crate::plans::{infer_plan_from_amount, BillingCycle, PlanCatalog, PlanCode, PlanRecord,
    TRIAL_CHARGE_PAISE};
use crate::subscriptions::{SubscriptionService, PROVIDER_RAZORPAY};

/// Re-claim events stuck in processing after this long.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Payment entity as delivered in webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEntity {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
    /// Razorpay sends `{}` or `[]` here depending on whether notes exist.
    #[serde(default)]
    pub notes: serde_json::Value,
}

impl PaymentEntity {
    pub fn note_str(&self, key: &str) -> Option<&str> {
        self.notes.get(key).and_then(|v| v.as_str())
    }
}

/// Plan item nested in a subscription entity.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub amount: Option<i64>,
}

/// Subscription entity as delivered in webhook payloads.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionEntity {
    pub id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub start_at: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub item: Option<SubscriptionItem>,
    #[serde(default)]
    pub notes: serde_json::Value,
}

impl SubscriptionEntity {
    pub fn note_str(&self, key: &str) -> Option<&str> {
        self.notes.get(key).and_then(|v| v.as_str())
    }

    /// Charged amount implied by the plan item when no payment entity rides
    /// along: per-unit item amount times quantity.
    pub fn item_amount(&self) -> Option<i64> {
        let amount = self.item.as_ref()?.amount?;
        Some(amount * self.quantity.unwrap_or(1))
    }
}

#[derive(Debug, Deserialize)]
struct EntityWrapper<T> {
    entity: T,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(default)]
    payment: Option<EntityWrapper<PaymentEntity>>,
    #[serde(default)]
    subscription: Option<EntityWrapper<SubscriptionEntity>>,
}

#[derive(Debug, Deserialize)]
struct RawWebhook {
    event: String,
    #[serde(default)]
    payload: Option<RawPayload>,
}

/// The five event families the reconciler acts on, decoded before dispatch.
#[derive(Debug)]
pub enum GatewayEvent {
    PaymentCaptured(PaymentEntity),
    PaymentFailed(PaymentEntity),
    SubscriptionActivated {
        subscription: SubscriptionEntity,
        payment: Option<PaymentEntity>,
    },
    SubscriptionCancelled(SubscriptionEntity),
    SubscriptionAuthorized {
        subscription: SubscriptionEntity,
        payment: Option<PaymentEntity>,
    },
    Unrecognized {
        event: String,
    },
}

impl GatewayEvent {
    /// Decode a raw webhook body. `subscription.updated` counts as an
    /// authorization only while the provider status is `authorized`;
    /// any other update is unrecognized and acknowledged unchanged.
    pub fn decode(body: &[u8]) -> BillingResult<Self> {
        let raw: RawWebhook = serde_json::from_slice(body)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
        let payload = raw.payload.unwrap_or_default();
        let payment = payload.payment.map(|w| w.entity);
        let subscription = payload.subscription.map(|w| w.entity);

        let missing =
            |what: &str| BillingError::WebhookPayloadInvalid(format!("{what} entity missing"));

        Ok(match raw.event.as_str() {
            "payment.captured" => {
                GatewayEvent::PaymentCaptured(payment.ok_or_else(|| missing("payment"))?)
            }
            "payment.failed" => {
                GatewayEvent::PaymentFailed(payment.ok_or_else(|| missing("payment"))?)
            }
            "subscription.activated" | "subscription.charged" => {
                GatewayEvent::SubscriptionActivated {
                    subscription: subscription.ok_or_else(|| missing("subscription"))?,
                    payment,
                }
            }
            "subscription.cancelled" => {
                GatewayEvent::SubscriptionCancelled(subscription.ok_or_else(|| missing("subscription"))?)
            }
            "subscription.authorized" => GatewayEvent::SubscriptionAuthorized {
                subscription: subscription.ok_or_else(|| missing("subscription"))?,
                payment,
            },
            "subscription.updated" => match subscription {
                Some(sub) if sub.status.as_deref() == Some("authorized") => {
                    GatewayEvent::SubscriptionAuthorized {
                        subscription: sub,
                        payment,
                    }
                }
                _ => GatewayEvent::Unrecognized { event: raw.event },
            },
            _ => GatewayEvent::Unrecognized { event: raw.event },
        })
    }
}

/// Result of handling one event. `Duplicate` and `Ignored` are successes:
/// the provider must not redeliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(String),
    Duplicate,
    Ignored(String),
}

/// Outcome of the amount and trial validation for an activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationCheck {
    pub is_free_trial: bool,
}

/// Validate an activation's charge before any state change.
///
/// Trial classification applies to the PRO tier only: an explicit trial end
/// in the future, or a charge at or below the micro-charge threshold. A
/// non-trial charge below the plan's cycle price is rejected so a short
/// payment never grants access; a missing charge amount skips the check.
pub fn assess_activation(
    plan_code: Option<PlanCode>,
    expected_amount: i64,
    trial_end: Option<i64>,
    now_unix: i64,
    charged_amount: Option<i64>,
) -> Result<ActivationCheck, BillingError> {
    let amount = charged_amount.unwrap_or(0);
    let mut is_free_trial = false;
    if plan_code == Some(PlanCode::Pro) {
        if let Some(trial_end) = trial_end {
            is_free_trial = trial_end > now_unix;
        }
        if !is_free_trial && amount <= TRIAL_CHARGE_PAISE {
            is_free_trial = true;
        }
    }

    if !is_free_trial {
        if let Some(paid) = charged_amount {
            if expected_amount > 0 && paid < expected_amount {
                return Err(BillingError::UnderpaidSubscription {
                    paid,
                    expected: expected_amount,
                });
            }
        }
    }

    Ok(ActivationCheck { is_free_trial })
}

pub struct WebhookHandler {
    pool: PgPool,
    gateway: RazorpayClient,
    customers: CustomerDirectory,
    eligibility: EligibilityOracle,
    ledger: CreditLedger,
    subscriptions: SubscriptionService,
    email: BillingEmailService,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, gateway: RazorpayClient, email: BillingEmailService) -> Self {
        Self {
            customers: CustomerDirectory::new(pool.clone()),
            eligibility: EligibilityOracle::new(pool.clone()),
            ledger: CreditLedger::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone(), gateway.clone()),
            pool,
            gateway,
            email,
        }
    }

    fn plans(&self) -> PlanCatalog {
        PlanCatalog::new(self.pool.clone())
    }

    /// Verify the body signature, decode, and process. The provider event id
    /// arrives in the `x-razorpay-event-id` header; when present it drives
    /// the atomic idempotency claim.
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature: &str,
        provider_event_id: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        self.gateway.verify_webhook_signature(raw_body, signature)?;
        let event = GatewayEvent::decode(raw_body)?;
        self.handle_event(event, provider_event_id).await
    }

    /// Process a pre-verified, decoded event.
    pub async fn handle_event(
        &self,
        event: GatewayEvent,
        provider_event_id: Option<&str>,
    ) -> BillingResult<WebhookOutcome> {
        if let GatewayEvent::Unrecognized { event } = &event {
            tracing::info!(event = %event, "Unrecognized gateway event, acknowledging");
            return Ok(WebhookOutcome::Ignored(format!("event {event} not handled")));
        }

        let claim_id = match provider_event_id {
            Some(id) => match self.claim_event(id, &event).await? {
                Some(claim) => Some((id.to_string(), claim)),
                None => return Ok(WebhookOutcome::Duplicate),
            },
            // No event id on this delivery; rely on handler existence checks
            None => None,
        };

        let result = self.dispatch(event).await;

        if let Some((event_id, _)) = claim_id {
            let (processing_result, error_message) = match &result {
                Ok(_) => ("success", None),
                Err(e) => ("error", Some(e.to_string())),
            };
            if let Err(e) = sqlx::query(
                "UPDATE gateway_webhook_events
                 SET processing_result = $1, error_message = $2
                 WHERE provider_event_id = $3",
            )
            .bind(processing_result)
            .bind(&error_message)
            .bind(&event_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    provider_event_id = %event_id,
                    error = %e,
                    "Failed to record webhook processing result"
                );
            }
        }

        result
    }

    /// Atomically claim exclusive processing rights for an event id. Only one
    /// concurrent request gets a row back. Two states may be re-claimed: an
    /// event stuck in `processing` beyond the timeout, and an event whose
    /// last attempt ended in `error`, so the provider's redelivery retries
    /// failed work instead of short-circuiting as a duplicate.
    async fn claim_event(
        &self,
        provider_event_id: &str,
        event: &GatewayEvent,
    ) -> BillingResult<Option<Uuid>> {
        let event_type = match event {
            GatewayEvent::PaymentCaptured(_) => "payment.captured",
            GatewayEvent::PaymentFailed(_) => "payment.failed",
            GatewayEvent::SubscriptionActivated { .. } => "subscription.activated",
            GatewayEvent::SubscriptionCancelled(_) => "subscription.cancelled",
            GatewayEvent::SubscriptionAuthorized { .. } => "subscription.authorized",
            GatewayEvent::Unrecognized { .. } => "unrecognized",
        };

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO gateway_webhook_events
                (provider_event_id, event_type, processing_result, processing_started_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Reclaimed for retry at ', NOW()::TEXT)
            WHERE gateway_webhook_events.processing_result = 'error'
               OR (gateway_webhook_events.processing_result = 'processing'
                   AND gateway_webhook_events.processing_started_at < NOW() - ($3 || ' minutes')::INTERVAL)
            RETURNING id
            "#,
        )
        .bind(provider_event_id)
        .bind(event_type)
        .bind(PROCESSING_TIMEOUT_MINUTES.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                provider_event_id,
                event_type,
                "Webhook event already claimed, skipping"
            );
        }
        Ok(claimed.map(|(id,)| id))
    }

    async fn dispatch(&self, event: GatewayEvent) -> BillingResult<WebhookOutcome> {
        match event {
            GatewayEvent::PaymentCaptured(payment) => self.handle_payment_captured(payment).await,
            GatewayEvent::PaymentFailed(payment) => self.handle_payment_failed(payment).await,
            GatewayEvent::SubscriptionActivated {
                subscription,
                payment,
            } => self.handle_subscription_activated(subscription, payment).await,
            GatewayEvent::SubscriptionCancelled(subscription) => {
                self.handle_subscription_cancelled(subscription).await
            }
            GatewayEvent::SubscriptionAuthorized {
                subscription,
                payment,
            } => self.handle_subscription_authorized(subscription, payment).await,
            GatewayEvent::Unrecognized { event } => {
                Ok(WebhookOutcome::Ignored(format!("event {event} not handled")))
            }
        }
    }

    async fn resolve_user(
        &self,
        note_user_id: Option<&str>,
        email: Option<&str>,
    ) -> BillingResult<CustomerRecord> {
        if let Some(id) = note_user_id.and_then(|s| Uuid::parse_str(s).ok()) {
            if let Some(user) = self.customers.find_by_id(id).await? {
                return Ok(user);
            }
        }
        if let Some(email) = email {
            if let Some(user) = self.customers.find_by_email(email).await? {
                return Ok(user);
            }
        }
        Err(BillingError::CustomerNotFound(format!(
            "user_id={:?} email={:?}",
            note_user_id, email
        )))
    }

    async fn mark_trial_used_best_effort(&self, email: &str) {
        if let Err(e) = self.eligibility.mark_email_as_used(email).await {
            tracing::error!(email = %email, error = %e, "Failed to mark trial email as used");
        }
    }

    async fn send_success_email_best_effort(
        &self,
        user: &CustomerRecord,
        plan_name: &str,
        amount: i64,
    ) {
        if let Err(e) = self
            .email
            .send_payment_success(&user.email, user.display_name(), plan_name, amount)
            .await
        {
            tracing::warn!(email = %user.email, error = %e, "Payment success email failed");
        }
    }

    /// One-time payment captured: ensure the customer has an active
    /// subscription for the purchased plan, detect the trial micro-charge,
    /// notify. Replay with an existing ACTIVE row skips creation.
    async fn handle_payment_captured(
        &self,
        payment: PaymentEntity,
    ) -> BillingResult<WebhookOutcome> {
        let user = self
            .resolve_user(payment.note_str("userId"), payment.email.as_deref())
            .await?;
        let plan_code = payment
            .note_str("planCode")
            .ok_or_else(|| {
                BillingError::WebhookPayloadInvalid("planCode missing from payment notes".to_string())
            })?;
        let plan = self.plans().require_by_code(plan_code).await?;

        self.customers
            .set_account_type(user.id, AccountType::Customer)
            .await?;

        // Trial purchases are charged exactly the micro-charge amount
        let is_free_trial = payment.amount == TRIAL_CHARGE_PAISE;
        if is_free_trial {
            self.mark_trial_used_best_effort(&user.email).await;
        }

        match self.subscriptions.get_active(user.id).await? {
            None => {
                let created = self
                    .subscriptions
                    .create_subscription(user.id, plan.id, PROVIDER_RAZORPAY, None, Some(&payment.id))
                    .await?;
                tracing::info!(
                    user_id = %user.id,
                    subscription_id = %created.id,
                    payment_id = %payment.id,
                    is_free_trial,
                    "Subscription created from one-time payment"
                );
            }
            Some(existing) => {
                tracing::info!(
                    user_id = %user.id,
                    subscription_id = %existing.id,
                    "Active subscription already exists, skipping creation"
                );
            }
        }

        self.send_success_email_best_effort(&user, &plan.display_name(), payment.amount)
            .await;
        Ok(WebhookOutcome::Processed("payment processed".to_string()))
    }

    /// Recurring charge or provider-side activation. Validates the charged
    /// amount against the plan's cycle price, upserts the local row by
    /// provider id, converges to one ACTIVE row and reinitializes the
    /// ledger's cycle allotment.
    async fn handle_subscription_activated(
        &self,
        subscription: SubscriptionEntity,
        payment: Option<PaymentEntity>,
    ) -> BillingResult<WebhookOutcome> {
        let email = subscription
            .customer_email
            .clone()
            .or_else(|| subscription.note_str("email").map(str::to_string))
            .or_else(|| payment.as_ref().and_then(|p| p.email.clone()));
        let user = self
            .resolve_user(subscription.note_str("userId"), email.as_deref())
            .await?;

        let cycle = subscription
            .note_str("billingCycle")
            .map(BillingCycle::parse_lenient)
            .unwrap_or(BillingCycle::Monthly);
        // When no payment entity rides along, fall back to the plan item's
        // per-unit amount before defaulting to zero
        let charged = payment
            .as_ref()
            .map(|p| p.amount)
            .or_else(|| subscription.item_amount());
        let amount = charged.unwrap_or(0);

        let plan = self.resolve_plan(&subscription, amount, cycle).await?;

        let check = assess_activation(
            plan.plan_code(),
            plan.amount_for_cycle(cycle),
            subscription.trial_end,
            OffsetDateTime::now_utc().unix_timestamp(),
            charged,
        );
        let is_free_trial = match check {
            Ok(check) => check.is_free_trial,
            Err(e) => {
                if let BillingError::UnderpaidSubscription { paid, expected } = &e {
                    tracing::warn!(
                        user_id = %user.id,
                        paid = *paid,
                        expected = *expected,
                        plan = %plan.code,
                        cycle = %cycle,
                        "Subscription charge below expected amount, skipping activation"
                    );
                }
                return Err(e);
            }
        };

        let start_date = subscription
            .start_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());

        let local = match self
            .subscriptions
            .find_for_activation(&subscription.id, user.id)
            .await?
        {
            None => {
                let created = self
                    .subscriptions
                    .create_recurring_subscription(
                        user.id,
                        plan.id,
                        &subscription.id,
                        start_date,
                        Some(cycle),
                    )
                    .await?;
                tracing::info!(
                    user_id = %user.id,
                    subscription_id = %created.id,
                    provider_subscription_id = %subscription.id,
                    "Subscription created from webhook"
                );
                created
            }
            Some(existing) => {
                let updated = self
                    .subscriptions
                    .mark_active(existing.id, &subscription.id, start_date)
                    .await?;
                tracing::info!(
                    user_id = %user.id,
                    subscription_id = %updated.id,
                    provider_subscription_id = %subscription.id,
                    "Existing subscription refreshed from webhook"
                );
                updated
            }
        };

        self.customers
            .set_account_type(user.id, AccountType::Customer)
            .await?;

        if is_free_trial {
            self.mark_trial_used_best_effort(&user.email).await;
        }

        self.subscriptions
            .cancel_other_active(user.id, local.id)
            .await?;

        // Initialize the cycle's prepaid allotment; failure here needs
        // manual reconciliation but must not bounce the webhook
        if let Err(e) = self.ledger.sync_subscription(user.id, Some(local.id)).await {
            tracing::error!(
                user_id = %user.id,
                subscription_id = %local.id,
                error = %e,
                "Ledger sync after activation failed, needs reconciliation"
            );
        }

        self.send_success_email_best_effort(&user, &plan.display_name(), amount)
            .await;
        Ok(WebhookOutcome::Processed(format!(
            "subscription {} activated",
            subscription.id
        )))
    }

    /// Plan from notes metadata, with amount-based inference as the
    /// documented fallback when notes are absent.
    async fn resolve_plan(
        &self,
        subscription: &SubscriptionEntity,
        amount: i64,
        cycle: BillingCycle,
    ) -> BillingResult<PlanRecord> {
        if let Some(code) = subscription.note_str("planCode") {
            if let Some(plan) = self.plans().find_by_code(code).await? {
                return Ok(plan);
            }
        }
        let inferred = infer_plan_from_amount(amount, cycle).ok_or_else(|| {
            BillingError::PlanNotFound(format!("no plan matches amount {amount} for {cycle}"))
        })?;
        tracing::info!(
            provider_subscription_id = %subscription.id,
            amount,
            inferred = %inferred,
            "Plan inferred from charged amount"
        );
        self.plans().require_by_code(inferred.as_str()).await
    }

    /// Provider-reported cancellation. A provider id this system never
    /// tracked is acknowledged without action.
    async fn handle_subscription_cancelled(
        &self,
        subscription: SubscriptionEntity,
    ) -> BillingResult<WebhookOutcome> {
        let Some(local) = self
            .subscriptions
            .find_by_provider_id(&subscription.id)
            .await?
        else {
            tracing::info!(
                provider_subscription_id = %subscription.id,
                "Cancellation for untracked subscription, no action taken"
            );
            return Ok(WebhookOutcome::Ignored(
                "subscription not tracked locally".to_string(),
            ));
        };

        let cancelled = self.subscriptions.cancel_local(local.id).await?;
        let user = self.customers.require_by_id(cancelled.user_id).await?;
        let plan = self.plans().require_by_id(cancelled.plan_id).await?;

        let end_date = cancelled
            .expires_at
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| cancelled.expires_at.to_string());
        if let Err(e) = self
            .email
            .send_subscription_cancelled(
                &user.email,
                user.display_name(),
                &plan.display_name(),
                &end_date,
            )
            .await
        {
            tracing::warn!(email = %user.email, error = %e, "Cancellation email failed");
        }

        Ok(WebhookOutcome::Processed(format!(
            "subscription {} cancelled",
            subscription.id
        )))
    }

    /// Authorization precedes the first real charge. Acknowledge and mark
    /// the trial email as used; never create or activate anything here, or
    /// access would be granted before payment.
    async fn handle_subscription_authorized(
        &self,
        subscription: SubscriptionEntity,
        payment: Option<PaymentEntity>,
    ) -> BillingResult<WebhookOutcome> {
        let mut email = subscription
            .note_str("email")
            .map(str::to_string)
            .or_else(|| subscription.customer_email.clone())
            .or_else(|| payment.as_ref().and_then(|p| p.email.clone()));

        if email.is_none() {
            // Payload is silent; the locally linked row may know the owner
            if let Some(local) = self
                .subscriptions
                .find_by_provider_id(&subscription.id)
                .await?
            {
                email = self
                    .customers
                    .find_by_id(local.user_id)
                    .await?
                    .map(|u| u.email);
            }
        }

        match email {
            Some(email) => {
                self.mark_trial_used_best_effort(&email).await;
                Ok(WebhookOutcome::Processed(
                    "authorization acknowledged".to_string(),
                ))
            }
            None => {
                tracing::warn!(
                    provider_subscription_id = %subscription.id,
                    "No email resolvable for authorized subscription"
                );
                Ok(WebhookOutcome::Ignored(
                    "no email resolvable for authorization".to_string(),
                ))
            }
        }
    }

    /// Payment failure: notify only, no ledger or subscription mutation.
    async fn handle_payment_failed(&self, payment: PaymentEntity) -> BillingResult<WebhookOutcome> {
        let email = payment.email.as_deref().ok_or_else(|| {
            BillingError::WebhookPayloadInvalid("email missing from failed payment".to_string())
        })?;
        let user = self.customers.require_by_email(email).await?;

        let description = match (&payment.error_code, &payment.error_description) {
            (Some(code), Some(desc)) => format!("{desc} ({code})"),
            (None, Some(desc)) => desc.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "Payment could not be processed".to_string(),
        };
        if let Err(e) = self
            .email
            .send_payment_failed(&user.email, user.display_name(), payment.amount, &description)
            .await
        {
            tracing::warn!(email = %user.email, error = %e, "Payment failure email failed");
        }

        tracing::info!(
            user_id = %user.id,
            payment_id = %payment.id,
            error_code = ?payment.error_code,
            "Payment failure processed"
        );
        Ok(WebhookOutcome::Processed("payment failure processed".to_string()))
    }

    /// Manual recovery path for a client-confirmed activation the webhook
    /// never delivered: create the row, cancel the superseded one, leave the
    /// ledger to the explicit reset endpoint.
    pub async fn activate_subscription_fallback(
        &self,
        user_id: Uuid,
        plan_code: &str,
        billing_cycle: &str,
        is_recurring: bool,
        provider_subscription_id: Option<&str>,
        provider_payment_id: Option<&str>,
    ) -> BillingResult<Uuid> {
        let plan = self.plans().require_by_code(plan_code).await?;
        let existing_active = self.subscriptions.get_active(user_id).await?;
        let cycle = BillingCycle::parse_lenient(billing_cycle);

        let created = match (is_recurring, provider_subscription_id) {
            (true, Some(provider_id)) => {
                self.subscriptions
                    .create_recurring_subscription(
                        user_id,
                        plan.id,
                        provider_id,
                        Some(OffsetDateTime::now_utc()),
                        Some(cycle),
                    )
                    .await?
            }
            _ => {
                self.subscriptions
                    .create_subscription(user_id, plan.id, PROVIDER_RAZORPAY, None, provider_payment_id)
                    .await?
            }
        };

        if let Some(previous) = existing_active {
            if let Err(e) = self.subscriptions.cancel(previous.id).await {
                tracing::warn!(
                    subscription_id = %previous.id,
                    error = %e,
                    "Superseded subscription cancel failed during fallback activation"
                );
            }
        }

        tracing::info!(
            %user_id,
            subscription_id = %created.id,
            plan = %plan.code,
            "Subscription activated via fallback path"
        );
        Ok(created.id)
    }
}
