//! Payment provider webhook processing
//!
//! Every delivery is verified, claimed by event id, ordered against the
//! account's last applied event and only then dispatched to the
//! subscription lifecycle. Failures release the claim so the provider's
//! redelivery can apply the event later.

mod payload;
mod signature;
mod store;

pub use payload::{EventKind, InvoiceObject, ProviderEvent, SubscriptionObject};
pub use signature::{compute_signature, verify_signature, SIGNATURE_TOLERANCE_SECS};
pub use store::{
    ClaimResult, InMemoryWebhookEventStore, PgWebhookEventStore, WebhookEventRecord,
    WebhookEventStore, WebhookOutcome, PROCESSING_TIMEOUT_MINUTES,
};

use std::sync::Arc;

use clipmeter_shared::SubscriptionTier;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PriceIds;
use crate::error::{BillingError, BillingResult};
use crate::ledger::Account;
use crate::subscriptions::{ProviderSubscription, SubscriptionService};

/// What happened to a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookDisposition {
    Applied,
    Ignored,
    Stale,
    /// Already settled or in flight under another delivery
    Duplicate,
}

impl From<WebhookOutcome> for WebhookDisposition {
    fn from(outcome: WebhookOutcome) -> Self {
        match outcome {
            WebhookOutcome::Applied => WebhookDisposition::Applied,
            WebhookOutcome::Stale => WebhookDisposition::Stale,
            _ => WebhookDisposition::Ignored,
        }
    }
}

#[derive(Clone)]
pub struct WebhookHandler {
    subscriptions: SubscriptionService,
    events: Arc<dyn WebhookEventStore>,
    webhook_secret: String,
    prices: PriceIds,
}

impl WebhookHandler {
    pub fn new(
        subscriptions: SubscriptionService,
        events: Arc<dyn WebhookEventStore>,
        webhook_secret: impl Into<String>,
        prices: PriceIds,
    ) -> Self {
        Self {
            subscriptions,
            events,
            webhook_secret: webhook_secret.into(),
            prices,
        }
    }

    /// Verify, parse and apply a raw delivery
    pub async fn handle(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<WebhookDisposition> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature_header, &self.webhook_secret, now)?;

        let event: ProviderEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookPayload(e.to_string()))?;

        self.handle_event(event).await
    }

    /// Apply an already verified event
    pub async fn handle_event(&self, event: ProviderEvent) -> BillingResult<WebhookDisposition> {
        let created_at = event.created_at()?;

        match self
            .events
            .claim(&event.id, &event.event_type, created_at)
            .await?
        {
            ClaimResult::Claimed => {}
            ClaimResult::AlreadyClaimed(outcome) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = %outcome,
                    "Skipping duplicate webhook delivery"
                );
                return Ok(WebhookDisposition::Duplicate);
            }
        }

        match self.process_event_internal(&event, created_at).await {
            Ok((outcome, account_id)) => {
                self.events.finish(&event.id, outcome, account_id).await?;
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = %outcome,
                    account_id = ?account_id,
                    "Processed webhook event"
                );
                Ok(outcome.into())
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook processing failed"
                );
                if let Err(release_err) = self.events.release(&event.id, &e.to_string()).await {
                    tracing::error!(
                        event_id = %event.id,
                        error = %release_err,
                        "Failed to release webhook claim"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn recent_events(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        self.events.recent(outcome, limit).await
    }

    async fn process_event_internal(
        &self,
        event: &ProviderEvent,
        created_at: OffsetDateTime,
    ) -> BillingResult<(WebhookOutcome, Option<Uuid>)> {
        let kind = event.kind();
        let (metadata_account, customer) = match kind {
            EventKind::SubscriptionCreated
            | EventKind::SubscriptionUpdated
            | EventKind::SubscriptionDeleted => {
                let sub: SubscriptionObject = event.object()?;
                (sub.account_id(), sub.customer)
            }
            EventKind::PaymentSucceeded | EventKind::PaymentFailed => {
                let invoice: InvoiceObject = event.object()?;
                (invoice.account_id(), invoice.customer)
            }
            EventKind::Other => {
                tracing::debug!(event_type = %event.event_type, "Unhandled webhook event type");
                return Ok((WebhookOutcome::Ignored, None));
            }
        };

        let Some(account_id) = self
            .resolve_account(metadata_account, customer.as_deref())
            .await?
        else {
            tracing::warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                customer = ?customer,
                "Webhook event does not match any account"
            );
            return Ok((WebhookOutcome::Ignored, None));
        };

        let _guard = self.subscriptions.locks().lock(account_id).await;

        let store = self.subscriptions.credits().store();
        if !store.advance_event_clock(account_id, created_at).await? {
            tracing::warn!(
                event_id = %event.id,
                account_id = %account_id,
                created_at = %created_at,
                "Discarding webhook event older than the last applied one"
            );
            return Ok((WebhookOutcome::Stale, Some(account_id)));
        }

        let account = self.subscriptions.credits().account(account_id).await?;
        let outcome = match kind {
            EventKind::SubscriptionCreated => {
                self.handle_subscription_created(&account, event.object()?)
                    .await?
            }
            EventKind::SubscriptionUpdated => {
                self.handle_subscription_updated(&account, event.object()?)
                    .await?
            }
            EventKind::SubscriptionDeleted => {
                self.handle_subscription_deleted(&account, event.object()?)
                    .await?
            }
            EventKind::PaymentSucceeded => {
                self.handle_payment_succeeded(&account, event.object()?)
                    .await?
            }
            EventKind::PaymentFailed => {
                self.handle_payment_failed(&account, event.object()?)
                    .await?
            }
            EventKind::Other => WebhookOutcome::Ignored,
        };

        Ok((outcome, Some(account_id)))
    }

    async fn resolve_account(
        &self,
        metadata_account: Option<Uuid>,
        customer: Option<&str>,
    ) -> BillingResult<Option<Uuid>> {
        let credits = self.subscriptions.credits();

        if let Some(account_id) = metadata_account {
            match credits.account(account_id).await {
                Ok(account) => return Ok(Some(account.account_id)),
                Err(BillingError::AccountNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        match customer {
            Some(customer_ref) => Ok(credits
                .store()
                .find_account_by_customer(customer_ref)
                .await?
                .map(|account| account.account_id)),
            None => Ok(None),
        }
    }

    fn tier_of(&self, sub: &SubscriptionObject) -> Option<SubscriptionTier> {
        sub.metadata
            .get("tier")
            .and_then(|tier| tier.parse().ok())
            .or_else(|| sub.price_id().and_then(|price| self.prices.tier_for_price(price)))
    }

    fn provider_subscription(
        &self,
        sub: &SubscriptionObject,
        tier: SubscriptionTier,
    ) -> ProviderSubscription {
        ProviderSubscription {
            subscription_ref: sub.id.clone(),
            customer_ref: sub.customer.clone(),
            tier,
            status: sub.status(),
            period_start: sub.period_start(),
            period_end: sub.period_end(),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }

    async fn handle_subscription_created(
        &self,
        account: &Account,
        sub: SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        let tier = self.tier_of(&sub).ok_or_else(|| {
            BillingError::WebhookPayload(format!("cannot determine tier of subscription {}", sub.id))
        })?;
        if !tier.is_paid() {
            return Ok(WebhookOutcome::Ignored);
        }

        let subscription = self.provider_subscription(&sub, tier);
        self.subscriptions
            .apply_subscription_created(account, &subscription)
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_subscription_updated(
        &self,
        account: &Account,
        sub: SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        if !tracks_subscription(account, &sub.id) {
            return Ok(WebhookOutcome::Ignored);
        }

        let tier = self.tier_of(&sub).unwrap_or(account.subscription_tier);
        let subscription = self.provider_subscription(&sub, tier);
        self.subscriptions
            .apply_subscription_updated(account, &subscription)
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_subscription_deleted(
        &self,
        account: &Account,
        sub: SubscriptionObject,
    ) -> BillingResult<WebhookOutcome> {
        if !tracks_subscription(account, &sub.id) {
            return Ok(WebhookOutcome::Ignored);
        }

        self.subscriptions.apply_subscription_deleted(account).await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_payment_succeeded(
        &self,
        account: &Account,
        invoice: InvoiceObject,
    ) -> BillingResult<WebhookOutcome> {
        if invoice.is_subscription_create() {
            tracing::info!(
                account_id = %account.account_id,
                invoice_id = %invoice.id,
                "Skipping renewal for initial subscription invoice"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        let Some(subscription_ref) = invoice.subscription_ref() else {
            return Ok(WebhookOutcome::Ignored);
        };
        if account.external_subscription_ref.as_deref() != Some(subscription_ref) {
            tracing::warn!(
                account_id = %account.account_id,
                invoice_id = %invoice.id,
                subscription_id = %subscription_ref,
                "Invoice paid for a subscription the account does not hold"
            );
            return Ok(WebhookOutcome::Ignored);
        }

        self.subscriptions
            .apply_payment_succeeded(account, invoice.period_start(), invoice.period_end())
            .await?;
        Ok(WebhookOutcome::Applied)
    }

    async fn handle_payment_failed(
        &self,
        account: &Account,
        invoice: InvoiceObject,
    ) -> BillingResult<WebhookOutcome> {
        match invoice.subscription_ref() {
            Some(subscription_ref)
                if account.external_subscription_ref.as_deref() == Some(subscription_ref) =>
            {
                self.subscriptions.apply_payment_failed(account).await?;
                Ok(WebhookOutcome::Applied)
            }
            _ => Ok(WebhookOutcome::Ignored),
        }
    }
}

/// Events for an older subscription must not touch the current one
fn tracks_subscription(account: &Account, subscription_ref: &str) -> bool {
    match account.external_subscription_ref.as_deref() {
        Some(current) => current == subscription_ref,
        None => true,
    }
}
