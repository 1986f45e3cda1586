//! Payment provider client
//!
//! [`PaymentProvider`] is the narrow surface the subscription manager needs
//! from the provider. [`StripeClient`] implements it on `async-stripe`, with
//! transient failures retried under exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use clipmeter_shared::{BillingInterval, SubscriptionTier};
use serde::Serialize;
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use stripe::{
    CheckoutSession, CheckoutSessionMode, CreateCheckoutSession, CreateCheckoutSessionLineItems,
    CreateCheckoutSessionSubscriptionData, CreateCustomer, Customer, CustomerId, Subscription,
    SubscriptionId, UpdateSubscription, UpdateSubscriptionItems,
};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Attempts after the first call for transient provider failures
const PROVIDER_RETRIES: usize = 3;

/// Hosted checkout session the user is redirected to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutRedirect {
    pub session_id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub account_id: Uuid,
    pub customer_ref: String,
    pub tier: SubscriptionTier,
    pub interval: BillingInterval,
}

/// Operations the lifecycle manager performs against the payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a provider customer for an account; returns its reference
    async fn create_customer(&self, account_id: Uuid) -> BillingResult<String>;

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutRedirect>;

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<()>;

    /// Switch the subscription to the tier's price with proration
    async fn change_subscription_tier(
        &self,
        subscription_ref: &str,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<()>;
}

/// Provider price ids per paid tier and interval
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub basic_monthly: Option<String>,
    pub basic_annual: Option<String>,
    pub premium_monthly: Option<String>,
    pub premium_annual: Option<String>,
    pub enterprise_monthly: Option<String>,
    pub enterprise_annual: Option<String>,
}

impl PriceIds {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            basic_monthly: var("STRIPE_PRICE_BASIC_MONTHLY"),
            basic_annual: var("STRIPE_PRICE_BASIC_ANNUAL"),
            premium_monthly: var("STRIPE_PRICE_PREMIUM_MONTHLY"),
            premium_annual: var("STRIPE_PRICE_PREMIUM_ANNUAL"),
            enterprise_monthly: var("STRIPE_PRICE_ENTERPRISE_MONTHLY"),
            enterprise_annual: var("STRIPE_PRICE_ENTERPRISE_ANNUAL"),
        }
    }

    pub fn price_for(&self, tier: SubscriptionTier, interval: BillingInterval) -> Option<&str> {
        let price = match (tier, interval) {
            (SubscriptionTier::Free, _) => None,
            (SubscriptionTier::Basic, BillingInterval::Monthly) => self.basic_monthly.as_ref(),
            (SubscriptionTier::Basic, BillingInterval::Annual) => self.basic_annual.as_ref(),
            (SubscriptionTier::Premium, BillingInterval::Monthly) => self.premium_monthly.as_ref(),
            (SubscriptionTier::Premium, BillingInterval::Annual) => self.premium_annual.as_ref(),
            (SubscriptionTier::Enterprise, BillingInterval::Monthly) => {
                self.enterprise_monthly.as_ref()
            }
            (SubscriptionTier::Enterprise, BillingInterval::Annual) => {
                self.enterprise_annual.as_ref()
            }
        };
        price.map(String::as_str)
    }

    /// Reverse lookup used when a provider event carries a price but no tier
    pub fn tier_for_price(&self, price_id: &str) -> Option<SubscriptionTier> {
        SubscriptionTier::ALL.into_iter().find(|tier| {
            [BillingInterval::Monthly, BillingInterval::Annual]
                .into_iter()
                .any(|interval| self.price_for(*tier, interval) == Some(price_id))
        })
    }
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub prices: PriceIds,
    pub success_url: String,
    pub cancel_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::ProviderNotConfigured)?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::ProviderNotConfigured)?;

        Ok(Self {
            secret_key,
            webhook_secret,
            prices: PriceIds::from_env(),
            success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/success".to_string()),
            cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| "http://localhost:3000/billing/cancel".to_string()),
        })
    }
}

/// Stripe-backed payment provider
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            inner: stripe::Client::new(config.secret_key.clone()),
            config,
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn price_for(&self, tier: SubscriptionTier, interval: BillingInterval) -> BillingResult<String> {
        self.config
            .prices
            .price_for(tier, interval)
            .map(str::to_string)
            .ok_or_else(|| {
                BillingError::InvalidTier(format!("no {interval} price configured for {tier}"))
            })
    }
}

fn parse_subscription_id(subscription_ref: &str) -> BillingResult<SubscriptionId> {
    subscription_ref
        .parse::<SubscriptionId>()
        .map_err(|e| BillingError::InvalidInput(format!("invalid subscription id: {e}")))
}

/// Run a provider call, retrying only transient failures
async fn with_retry<T, F, Fut>(operation: &'static str, call: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let strategy = ExponentialBackoff::from_millis(10)
        .factor(5)
        .max_delay(Duration::from_secs(2))
        .map(jitter)
        .take(PROVIDER_RETRIES);

    RetryIf::spawn(strategy, call, |e: &BillingError| {
        let retry = e.is_transient();
        if retry {
            tracing::warn!(operation = operation, error = %e, "Payment provider call failed; retrying");
        }
        retry
    })
    .await
    .inspect_err(|e| {
        tracing::error!(operation = operation, error = %e, "Payment provider call failed");
    })
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_customer(&self, account_id: Uuid) -> BillingResult<String> {
        let customer = with_retry("create_customer", || {
            let client = self.inner.clone();
            async move {
                let mut metadata = HashMap::new();
                metadata.insert("account_id".to_string(), account_id.to_string());
                let params = CreateCustomer {
                    metadata: Some(metadata),
                    ..Default::default()
                };
                Ok(Customer::create(&client, params).await?)
            }
        })
        .await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %customer.id,
            "Created Stripe customer"
        );
        Ok(customer.id.to_string())
    }

    async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> BillingResult<CheckoutRedirect> {
        let price_id = self.price_for(request.tier, request.interval)?;
        let customer_id = request
            .customer_ref
            .parse::<CustomerId>()
            .map_err(|e| BillingError::InvalidInput(format!("invalid customer id: {e}")))?;
        let tier = request.tier;
        let account_id = request.account_id.to_string();

        let session = with_retry("create_checkout_session", || {
            let client = self.inner.clone();
            let config = self.config.clone();
            let customer_id = customer_id.clone();
            let price_id = price_id.clone();
            let account_id = account_id.clone();
            async move {
                let mut metadata = HashMap::new();
                metadata.insert("account_id".to_string(), account_id.clone());
                metadata.insert("tier".to_string(), tier.to_string());

                let mut params = CreateCheckoutSession::new();
                params.mode = Some(CheckoutSessionMode::Subscription);
                params.customer = Some(customer_id);
                params.client_reference_id = Some(&account_id);
                params.success_url = Some(&config.success_url);
                params.cancel_url = Some(&config.cancel_url);
                params.line_items = Some(vec![CreateCheckoutSessionLineItems {
                    price: Some(price_id),
                    quantity: Some(1),
                    ..Default::default()
                }]);
                params.metadata = Some(metadata.clone());
                // Subscription events carry these, which is how webhooks find the account
                params.subscription_data = Some(CreateCheckoutSessionSubscriptionData {
                    metadata: Some(metadata),
                    ..Default::default()
                });

                Ok(CheckoutSession::create(&client, params).await?)
            }
        })
        .await?;

        let url = session
            .url
            .ok_or_else(|| BillingError::Provider("checkout session has no URL".to_string()))?;

        tracing::info!(
            account_id = %request.account_id,
            session_id = %session.id,
            tier = %request.tier,
            "Created checkout session"
        );

        Ok(CheckoutRedirect {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn set_cancel_at_period_end(
        &self,
        subscription_ref: &str,
        cancel: bool,
    ) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_ref)?;

        with_retry("set_cancel_at_period_end", || {
            let client = self.inner.clone();
            let sub_id = sub_id.clone();
            async move {
                let params = UpdateSubscription {
                    cancel_at_period_end: Some(cancel),
                    ..Default::default()
                };
                Ok(Subscription::update(&client, &sub_id, params).await?)
            }
        })
        .await?;

        tracing::info!(
            subscription_id = %subscription_ref,
            cancel_at_period_end = cancel,
            "Updated Stripe subscription cancellation"
        );
        Ok(())
    }

    async fn change_subscription_tier(
        &self,
        subscription_ref: &str,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<()> {
        let sub_id = parse_subscription_id(subscription_ref)?;
        let price_id = self.price_for(tier, interval)?;

        let current = with_retry("retrieve_subscription", || {
            let client = self.inner.clone();
            let sub_id = sub_id.clone();
            async move { Ok(Subscription::retrieve(&client, &sub_id, &[]).await?) }
        })
        .await?;

        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::Provider("subscription has no items".to_string()))?;

        with_retry("change_subscription_tier", || {
            let client = self.inner.clone();
            let sub_id = sub_id.clone();
            let item_id = item_id.clone();
            let price_id = price_id.clone();
            async move {
                let mut metadata = HashMap::new();
                metadata.insert("tier".to_string(), tier.to_string());
                let params = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        id: Some(item_id),
                        price: Some(price_id),
                        ..Default::default()
                    }]),
                    metadata: Some(metadata),
                    proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
                    ..Default::default()
                };
                Ok(Subscription::update(&client, &sub_id, params).await?)
            }
        })
        .await?;

        tracing::info!(
            subscription_id = %subscription_ref,
            tier = %tier,
            "Changed Stripe subscription price"
        );
        Ok(())
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use fake::{FakePaymentProvider, ProviderCall};

#[cfg(any(test, feature = "test-util"))]
mod fake {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Call recorded by [`FakePaymentProvider`]
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ProviderCall {
        CreateCustomer(Uuid),
        Checkout(Uuid, SubscriptionTier),
        CancelAtPeriodEnd(String, bool),
        ChangeTier(String, SubscriptionTier),
    }

    /// Offline provider for tests
    #[derive(Debug, Default)]
    pub struct FakePaymentProvider {
        calls: Mutex<Vec<ProviderCall>>,
        unavailable: AtomicBool,
    }

    impl FakePaymentProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call fail as if the provider were down
        pub fn set_unavailable(&self, down: bool) {
            self.unavailable.store(down, Ordering::SeqCst);
        }

        pub fn calls(&self) -> Vec<ProviderCall> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, call: ProviderCall) -> BillingResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(BillingError::PaymentProviderUnavailable(
                    "provider offline".to_string(),
                ));
            }
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PaymentProvider for FakePaymentProvider {
        async fn create_customer(&self, account_id: Uuid) -> BillingResult<String> {
            self.record(ProviderCall::CreateCustomer(account_id))?;
            Ok(format!("cus_{}", account_id.simple()))
        }

        async fn create_checkout_session(
            &self,
            request: &CheckoutRequest,
        ) -> BillingResult<CheckoutRedirect> {
            self.record(ProviderCall::Checkout(request.account_id, request.tier))?;
            let session_id = format!("cs_test_{}", Uuid::new_v4().simple());
            Ok(CheckoutRedirect {
                url: format!("https://checkout.example.test/{session_id}"),
                session_id,
            })
        }

        async fn set_cancel_at_period_end(
            &self,
            subscription_ref: &str,
            cancel: bool,
        ) -> BillingResult<()> {
            self.record(ProviderCall::CancelAtPeriodEnd(
                subscription_ref.to_string(),
                cancel,
            ))
        }

        async fn change_subscription_tier(
            &self,
            subscription_ref: &str,
            tier: SubscriptionTier,
            _interval: BillingInterval,
        ) -> BillingResult<()> {
            self.record(ProviderCall::ChangeTier(subscription_ref.to_string(), tier))
        }
    }
}
