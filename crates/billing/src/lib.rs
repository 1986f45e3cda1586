// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries provider messages
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clipmeter Billing Module
//!
//! Credit ledger and subscription lifecycle for metered clip jobs.
//!
//! ## Features
//!
//! - **Credit Ledger**: Append-only transaction log with a cached balance per account
//! - **Job Credits**: Reserve on submit, refund on failure, recovery sweep for lost jobs
//! - **Subscriptions**: Checkout, cancel, resume, upgrade and scheduled downgrade
//! - **Webhooks**: Verified, deduplicated and ordered Stripe event processing
//! - **Invariants**: Scheduled ledger consistency checks

pub mod client;
pub mod credits;
pub mod error;
pub mod invariants;
pub mod jobs;
pub mod ledger;
pub mod plans;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Client
#[cfg(any(test, feature = "test-util"))]
pub use client::{FakePaymentProvider, ProviderCall};
pub use client::{CheckoutRedirect, PaymentProvider, PriceIds, StripeClient, StripeConfig};

// Credits
pub use credits::{CreditLedgerService, HistoryPage, Pagination, RefundOutcome, UsageStats};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Jobs
pub use jobs::{
    estimate_cost, job_timeout_from_minutes, ExecutionRequest, InMemoryJobQueue,
    InMemoryJobStore, JobAdmission, JobCreditHelper, JobExecutor, JobOutcome, JobRecord,
    JobRequest, JobState, JobStore, PgJobStore, RecoverySweeper, RedisJobQueue, SweepReport,
    DEFAULT_JOB_TIMEOUT, DEFAULT_QUEUE_KEY, MAX_JOB_DURATION_SECS, MAX_JOB_TIMEOUT_MINUTES,
    RESERVED_PAYLOAD_KEYS,
};

// Ledger
pub use ledger::{
    Account, InMemoryLedgerStore, LedgerStore, LedgerTransaction, PgLedgerStore,
    SubscriptionState,
};

// Plans
pub use plans::{SubscriptionPlan, FREE_STARTING_CREDITS};

// Subscriptions
pub use subscriptions::{
    calculate_prorated_credits, AccountGuard, AccountLocks, ProviderSubscription,
    SubscriptionService, SubscriptionView, TierChangeResult, TierChangeTiming,
};

// Webhooks
pub use webhooks::{
    compute_signature, verify_signature, InMemoryWebhookEventStore, PgWebhookEventStore,
    WebhookDisposition, WebhookEventRecord, WebhookEventStore, WebhookHandler, WebhookOutcome,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub credits: CreditLedgerService,
    pub jobs: JobCreditHelper,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub invariants: Arc<InvariantChecker>,
}

impl BillingService {
    /// Wire the services over explicit stores
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        job_store: Arc<dyn JobStore>,
        webhook_events: Arc<dyn WebhookEventStore>,
        executor: Arc<dyn JobExecutor>,
        stripe: Option<StripeClient>,
    ) -> Self {
        let (provider, webhook_secret, prices) = match stripe {
            Some(stripe) => {
                let secret = stripe.config().webhook_secret.clone();
                let prices = stripe.config().prices.clone();
                let provider: Arc<dyn PaymentProvider> = Arc::new(stripe);
                (Some(provider), secret, prices)
            }
            None => (None, String::new(), PriceIds::default()),
        };

        Self::with_provider(
            ledger,
            job_store,
            webhook_events,
            executor,
            provider,
            webhook_secret,
            prices,
        )
    }

    /// Wire the services with any payment provider implementation
    pub fn with_provider(
        ledger: Arc<dyn LedgerStore>,
        job_store: Arc<dyn JobStore>,
        webhook_events: Arc<dyn WebhookEventStore>,
        executor: Arc<dyn JobExecutor>,
        provider: Option<Arc<dyn PaymentProvider>>,
        webhook_secret: String,
        prices: PriceIds,
    ) -> Self {
        let credits = CreditLedgerService::new(ledger.clone());
        let subscriptions = SubscriptionService::new(credits.clone(), provider);

        Self {
            jobs: JobCreditHelper::new(credits.clone(), job_store, executor),
            webhooks: WebhookHandler::new(
                subscriptions.clone(),
                webhook_events,
                webhook_secret,
                prices,
            ),
            invariants: Arc::new(InvariantChecker::new(ledger)),
            credits,
            subscriptions,
        }
    }

    /// Postgres-backed stores sharing one pool
    pub fn postgres(
        pool: PgPool,
        executor: Arc<dyn JobExecutor>,
        stripe: Option<StripeClient>,
    ) -> Self {
        Self::new(
            Arc::new(PgLedgerStore::new(pool.clone())),
            Arc::new(PgJobStore::new(pool.clone())),
            Arc::new(PgWebhookEventStore::new(pool)),
            executor,
            stripe,
        )
    }

    /// Process-local stores, for development without a database
    pub fn in_memory(executor: Arc<dyn JobExecutor>, stripe: Option<StripeClient>) -> Self {
        Self::new(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryWebhookEventStore::new()),
            executor,
            stripe,
        )
    }

    /// Recovery sweep over this service's job store
    pub fn sweeper(&self, timeout: std::time::Duration) -> RecoverySweeper {
        RecoverySweeper::new(self.jobs.clone(), timeout)
    }
}
