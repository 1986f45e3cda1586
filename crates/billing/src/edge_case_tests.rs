// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Billing System
//!
//! Cross-module scenarios:
//! - Concurrent deductions against one balance
//! - Refund idempotency
//! - Job lifecycle failure paths and the recovery sweep
//! - Webhook replay, ordering and renewal
//! - Tier changes mid-cycle

use std::sync::Arc;

use clipmeter_shared::{SubscriptionStatus, SubscriptionTier, TransactionKind};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::FakePaymentProvider;
use crate::jobs::{InMemoryJobQueue, InMemoryJobStore, JobOutcome, JobRequest, JobState};
use crate::ledger::InMemoryLedgerStore;
use crate::webhooks::{InMemoryWebhookEventStore, ProviderEvent, WebhookDisposition};
use crate::{BillingError, BillingService, PriceIds};

struct Harness {
    billing: BillingService,
    queue: Arc<InMemoryJobQueue>,
    account_id: Uuid,
}

async fn harness() -> Harness {
    let queue = Arc::new(InMemoryJobQueue::new());
    let billing = BillingService::with_provider(
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(InMemoryJobStore::new()),
        Arc::new(InMemoryWebhookEventStore::new()),
        queue.clone(),
        Some(Arc::new(FakePaymentProvider::new())),
        "whsec_edge".to_string(),
        PriceIds::default(),
    );
    let account_id = billing
        .credits
        .open_account(Uuid::new_v4())
        .await
        .unwrap()
        .account_id;
    Harness {
        billing,
        queue,
        account_id,
    }
}

impl Harness {
    async fn balance(&self) -> i64 {
        self.billing
            .credits
            .account(self.account_id)
            .await
            .unwrap()
            .credit_balance
    }

    async fn transaction_count(&self) -> usize {
        self.billing
            .credits
            .store()
            .account_transactions(self.account_id)
            .await
            .unwrap()
            .len()
    }

    fn job(&self, duration_seconds: f64) -> JobRequest {
        JobRequest {
            job_id: Uuid::new_v4(),
            account_id: self.account_id,
            duration_seconds: Some(duration_seconds),
            payload: serde_json::Map::new(),
        }
    }

    async fn deliver(
        &self,
        id: &str,
        event_type: &str,
        created: i64,
        object: serde_json::Value,
    ) -> WebhookDisposition {
        let event: ProviderEvent = serde_json::from_value(serde_json::json!({
            "id": id,
            "type": event_type,
            "created": created,
            "data": { "object": object }
        }))
        .unwrap();
        self.billing.webhooks.handle_event(event).await.unwrap()
    }

    async fn subscribe(&self, tier: &str, created: i64) {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let disposition = self
            .deliver(
                &format!("evt_sub_{created}"),
                "customer.subscription.created",
                created,
                serde_json::json!({
                    "id": "sub_edge",
                    "customer": "cus_edge",
                    "status": "active",
                    "metadata": { "account_id": self.account_id.to_string(), "tier": tier },
                    "current_period_start": now - 10 * 86_400,
                    "current_period_end": now + 20 * 86_400
                }),
            )
            .await;
        assert_eq!(disposition, WebhookDisposition::Applied);
    }
}

fn cycle_invoice() -> serde_json::Value {
    serde_json::json!({
        "id": "in_cycle",
        "customer": "cus_edge",
        "subscription": "sub_edge",
        "billing_reason": "subscription_cycle"
    })
}

#[cfg(test)]
mod ledger_tests {
    use super::*;
    use tokio::sync::Barrier;

    // =========================================================================
    // Balance 10, two concurrent 6-credit deductions: exactly one succeeds
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deductions_never_overdraw() {
        let h = harness().await;
        let barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for _ in 0..2 {
            let credits = h.billing.credits.clone();
            let barrier = barrier.clone();
            let account_id = h.account_id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                credits.reserve_and_deduct(account_id, 6, Uuid::new_v4()).await
            }));
        }

        let mut succeeded = 0;
        let mut denied = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(BillingError::InsufficientCredits { .. }) => denied += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(succeeded, 1);
        assert_eq!(denied, 1);
        assert_eq!(h.balance().await, 4);
    }

    // =========================================================================
    // Many small deductions race to drain the balance exactly
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_unit_deductions_drain_exactly() {
        let h = harness().await;
        let barrier = Arc::new(Barrier::new(15));

        let mut handles = Vec::new();
        for _ in 0..15 {
            let credits = h.billing.credits.clone();
            let barrier = barrier.clone();
            let account_id = h.account_id;
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                credits
                    .reserve_and_deduct(account_id, 1, Uuid::new_v4())
                    .await
                    .is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        assert_eq!(succeeded, 10);
        assert_eq!(h.balance().await, 0);
    }

    // =========================================================================
    // Balance always equals the sum of the log
    // =========================================================================
    #[tokio::test]
    async fn test_balance_equals_ledger_sum_after_mixed_operations() {
        let h = harness().await;
        let credits = &h.billing.credits;

        let a = credits
            .reserve_and_deduct(h.account_id, 4, Uuid::new_v4())
            .await
            .unwrap();
        credits
            .credit(h.account_id, 50, TransactionKind::Purchase)
            .await
            .unwrap();
        credits
            .reserve_and_deduct(h.account_id, 20, Uuid::new_v4())
            .await
            .unwrap();
        credits.refund(a).await.unwrap();

        let ledger = credits.store().account_transactions(h.account_id).await.unwrap();
        let sum: i64 = ledger.iter().map(|tx| tx.amount).sum();
        assert_eq!(sum, h.balance().await);
        assert_eq!(sum, 40);

        let summary = h.billing.invariants.run_all_checks().await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
    }

    // =========================================================================
    // Refunding twice changes the balance once
    // =========================================================================
    #[tokio::test]
    async fn test_double_refund_applies_once() {
        let h = harness().await;
        let tx = h
            .billing
            .credits
            .reserve_and_deduct(h.account_id, 5, Uuid::new_v4())
            .await
            .unwrap();

        let first = h.billing.credits.refund(tx).await.unwrap();
        let second = h.billing.credits.refund(tx).await.unwrap();

        assert_eq!(first.transaction_id(), second.transaction_id());
        assert_eq!(h.balance().await, 10);
    }

    // =========================================================================
    // Concurrent refunds of the same deduction
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refunds_apply_once() {
        let h = harness().await;
        let tx = h
            .billing
            .credits
            .reserve_and_deduct(h.account_id, 5, Uuid::new_v4())
            .await
            .unwrap();
        let barrier = Arc::new(Barrier::new(4));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let credits = h.billing.credits.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                credits.refund(tx).await.unwrap().transaction_id()
            }));
        }

        let mut refund_ids = Vec::new();
        for handle in handles {
            refund_ids.push(handle.await.unwrap());
        }
        refund_ids.dedup();

        assert_eq!(refund_ids.len(), 1);
        assert_eq!(h.balance().await, 10);
    }
}

#[cfg(test)]
mod job_tests {
    use super::*;

    // =========================================================================
    // Free 10 -> 7-credit job reserved (3) -> failure -> refunded (10)
    // =========================================================================
    #[tokio::test]
    async fn test_failed_job_is_refunded() {
        let h = harness().await;
        let request = h.job(7.0 * 60.0);
        let job_id = request.job_id;

        let admission = h.billing.jobs.submit(request).await.unwrap();
        assert_eq!(admission.estimated_cost, 7);
        assert_eq!(h.balance().await, 3);
        assert_eq!(h.queue.len().await, 1);

        let job = h
            .billing
            .jobs
            .complete(job_id, JobOutcome::Failure)
            .await
            .unwrap();
        assert_eq!(job.state, JobState::Refunded);
        assert_eq!(h.balance().await, 10);
    }

    // =========================================================================
    // Denied submission leaves no trace
    // =========================================================================
    #[tokio::test]
    async fn test_denied_job_leaves_nothing_behind() {
        let h = harness().await;
        let request = h.job(11.0 * 60.0);
        let job_id = request.job_id;

        let err = h.billing.jobs.submit(request).await.unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                required: 11,
                available: 10
            }
        ));
        assert_eq!(h.balance().await, 10);
        assert_eq!(h.transaction_count().await, 1);
        assert!(h.queue.is_empty().await);
        assert!(matches!(
            h.billing.jobs.get(job_id).await,
            Err(BillingError::JobNotFound(_))
        ));
    }

    // =========================================================================
    // Queue unavailable after reservation: reservation is refunded
    // =========================================================================
    #[tokio::test]
    async fn test_enqueue_failure_refunds_reservation() {
        let h = harness().await;
        h.queue.set_rejecting(true);
        let request = h.job(120.0);
        let job_id = request.job_id;

        assert!(h.billing.jobs.submit(request).await.is_err());
        assert_eq!(h.balance().await, 10);
        assert_eq!(
            h.billing.jobs.get(job_id).await.unwrap().state,
            JobState::Refunded
        );
    }

    // =========================================================================
    // Lost job is timed out and refunded; a late success cannot undo that
    // =========================================================================
    #[tokio::test]
    async fn test_sweep_refunds_lost_job_and_rejects_late_success() {
        let h = harness().await;
        let request = h.job(180.0);
        let job_id = request.job_id;
        h.billing.jobs.submit(request).await.unwrap();
        assert_eq!(h.balance().await, 7);

        let sweeper = h.billing.sweeper(std::time::Duration::from_secs(60 * 60));
        let report = sweeper
            .run_at(OffsetDateTime::now_utc() + time::Duration::hours(2))
            .await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(h.balance().await, 10);

        let err = h
            .billing
            .jobs
            .complete(job_id, JobOutcome::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::JobAlreadySettled { .. }));
        assert_eq!(h.balance().await, 10);

        // A second sweep has nothing left to do
        let report = sweeper
            .run_at(OffsetDateTime::now_utc() + time::Duration::hours(3))
            .await;
        assert_eq!(report.timed_out, 0);
        assert_eq!(h.balance().await, 10);
    }

    // =========================================================================
    // Unlimited tier skips the funds check but cannot push the balance past i64
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_tier_rejects_unbounded_job_cost() {
        let h = harness().await;
        h.subscribe("premium", OffsetDateTime::now_utc().unix_timestamp())
            .await;
        let before = h.balance().await;
        let count = h.transaction_count().await;

        for _ in 0..2 {
            let err = h.billing.jobs.submit(h.job(1e300)).await.unwrap_err();
            assert!(matches!(err, BillingError::InvalidInput(_)));
        }
        assert_eq!(h.balance().await, before);
        assert_eq!(h.transaction_count().await, count);
        assert!(h.queue.is_empty().await);

        // Largest accepted job still settles normally
        h.billing
            .jobs
            .submit(h.job(crate::jobs::MAX_JOB_DURATION_SECS))
            .await
            .unwrap();
        assert_eq!(h.balance().await, before - 1440);

        let summary = h.billing.invariants.run_all_checks().await.unwrap();
        assert!(summary
            .violations
            .iter()
            .all(|v| v.invariant != "balance_matches_ledger" && v.invariant != "ledger_chain_continuous"));
    }

    // =========================================================================
    // Completed job keeps its charge and cannot be refunded by the sweep
    // =========================================================================
    #[tokio::test]
    async fn test_completed_job_is_final() {
        let h = harness().await;
        let request = h.job(60.0);
        let job_id = request.job_id;
        h.billing.jobs.submit(request).await.unwrap();
        h.billing
            .jobs
            .complete(job_id, JobOutcome::Success)
            .await
            .unwrap();

        let report = h
            .billing
            .sweeper(std::time::Duration::from_secs(60))
            .run_at(OffsetDateTime::now_utc() + time::Duration::hours(2))
            .await;
        assert_eq!(report.timed_out, 0);
        assert_eq!(h.balance().await, 9);
        assert!(h.billing.jobs.cancel(job_id).await.is_err());
    }
}

#[cfg(test)]
mod subscription_tests {
    use super::*;
    use clipmeter_shared::BillingInterval;

    // =========================================================================
    // Unlimited tier: any amount is affordable
    // =========================================================================
    #[tokio::test]
    async fn test_unlimited_tier_check_balance() {
        let h = harness().await;
        h.subscribe("enterprise", OffsetDateTime::now_utc().unix_timestamp())
            .await;

        for amount in [1, 10, 1_000, i64::MAX] {
            assert!(h
                .billing
                .credits
                .check_balance(h.account_id, amount)
                .await
                .unwrap());
        }
    }

    // =========================================================================
    // Payment succeeded for basic delivered twice: renewed once
    // =========================================================================
    #[tokio::test]
    async fn test_duplicate_payment_event_renews_once() {
        let h = harness().await;
        let t = OffsetDateTime::now_utc().unix_timestamp();
        h.subscribe("basic", t).await;
        h.billing
            .credits
            .reserve_and_deduct(h.account_id, 40, Uuid::new_v4())
            .await
            .unwrap();

        let first = h
            .deliver("evt_paid", "invoice.paid", t + 5, cycle_invoice())
            .await;
        assert_eq!(first, WebhookDisposition::Applied);
        assert_eq!(h.balance().await, 100);
        let after_first = h.transaction_count().await;

        h.billing
            .credits
            .reserve_and_deduct(h.account_id, 15, Uuid::new_v4())
            .await
            .unwrap();
        let second = h
            .deliver("evt_paid", "invoice.paid", t + 5, cycle_invoice())
            .await;
        assert_eq!(second, WebhookDisposition::Duplicate);
        assert_eq!(h.balance().await, 85);
        assert_eq!(h.transaction_count().await, after_first + 1);
    }

    // =========================================================================
    // Upgrade basic (30 left) -> premium mid-cycle
    // =========================================================================
    #[tokio::test]
    async fn test_mid_cycle_upgrade_to_unlimited() {
        let h = harness().await;
        h.subscribe("basic", OffsetDateTime::now_utc().unix_timestamp())
            .await;
        h.billing
            .credits
            .reserve_and_deduct(h.account_id, 70, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(h.balance().await, 30);

        let result = h
            .billing
            .subscriptions
            .change_tier(h.account_id, SubscriptionTier::Premium, BillingInterval::Monthly)
            .await
            .unwrap();
        assert_eq!(result.to, SubscriptionTier::Premium);

        let account = h.billing.credits.account(h.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Premium);
        assert!(h
            .billing
            .credits
            .check_balance(h.account_id, 5_000)
            .await
            .unwrap());
    }

    // =========================================================================
    // Changing to the current tier with nothing scheduled is rejected
    // =========================================================================
    #[tokio::test]
    async fn test_same_tier_change_rejected() {
        let h = harness().await;
        h.subscribe("basic", OffsetDateTime::now_utc().unix_timestamp())
            .await;

        let err = h
            .billing
            .subscriptions
            .change_tier(h.account_id, SubscriptionTier::Basic, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTier(_)));
    }

    // =========================================================================
    // Cancel, then period-end deletion reverts to free
    // =========================================================================
    #[tokio::test]
    async fn test_cancel_then_period_end() {
        let h = harness().await;
        let t = OffsetDateTime::now_utc().unix_timestamp();
        h.subscribe("basic", t).await;

        h.billing.subscriptions.cancel(h.account_id).await.unwrap();
        assert!(h
            .billing
            .credits
            .check_balance(h.account_id, 100)
            .await
            .unwrap());

        h.deliver(
            "evt_deleted",
            "customer.subscription.deleted",
            t + 30,
            serde_json::json!({
                "id": "sub_edge",
                "customer": "cus_edge",
                "status": "canceled"
            }),
        )
        .await;

        let account = h.billing.credits.account(h.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Free);
        assert_eq!(account.subscription_status, SubscriptionStatus::None);
        // Remaining credits stay until the next free-tier event
        assert_eq!(account.credit_balance, 100);
    }

    // =========================================================================
    // Out-of-order delivery: an older update after a newer one is stale
    // =========================================================================
    #[tokio::test]
    async fn test_out_of_order_update_is_discarded() {
        let h = harness().await;
        let t = OffsetDateTime::now_utc().unix_timestamp();
        h.subscribe("basic", t).await;

        let disposition = h
            .deliver(
                "evt_late",
                "customer.subscription.updated",
                t - 100,
                serde_json::json!({
                    "id": "sub_edge",
                    "customer": "cus_edge",
                    "status": "unpaid",
                    "metadata": { "tier": "basic" }
                }),
            )
            .await;

        assert_eq!(disposition, WebhookDisposition::Stale);
        let account = h.billing.credits.account(h.account_id).await.unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
    }
}
