//! Subscription lifecycle management
//!
//! Owns every change to an account's tier and status. Credits are never
//! written here directly; renewals, prorated bonuses and balance
//! normalisation all go through [`CreditLedgerService`].
//!
//! Changes initiated by the user (checkout, cancel, resume, tier change) and
//! changes arriving from provider webhooks are serialized per account through
//! [`AccountLocks`].

use std::collections::HashMap;
use std::sync::Arc;

use clipmeter_shared::{BillingInterval, SubscriptionStatus, SubscriptionTier, TransactionKind};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::client::{CheckoutRedirect, CheckoutRequest, PaymentProvider};
use crate::credits::CreditLedgerService;
use crate::error::{BillingError, BillingResult};
use crate::ledger::{Account, LedgerTransaction, SubscriptionState};
use crate::plans::SubscriptionPlan;

type LockMap = Arc<std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>;

fn lock_map(map: &LockMap) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Mutex<()>>>> {
    match map.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Keyed async mutex, one per account. Entries live only while someone
/// holds or waits on them.
#[derive(Clone, Default)]
pub struct AccountLocks {
    locks: LockMap,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, account_id: Uuid) -> AccountGuard {
        let lock = lock_map(&self.locks).entry(account_id).or_default().clone();
        let guard = lock.clone().lock_owned().await;
        AccountGuard {
            guard: Some(guard),
            lock,
            account_id,
            locks: self.locks.clone(),
        }
    }

    /// Accounts currently holding or waiting on a lock
    pub fn tracked(&self) -> usize {
        lock_map(&self.locks).len()
    }
}

/// Held lock on one account; removes the map entry when released last
pub struct AccountGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<Mutex<()>>,
    account_id: Uuid,
    locks: LockMap,
}

impl Drop for AccountGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = lock_map(&self.locks);
        // The map and this guard hold the only references: no waiters
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.account_id);
        }
    }
}

/// Provider-side view of a subscription, as carried by webhook events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSubscription {
    pub subscription_ref: String,
    pub customer_ref: Option<String>,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Subscription summary returned to callers
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub account_id: Uuid,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub plan: SubscriptionPlan,
    pub credit_balance: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub pending_downgrade_tier: Option<SubscriptionTier>,
}

impl From<&Account> for SubscriptionView {
    fn from(account: &Account) -> Self {
        Self {
            account_id: account.account_id,
            tier: account.subscription_tier,
            status: account.subscription_status,
            plan: SubscriptionPlan::for_tier(account.subscription_tier),
            credit_balance: account.credit_balance,
            current_period_start: account.billing_anchor,
            current_period_end: account.current_period_end,
            cancel_at_period_end: account.cancel_at_period_end,
            pending_downgrade_tier: account.pending_downgrade_tier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TierChangeTiming {
    Immediate,
    AtPeriodEnd,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierChangeResult {
    pub from: SubscriptionTier,
    pub to: SubscriptionTier,
    pub timing: TierChangeTiming,
    /// Bonus credits granted for the remainder of the current period
    pub prorated_credits: i64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub effective_at: Option<OffsetDateTime>,
}

/// Share of `amount` covering the rest of the period, floored.
///
/// Zero once the period is over or when the period is degenerate.
pub fn calculate_prorated_credits(
    amount: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> i64 {
    if amount <= 0 || now >= period_end {
        return 0;
    }

    let total_days = (period_end - period_start).whole_days() as f64;
    if total_days <= 0.0 {
        return 0;
    }

    let remaining_days = (period_end - now).whole_days().clamp(0, total_days as i64) as f64;
    let prorated = (amount as f64) * (remaining_days / total_days);

    prorated.floor() as i64
}

#[derive(Clone)]
pub struct SubscriptionService {
    credits: CreditLedgerService,
    provider: Option<Arc<dyn PaymentProvider>>,
    locks: AccountLocks,
}

impl SubscriptionService {
    pub fn new(credits: CreditLedgerService, provider: Option<Arc<dyn PaymentProvider>>) -> Self {
        Self {
            credits,
            provider,
            locks: AccountLocks::new(),
        }
    }

    pub fn locks(&self) -> &AccountLocks {
        &self.locks
    }

    pub fn credits(&self) -> &CreditLedgerService {
        &self.credits
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    fn provider(&self) -> BillingResult<&Arc<dyn PaymentProvider>> {
        self.provider
            .as_ref()
            .ok_or(BillingError::ProviderNotConfigured)
    }

    pub fn plans(&self) -> Vec<SubscriptionPlan> {
        SubscriptionPlan::catalog()
    }

    pub async fn subscription(&self, account_id: Uuid) -> BillingResult<SubscriptionView> {
        let account = self.credits.account(account_id).await?;
        Ok(SubscriptionView::from(&account))
    }

    async fn save(&self, account_id: Uuid, state: &SubscriptionState) -> BillingResult<Account> {
        self.credits
            .store()
            .save_subscription(account_id, state)
            .await
    }

    /// Start a checkout for a paid tier. Tier and balance change only once
    /// the provider confirms payment through a webhook.
    pub async fn initiate_subscription(
        &self,
        account_id: Uuid,
        tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<CheckoutRedirect> {
        if !tier.is_paid() {
            return Err(BillingError::InvalidTier(format!(
                "{tier} is not sold through checkout"
            )));
        }
        let provider = self.provider()?;

        let customer_ref = {
            let _guard = self.locks.lock(account_id).await;
            let account = self.credits.account(account_id).await?;
            if !account.active {
                return Err(BillingError::AccountInactive(account_id));
            }
            if account.subscription_status == SubscriptionStatus::Active
                && account.subscription_tier == tier
            {
                return Err(BillingError::InvalidTier(format!(
                    "account is already subscribed to {tier}"
                )));
            }

            match account.external_customer_ref.clone() {
                Some(customer_ref) => customer_ref,
                None => {
                    let customer_ref = provider.create_customer(account_id).await?;
                    let mut state = account.subscription();
                    state.external_customer_ref = Some(customer_ref.clone());
                    self.save(account_id, &state).await?;
                    customer_ref
                }
            }
        };

        let redirect = provider
            .create_checkout_session(&CheckoutRequest {
                account_id,
                customer_ref,
                tier,
                interval,
            })
            .await?;

        tracing::info!(
            account_id = %account_id,
            tier = %tier,
            interval = %interval,
            session_id = %redirect.session_id,
            "Initiated subscription checkout"
        );

        Ok(redirect)
    }

    /// Cancel at period end. Access and credits remain until the provider's
    /// period-end event reverts the account to free.
    pub async fn cancel(&self, account_id: Uuid) -> BillingResult<SubscriptionView> {
        let _guard = self.locks.lock(account_id).await;
        let account = self.credits.account(account_id).await?;

        let subscription_ref = account
            .external_subscription_ref
            .clone()
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        if account.subscription_status == SubscriptionStatus::Canceled {
            return Ok(SubscriptionView::from(&account));
        }

        self.provider()?
            .set_cancel_at_period_end(&subscription_ref, true)
            .await?;

        let mut state = account.subscription();
        state.status = SubscriptionStatus::Canceled;
        state.cancel_at_period_end = true;
        let account = self.save(account_id, &state).await?;

        tracing::info!(
            account_id = %account_id,
            tier = %account.subscription_tier,
            period_end = ?account.current_period_end,
            "Subscription set to cancel at period end"
        );

        Ok(SubscriptionView::from(&account))
    }

    /// Undo a pending cancellation while the paid period is still running
    pub async fn resume(&self, account_id: Uuid) -> BillingResult<SubscriptionView> {
        let _guard = self.locks.lock(account_id).await;
        let account = self.credits.account(account_id).await?;

        let subscription_ref = account
            .external_subscription_ref
            .clone()
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        if !account.cancel_at_period_end {
            return Ok(SubscriptionView::from(&account));
        }

        let now = OffsetDateTime::now_utc();
        if account.current_period_end.is_some_and(|end| now >= end) {
            return Err(BillingError::InvalidInput(
                "subscription period has already ended".to_string(),
            ));
        }

        self.provider()?
            .set_cancel_at_period_end(&subscription_ref, false)
            .await?;

        let mut state = account.subscription();
        state.status = SubscriptionStatus::Active;
        state.cancel_at_period_end = false;
        // A free-tier downgrade is implemented as a cancellation
        if state.pending_downgrade_tier == Some(SubscriptionTier::Free) {
            state.pending_downgrade_tier = None;
        }
        let account = self.save(account_id, &state).await?;

        tracing::info!(account_id = %account_id, "Resumed subscription");

        Ok(SubscriptionView::from(&account))
    }

    /// Upgrade immediately with a prorated bonus, or schedule a downgrade
    /// for the next renewal.
    pub async fn change_tier(
        &self,
        account_id: Uuid,
        new_tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<TierChangeResult> {
        let _guard = self.locks.lock(account_id).await;
        let account = self.credits.account(account_id).await?;
        let current = account.subscription_tier;

        if new_tier == current {
            return self.clear_pending_downgrade(&account).await;
        }

        let subscription_ref = account
            .external_subscription_ref
            .clone()
            .ok_or(BillingError::SubscriptionNotFound(account_id))?;

        if new_tier.rank() > current.rank() {
            self.upgrade(&account, &subscription_ref, new_tier, interval)
                .await
        } else {
            self.schedule_downgrade(&account, &subscription_ref, new_tier)
                .await
        }
    }

    async fn upgrade(
        &self,
        account: &Account,
        subscription_ref: &str,
        new_tier: SubscriptionTier,
        interval: BillingInterval,
    ) -> BillingResult<TierChangeResult> {
        let account_id = account.account_id;
        let old_plan = SubscriptionPlan::for_tier(account.subscription_tier);
        let new_plan = SubscriptionPlan::for_tier(new_tier);

        self.provider()?
            .change_subscription_tier(subscription_ref, new_tier, interval)
            .await?;

        let mut state = account.subscription();
        state.tier = new_tier;
        state.pending_downgrade_tier = None;
        self.save(account_id, &state).await?;

        let now = OffsetDateTime::now_utc();
        let prorated = match (account.billing_anchor, account.current_period_end) {
            (Some(start), Some(end)) if !new_plan.unlimited => calculate_prorated_credits(
                new_plan.monthly_credits - old_plan.monthly_credits,
                start,
                end,
                now,
            ),
            _ => 0,
        };

        if prorated > 0 {
            self.credits
                .credit(account_id, prorated, TransactionKind::Bonus)
                .await?;
        }

        tracing::info!(
            account_id = %account_id,
            from = %account.subscription_tier,
            to = %new_tier,
            prorated_credits = prorated,
            "Upgraded subscription"
        );

        Ok(TierChangeResult {
            from: account.subscription_tier,
            to: new_tier,
            timing: TierChangeTiming::Immediate,
            prorated_credits: prorated,
            effective_at: Some(now),
        })
    }

    async fn schedule_downgrade(
        &self,
        account: &Account,
        subscription_ref: &str,
        new_tier: SubscriptionTier,
    ) -> BillingResult<TierChangeResult> {
        let account_id = account.account_id;
        let mut state = account.subscription();

        if let Some(existing) = state.pending_downgrade_tier {
            if existing != new_tier {
                tracing::warn!(
                    account_id = %account_id,
                    existing = %existing,
                    new = %new_tier,
                    "Replacing previously scheduled downgrade"
                );
            }
        }

        // Free has no provider price; the subscription simply does not renew
        if new_tier == SubscriptionTier::Free {
            self.provider()?
                .set_cancel_at_period_end(subscription_ref, true)
                .await?;
            state.cancel_at_period_end = true;
        }

        state.pending_downgrade_tier = Some(new_tier);
        self.save(account_id, &state).await?;

        tracing::info!(
            account_id = %account_id,
            from = %account.subscription_tier,
            to = %new_tier,
            effective_at = ?account.current_period_end,
            "Scheduled downgrade for period end"
        );

        Ok(TierChangeResult {
            from: account.subscription_tier,
            to: new_tier,
            timing: TierChangeTiming::AtPeriodEnd,
            prorated_credits: 0,
            effective_at: account.current_period_end,
        })
    }

    async fn clear_pending_downgrade(&self, account: &Account) -> BillingResult<TierChangeResult> {
        let account_id = account.account_id;
        let Some(pending) = account.pending_downgrade_tier else {
            return Err(BillingError::InvalidTier(format!(
                "account is already on {}",
                account.subscription_tier
            )));
        };

        let mut state = account.subscription();
        if pending == SubscriptionTier::Free {
            if let Some(subscription_ref) = &account.external_subscription_ref {
                self.provider()?
                    .set_cancel_at_period_end(subscription_ref, false)
                    .await?;
            }
            state.cancel_at_period_end = false;
        }
        state.pending_downgrade_tier = None;
        self.save(account_id, &state).await?;

        tracing::info!(
            account_id = %account_id,
            cleared = %pending,
            "Cleared scheduled downgrade"
        );

        Ok(TierChangeResult {
            from: account.subscription_tier,
            to: account.subscription_tier,
            timing: TierChangeTiming::Immediate,
            prorated_credits: 0,
            effective_at: None,
        })
    }

    /// Reset the balance to the tier's monthly allotment.
    ///
    /// Called only on a confirmed payment. Unlimited tiers have no allotment;
    /// for them only a negative balance is cleared.
    pub async fn renew_credits_on_billing_cycle(
        &self,
        account_id: Uuid,
        tier: SubscriptionTier,
    ) -> BillingResult<Option<LedgerTransaction>> {
        let plan = SubscriptionPlan::for_tier(tier);
        if plan.unlimited {
            return self.normalize_balance(account_id).await;
        }

        let tx = self
            .credits
            .reset_balance(account_id, plan.monthly_credits, TransactionKind::Renewal)
            .await?;

        tracing::info!(
            account_id = %account_id,
            tier = %tier,
            credits = plan.monthly_credits,
            "Renewed monthly credits"
        );

        Ok(tx)
    }

    /// Bring a balance driven negative on an unlimited tier back to zero
    async fn normalize_balance(&self, account_id: Uuid) -> BillingResult<Option<LedgerTransaction>> {
        let account = self.credits.account(account_id).await?;
        if account.credit_balance >= 0 {
            return Ok(None);
        }
        self.credits
            .reset_balance(account_id, 0, TransactionKind::Bonus)
            .await
    }

    // Webhook-driven transitions. Callers hold the account lock.

    /// A new paid subscription exists at the provider
    pub(crate) async fn apply_subscription_created(
        &self,
        account: &Account,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()> {
        let mut state = account.subscription();
        state.tier = subscription.tier;
        state.status = SubscriptionStatus::Active;
        state.external_subscription_ref = Some(subscription.subscription_ref.clone());
        if subscription.customer_ref.is_some() {
            state.external_customer_ref = subscription.customer_ref.clone();
        }
        state.billing_anchor = subscription.period_start;
        state.current_period_end = subscription.period_end;
        state.cancel_at_period_end = subscription.cancel_at_period_end;
        state.pending_downgrade_tier = None;
        self.save(account.account_id, &state).await?;

        tracing::info!(
            account_id = %account.account_id,
            tier = %subscription.tier,
            subscription_id = %subscription.subscription_ref,
            "Subscription activated"
        );

        self.renew_credits_on_billing_cycle(account.account_id, subscription.tier)
            .await?;
        Ok(())
    }

    /// Mirror provider-side changes to tier, status and period
    pub(crate) async fn apply_subscription_updated(
        &self,
        account: &Account,
        subscription: &ProviderSubscription,
    ) -> BillingResult<()> {
        let mut state = account.subscription();
        state.tier = subscription.tier;
        state.status = if subscription.cancel_at_period_end
            && subscription.status == SubscriptionStatus::Active
        {
            SubscriptionStatus::Canceled
        } else {
            subscription.status
        };
        state.external_subscription_ref = Some(subscription.subscription_ref.clone());
        if subscription.customer_ref.is_some() {
            state.external_customer_ref = subscription.customer_ref.clone();
        }
        if subscription.period_start.is_some() {
            state.billing_anchor = subscription.period_start;
        }
        if subscription.period_end.is_some() {
            state.current_period_end = subscription.period_end;
        }
        state.cancel_at_period_end = subscription.cancel_at_period_end;
        if state.pending_downgrade_tier == Some(subscription.tier) {
            state.pending_downgrade_tier = None;
        }
        self.save(account.account_id, &state).await?;

        if account.subscription_tier.is_unlimited() && !subscription.tier.is_unlimited() {
            self.normalize_balance(account.account_id).await?;
        }

        tracing::info!(
            account_id = %account.account_id,
            tier = %state.tier,
            status = %state.status,
            "Subscription reconciled with provider"
        );
        Ok(())
    }

    /// The subscription ended; revert to free
    pub(crate) async fn apply_subscription_deleted(&self, account: &Account) -> BillingResult<()> {
        let mut state = account.subscription();
        state.tier = SubscriptionTier::Free;
        state.status = SubscriptionStatus::None;
        state.external_subscription_ref = None;
        state.billing_anchor = None;
        state.current_period_end = None;
        state.cancel_at_period_end = false;
        state.pending_downgrade_tier = None;
        self.save(account.account_id, &state).await?;

        self.normalize_balance(account.account_id).await?;

        tracing::info!(
            account_id = %account.account_id,
            previous_tier = %account.subscription_tier,
            "Subscription ended; account reverted to free"
        );
        Ok(())
    }

    /// A renewal invoice was paid: apply any scheduled downgrade, then renew
    pub(crate) async fn apply_payment_succeeded(
        &self,
        account: &Account,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<LedgerTransaction>> {
        let mut state = account.subscription();

        if let Some(pending) = state.pending_downgrade_tier.take() {
            if pending.is_paid() {
                if let Some(subscription_ref) = &state.external_subscription_ref {
                    // The provider keeps billing the old price otherwise; the
                    // local downgrade stands even if this call fails.
                    if let Err(e) = self
                        .provider()?
                        .change_subscription_tier(subscription_ref, pending, BillingInterval::Monthly)
                        .await
                    {
                        tracing::error!(
                            account_id = %account.account_id,
                            tier = %pending,
                            error = %e,
                            "Failed to move provider subscription to downgraded price"
                        );
                    }
                }
            }
            tracing::info!(
                account_id = %account.account_id,
                from = %state.tier,
                to = %pending,
                "Applying scheduled downgrade at renewal"
            );
            state.tier = pending;
        }

        if state.status != SubscriptionStatus::Canceled {
            state.status = SubscriptionStatus::Active;
        }
        if period_start.is_some() {
            state.billing_anchor = period_start;
        }
        if period_end.is_some() {
            state.current_period_end = period_end;
        }
        let tier = state.tier;
        self.save(account.account_id, &state).await?;

        self.renew_credits_on_billing_cycle(account.account_id, tier)
            .await
    }

    /// Payment failed; access stays but the account is flagged
    pub(crate) async fn apply_payment_failed(&self, account: &Account) -> BillingResult<()> {
        let mut state = account.subscription();
        state.status = SubscriptionStatus::PastDue;
        self.save(account.account_id, &state).await?;

        tracing::warn!(
            account_id = %account.account_id,
            tier = %account.subscription_tier,
            "Payment failed; subscription past due"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{FakePaymentProvider, ProviderCall};
    use crate::ledger::InMemoryLedgerStore;
    use time::Duration;

    struct Fixture {
        subs: SubscriptionService,
        credits: CreditLedgerService,
        provider: Arc<FakePaymentProvider>,
        account_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let credits = CreditLedgerService::new(Arc::new(InMemoryLedgerStore::new()));
        let provider = Arc::new(FakePaymentProvider::new());
        let subs = SubscriptionService::new(credits.clone(), Some(provider.clone()));
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;
        Fixture {
            subs,
            credits,
            provider,
            account_id,
        }
    }

    fn provider_sub(tier: SubscriptionTier) -> ProviderSubscription {
        let now = OffsetDateTime::now_utc();
        ProviderSubscription {
            subscription_ref: "sub_123".to_string(),
            customer_ref: Some("cus_123".to_string()),
            tier,
            status: SubscriptionStatus::Active,
            period_start: Some(now - Duration::days(15)),
            period_end: Some(now + Duration::days(15)),
            cancel_at_period_end: false,
        }
    }

    async fn subscribe(f: &Fixture, tier: SubscriptionTier) -> Account {
        let account = f.credits.account(f.account_id).await.unwrap();
        f.subs
            .apply_subscription_created(&account, &provider_sub(tier))
            .await
            .unwrap();
        f.credits.account(f.account_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_account_locks_released_entries_are_dropped() {
        let locks = AccountLocks::new();
        for _ in 0..100 {
            let _guard = locks.lock(Uuid::new_v4()).await;
            assert_eq!(locks.tracked(), 1);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_account_lock_kept_while_waiter_pending() {
        let locks = AccountLocks::new();
        let account_id = Uuid::new_v4();
        let first = locks.lock(account_id).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(account_id).await;
            })
        };
        while Arc::strong_count(&first.lock) <= 3 {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert_eq!(locks.tracked(), 1);

        waiter.await.unwrap();
        assert_eq!(locks.tracked(), 0);
    }

    #[test]
    fn test_prorated_credits_half_period() {
        let now = OffsetDateTime::now_utc();
        let start = now - Duration::days(15);
        let end = now + Duration::days(15);
        let credits = calculate_prorated_credits(100, start, end, now);
        assert!((49..=50).contains(&credits), "got {credits}");
    }

    #[test]
    fn test_prorated_credits_after_period_end() {
        let now = OffsetDateTime::now_utc();
        let start = now - Duration::days(31);
        let end = now - Duration::days(1);
        assert_eq!(calculate_prorated_credits(100, start, end, now), 0);
    }

    #[test]
    fn test_prorated_credits_negative_difference() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            calculate_prorated_credits(-90, now - Duration::days(1), now + Duration::days(29), now),
            0
        );
    }

    #[tokio::test]
    async fn test_initiate_creates_customer_without_changing_tier() {
        let f = fixture().await;
        let redirect = f
            .subs
            .initiate_subscription(f.account_id, SubscriptionTier::Basic, BillingInterval::Monthly)
            .await
            .unwrap();
        assert!(redirect.url.starts_with("https://"));

        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Free);
        assert_eq!(account.credit_balance, 10);
        assert!(account.external_customer_ref.is_some());
        assert_eq!(
            f.provider.calls()[0],
            ProviderCall::CreateCustomer(f.account_id)
        );
    }

    #[tokio::test]
    async fn test_initiate_free_tier_rejected() {
        let f = fixture().await;
        let err = f
            .subs
            .initiate_subscription(f.account_id, SubscriptionTier::Free, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTier(_)));
    }

    #[tokio::test]
    async fn test_initiate_without_provider() {
        let credits = CreditLedgerService::new(Arc::new(InMemoryLedgerStore::new()));
        let subs = SubscriptionService::new(credits.clone(), None);
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let err = subs
            .initiate_subscription(account_id, SubscriptionTier::Basic, BillingInterval::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::ProviderNotConfigured));
    }

    #[tokio::test]
    async fn test_created_subscription_renews_credits() {
        let f = fixture().await;
        let account = subscribe(&f, SubscriptionTier::Basic).await;

        assert_eq!(account.subscription_tier, SubscriptionTier::Basic);
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert_eq!(account.credit_balance, 100);
    }

    #[tokio::test]
    async fn test_cancel_keeps_tier_and_credits() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Basic).await;

        let view = f.subs.cancel(f.account_id).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::Canceled);
        assert_eq!(view.tier, SubscriptionTier::Basic);
        assert!(view.cancel_at_period_end);
        assert_eq!(view.credit_balance, 100);
    }

    #[tokio::test]
    async fn test_cancel_provider_failure_changes_nothing() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Basic).await;
        f.provider.set_unavailable(true);

        let err = f.subs.cancel(f.account_id).await.unwrap_err();
        assert!(matches!(err, BillingError::PaymentProviderUnavailable(_)));
        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_cancel_without_subscription() {
        let f = fixture().await;
        let err = f.subs.cancel(f.account_id).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionNotFound(_)));
    }

    #[tokio::test]
    async fn test_resume_within_period() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Basic).await;
        f.subs.cancel(f.account_id).await.unwrap();

        let view = f.subs.resume(f.account_id).await.unwrap();
        assert_eq!(view.status, SubscriptionStatus::Active);
        assert!(!view.cancel_at_period_end);
    }

    #[tokio::test]
    async fn test_upgrade_basic_to_premium_is_immediate() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Basic).await;

        let result = f
            .subs
            .change_tier(f.account_id, SubscriptionTier::Premium, BillingInterval::Monthly)
            .await
            .unwrap();
        assert_eq!(result.timing, TierChangeTiming::Immediate);
        assert_eq!(result.prorated_credits, 0);

        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Premium);
        assert!(f.credits.check_balance(f.account_id, 10_000).await.unwrap());
    }

    #[tokio::test]
    async fn test_downgrade_is_deferred_to_renewal() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Premium).await;

        let result = f
            .subs
            .change_tier(f.account_id, SubscriptionTier::Basic, BillingInterval::Monthly)
            .await
            .unwrap();
        assert_eq!(result.timing, TierChangeTiming::AtPeriodEnd);

        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Premium);
        assert_eq!(account.pending_downgrade_tier, Some(SubscriptionTier::Basic));

        f.subs
            .apply_payment_succeeded(&account, None, None)
            .await
            .unwrap();
        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Basic);
        assert_eq!(account.pending_downgrade_tier, None);
        assert_eq!(account.credit_balance, 100);
    }

    #[tokio::test]
    async fn test_downgrade_to_free_cancels_at_period_end() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Basic).await;

        f.subs
            .change_tier(f.account_id, SubscriptionTier::Free, BillingInterval::Monthly)
            .await
            .unwrap();

        let account = f.credits.account(f.account_id).await.unwrap();
        assert!(account.cancel_at_period_end);
        assert!(f
            .provider
            .calls()
            .contains(&ProviderCall::CancelAtPeriodEnd("sub_123".to_string(), true)));
    }

    #[tokio::test]
    async fn test_changing_back_clears_pending_downgrade() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Premium).await;
        f.subs
            .change_tier(f.account_id, SubscriptionTier::Basic, BillingInterval::Monthly)
            .await
            .unwrap();

        f.subs
            .change_tier(f.account_id, SubscriptionTier::Premium, BillingInterval::Monthly)
            .await
            .unwrap();
        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.pending_downgrade_tier, None);
    }

    #[tokio::test]
    async fn test_deleted_subscription_normalizes_negative_balance() {
        let f = fixture().await;
        subscribe(&f, SubscriptionTier::Premium).await;
        // Unlimited usage may run the stored balance below zero
        f.credits
            .reserve_and_deduct(f.account_id, 25, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(f.credits.account(f.account_id).await.unwrap().credit_balance, -15);

        let account = f.credits.account(f.account_id).await.unwrap();
        f.subs.apply_subscription_deleted(&account).await.unwrap();

        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_tier, SubscriptionTier::Free);
        assert_eq!(account.subscription_status, SubscriptionStatus::None);
        assert_eq!(account.credit_balance, 0);
        assert!(account.external_subscription_ref.is_none());
    }

    #[tokio::test]
    async fn test_payment_failed_marks_past_due_without_balance_change() {
        let f = fixture().await;
        let account = subscribe(&f, SubscriptionTier::Basic).await;

        f.subs.apply_payment_failed(&account).await.unwrap();
        let account = f.credits.account(f.account_id).await.unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(account.credit_balance, 100);
    }
}
