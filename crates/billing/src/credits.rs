//! Credit ledger service
//!
//! All balance changes in the system go through [`CreditLedgerService`]. It
//! validates requests and hands the atomic work to the [`LedgerStore`].

use std::sync::Arc;

use clipmeter_shared::TransactionKind;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::ledger::{
    Account, AppendOutcome, BalanceChange, LedgerStore, LedgerTransaction, NewTransaction,
};
use crate::plans::FREE_STARTING_CREDITS;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// Outcome of a refund request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "transaction_id", rename_all = "snake_case")]
pub enum RefundOutcome {
    Refunded(Uuid),
    /// The original deduction was already refunded by this transaction
    AlreadyRefunded(Uuid),
}

impl RefundOutcome {
    pub fn transaction_id(&self) -> Uuid {
        match self {
            RefundOutcome::Refunded(id) | RefundOutcome::AlreadyRefunded(id) => *id,
        }
    }
}

/// Page request for transaction history
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    fn resolve(&self) -> (i64, i64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub transactions: Vec<LedgerTransaction>,
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
}

/// Running totals over an account's whole ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageStats {
    pub account_id: Uuid,
    pub credit_balance: i64,
    pub total_used: i64,
    pub total_refunded: i64,
    pub total_purchased: i64,
    pub total_bonus: i64,
    pub total_renewed: i64,
    /// Usage that was not given back
    pub net_usage: i64,
    pub jobs_charged: i64,
    pub jobs_refunded: i64,
}

#[derive(Clone)]
pub struct CreditLedgerService {
    store: Arc<dyn LedgerStore>,
}

impl CreditLedgerService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Create an account at registration, seeded with the free-tier balance
    pub async fn open_account(&self, account_id: Uuid) -> BillingResult<Account> {
        let account = Account::new(account_id, OffsetDateTime::now_utc());
        self.store
            .create_account(&account, FREE_STARTING_CREDITS)
            .await?;

        tracing::info!(
            account_id = %account_id,
            credits = FREE_STARTING_CREDITS,
            "Opened account with free-tier credits"
        );

        self.account(account_id).await
    }

    pub async fn account(&self, account_id: Uuid) -> BillingResult<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    /// Whether the account can currently afford `required` credits
    pub async fn check_balance(&self, account_id: Uuid, required: i64) -> BillingResult<bool> {
        let account = self.account(account_id).await?;
        if !account.active {
            return Ok(false);
        }
        if account.subscription_tier.is_unlimited() {
            return Ok(true);
        }
        Ok(account.credit_balance >= required)
    }

    /// Atomically check and subtract credits for a job.
    ///
    /// A second call for the same job returns the original deduction without
    /// charging again.
    pub async fn reserve_and_deduct(
        &self,
        account_id: Uuid,
        amount: i64,
        job_id: Uuid,
    ) -> BillingResult<Uuid> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "deduction amount must be positive, got {amount}"
            )));
        }

        let outcome = match self
            .store
            .append(NewTransaction::usage(account_id, amount, job_id))
            .await
        {
            Ok(outcome) => outcome,
            Err(BillingError::InsufficientCredits {
                required,
                available,
            }) => {
                tracing::info!(
                    account_id = %account_id,
                    job_id = %job_id,
                    required = required,
                    available = available,
                    "Deduction denied: insufficient credits"
                );
                return Err(BillingError::InsufficientCredits {
                    required,
                    available,
                });
            }
            Err(e) => return Err(e),
        };

        match outcome {
            AppendOutcome::Appended(tx) => {
                tracing::info!(
                    account_id = %account_id,
                    job_id = %job_id,
                    transaction_id = %tx.transaction_id,
                    amount = amount,
                    balance_after = tx.balance_after,
                    "Reserved credits for job"
                );
                Ok(tx.transaction_id)
            }
            AppendOutcome::Duplicate(tx) => {
                tracing::info!(
                    account_id = %account_id,
                    job_id = %job_id,
                    transaction_id = %tx.transaction_id,
                    "Job already holds a reservation"
                );
                Ok(tx.transaction_id)
            }
        }
    }

    /// Reverse a usage deduction. Idempotent on the original transaction id.
    pub async fn refund(&self, transaction_id: Uuid) -> BillingResult<RefundOutcome> {
        let original = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or(BillingError::TransactionNotFound(transaction_id))?;

        if original.kind != TransactionKind::Usage {
            return Err(BillingError::InvalidRefund(format!(
                "transaction {} is a {} transaction; only usage can be refunded",
                transaction_id, original.kind
            )));
        }

        if let Some(existing) = self.store.find_refund_for(transaction_id).await? {
            tracing::info!(
                transaction_id = %transaction_id,
                refund_id = %existing.transaction_id,
                "Refund already recorded"
            );
            return Ok(RefundOutcome::AlreadyRefunded(existing.transaction_id));
        }

        match self.store.append(NewTransaction::refund_of(&original)).await? {
            AppendOutcome::Appended(tx) => {
                tracing::info!(
                    account_id = %original.account_id,
                    transaction_id = %transaction_id,
                    refund_id = %tx.transaction_id,
                    amount = tx.amount,
                    balance_after = tx.balance_after,
                    "Refunded credits"
                );
                Ok(RefundOutcome::Refunded(tx.transaction_id))
            }
            AppendOutcome::Duplicate(tx) => Ok(RefundOutcome::AlreadyRefunded(tx.transaction_id)),
        }
    }

    /// Mint credits as a purchase, bonus or renewal
    pub async fn credit(
        &self,
        account_id: Uuid,
        amount: i64,
        kind: TransactionKind,
    ) -> BillingResult<Uuid> {
        if amount <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "credit amount must be positive, got {amount}"
            )));
        }
        if !kind.is_grant() {
            return Err(BillingError::InvalidInput(format!(
                "{kind} transactions cannot be minted directly"
            )));
        }

        let tx = self
            .store
            .append(NewTransaction::grant(
                account_id,
                kind,
                BalanceChange::Delta(amount),
            ))
            .await?;
        let tx = tx.transaction();

        tracing::info!(
            account_id = %account_id,
            kind = %kind,
            amount = amount,
            balance_after = tx.balance_after,
            "Credited account"
        );

        Ok(tx.transaction_id)
    }

    /// Set the balance to an absolute value, recording the difference.
    ///
    /// Used for renewals (reset, no rollover) and to clear a negative
    /// balance left behind by an unlimited tier. Returns `None` when the
    /// balance is already at the target.
    pub async fn reset_balance(
        &self,
        account_id: Uuid,
        target: i64,
        kind: TransactionKind,
    ) -> BillingResult<Option<LedgerTransaction>> {
        if !kind.is_grant() {
            return Err(BillingError::InvalidInput(format!(
                "{kind} transactions cannot reset a balance"
            )));
        }

        let account = self.account(account_id).await?;
        if kind != TransactionKind::Renewal && account.credit_balance == target {
            return Ok(None);
        }

        let outcome = self
            .store
            .append(NewTransaction::grant(
                account_id,
                kind,
                BalanceChange::SetTo(target),
            ))
            .await?;
        let tx = outcome.transaction().clone();

        tracing::info!(
            account_id = %account_id,
            kind = %kind,
            amount = tx.amount,
            balance_after = tx.balance_after,
            "Reset account balance"
        );

        Ok(Some(tx))
    }

    pub async fn history(
        &self,
        account_id: Uuid,
        pagination: Pagination,
    ) -> BillingResult<HistoryPage> {
        // Surface a missing account as such rather than an empty page
        self.account(account_id).await?;

        let (limit, offset) = pagination.resolve();
        let transactions = self
            .store
            .list_transactions(account_id, limit, offset)
            .await?;
        let total = self.store.count_transactions(account_id).await?;

        Ok(HistoryPage {
            transactions,
            total,
            limit,
            offset,
        })
    }

    pub async fn stats(&self, account_id: Uuid) -> BillingResult<UsageStats> {
        let account = self.account(account_id).await?;
        let ledger = self.store.account_transactions(account_id).await?;

        let mut stats = UsageStats {
            account_id,
            credit_balance: account.credit_balance,
            ..Default::default()
        };

        for tx in &ledger {
            match tx.kind {
                TransactionKind::Usage => {
                    stats.total_used += -tx.amount;
                    stats.jobs_charged += 1;
                }
                TransactionKind::Refund => {
                    stats.total_refunded += tx.amount;
                    stats.jobs_refunded += 1;
                }
                TransactionKind::Purchase => stats.total_purchased += tx.amount,
                TransactionKind::Bonus => stats.total_bonus += tx.amount,
                TransactionKind::Renewal => stats.total_renewed += tx.amount,
            }
        }
        stats.net_usage = stats.total_used - stats.total_refunded;

        Ok(stats)
    }

    /// The usage deduction recorded for a job, if any
    pub async fn usage_for_job(&self, job_id: Uuid) -> BillingResult<Option<LedgerTransaction>> {
        self.store.find_usage_for_job(job_id).await
    }

    /// Deactivate an account. Its ledger is kept; further usage is rejected.
    pub async fn deactivate(&self, account_id: Uuid) -> BillingResult<()> {
        self.store.set_active(account_id, false).await?;
        tracing::info!(account_id = %account_id, "Deactivated account");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedgerStore;

    fn service() -> CreditLedgerService {
        CreditLedgerService::new(Arc::new(InMemoryLedgerStore::new()))
    }

    #[tokio::test]
    async fn test_open_account_seeds_free_credits() {
        let credits = service();
        let account = credits.open_account(Uuid::new_v4()).await.unwrap();

        assert_eq!(account.credit_balance, 10);
        let history = credits
            .history(account.account_id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.transactions[0].kind, TransactionKind::Bonus);
    }

    #[tokio::test]
    async fn test_deduct_then_refund_restores_balance() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let tx = credits
            .reserve_and_deduct(account_id, 7, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(credits.account(account_id).await.unwrap().credit_balance, 3);

        let outcome = credits.refund(tx).await.unwrap();
        assert!(matches!(outcome, RefundOutcome::Refunded(_)));
        assert_eq!(credits.account(account_id).await.unwrap().credit_balance, 10);
    }

    #[tokio::test]
    async fn test_refund_twice_returns_existing_refund() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;
        let tx = credits
            .reserve_and_deduct(account_id, 4, Uuid::new_v4())
            .await
            .unwrap();

        let first = credits.refund(tx).await.unwrap();
        let second = credits.refund(tx).await.unwrap();

        assert_eq!(
            second,
            RefundOutcome::AlreadyRefunded(first.transaction_id())
        );
        assert_eq!(credits.account(account_id).await.unwrap().credit_balance, 10);
    }

    #[tokio::test]
    async fn test_refund_of_refund_rejected() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;
        let tx = credits
            .reserve_and_deduct(account_id, 2, Uuid::new_v4())
            .await
            .unwrap();
        let refund = credits.refund(tx).await.unwrap().transaction_id();

        let err = credits.refund(refund).await.unwrap_err();
        assert!(matches!(err, BillingError::InvalidRefund(_)));
    }

    #[tokio::test]
    async fn test_refund_of_unknown_transaction() {
        let credits = service();
        let err = credits.refund(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn test_insufficient_credits_leaves_no_trace() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let err = credits
            .reserve_and_deduct(account_id, 11, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BillingError::InsufficientCredits {
                required: 11,
                available: 10
            }
        ));
        let history = credits
            .history(account_id, Pagination::default())
            .await
            .unwrap();
        assert_eq!(history.total, 1);
    }

    #[tokio::test]
    async fn test_credit_rejects_non_grant_kinds() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let err = credits
            .credit(account_id, 5, TransactionKind::Refund)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));

        let err = credits
            .credit(account_id, 0, TransactionKind::Purchase)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_reset_balance_records_difference() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let tx = credits
            .reset_balance(account_id, 100, TransactionKind::Renewal)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tx.amount, 90);
        assert_eq!(tx.balance_after, 100);
    }

    #[tokio::test]
    async fn test_stats_track_net_usage() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;
        credits
            .credit(account_id, 20, TransactionKind::Purchase)
            .await
            .unwrap();
        let charged = credits
            .reserve_and_deduct(account_id, 5, Uuid::new_v4())
            .await
            .unwrap();
        credits
            .reserve_and_deduct(account_id, 3, Uuid::new_v4())
            .await
            .unwrap();
        credits.refund(charged).await.unwrap();

        let stats = credits.stats(account_id).await.unwrap();
        assert_eq!(stats.total_used, 8);
        assert_eq!(stats.total_refunded, 5);
        assert_eq!(stats.net_usage, 3);
        assert_eq!(stats.total_purchased, 20);
        assert_eq!(stats.total_bonus, 10);
        assert_eq!(stats.jobs_charged, 2);
        assert_eq!(stats.credit_balance, 27);
    }

    #[tokio::test]
    async fn test_history_pagination_is_clamped() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;

        let page = credits
            .history(
                account_id,
                Pagination {
                    limit: Some(10_000),
                    offset: Some(-4),
                },
            )
            .await
            .unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);
        assert_eq!(page.offset, 0);
    }

    #[tokio::test]
    async fn test_deactivated_account_fails_balance_check() {
        let credits = service();
        let account_id = credits.open_account(Uuid::new_v4()).await.unwrap().account_id;
        credits.deactivate(account_id).await.unwrap();

        assert!(!credits.check_balance(account_id, 1).await.unwrap());
    }
}
