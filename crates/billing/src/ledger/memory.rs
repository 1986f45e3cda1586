use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::{
    build_transaction, opening_grant, Account, AppendOutcome, DedupKey, LedgerStore,
    LedgerTransaction, NewTransaction, SubscriptionState,
};
use crate::error::{BillingError, BillingResult};

/// Per-account state guarded by its own mutex
#[derive(Debug)]
struct AccountCell {
    account: Account,
    ledger: Vec<LedgerTransaction>,
    dedup: HashMap<DedupKey, Uuid>,
}

/// In-memory ledger. Appends to one account never wait on another account.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    accounts: RwLock<HashMap<Uuid, Arc<Mutex<AccountCell>>>>,
    transactions: RwLock<HashMap<Uuid, LedgerTransaction>>,
    dedup: RwLock<HashMap<DedupKey, Uuid>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn cell(&self, account_id: Uuid) -> BillingResult<Arc<Mutex<AccountCell>>> {
        self.accounts
            .read()
            .await
            .get(&account_id)
            .cloned()
            .ok_or(BillingError::AccountNotFound(account_id))
    }

    async fn lookup(&self, key: DedupKey) -> BillingResult<Option<LedgerTransaction>> {
        let id = self.dedup.read().await.get(&key).copied();
        match id {
            Some(id) => self.get_transaction(id).await,
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self, account: &Account, opening_credits: i64) -> BillingResult<()> {
        let opening = opening_grant(account, opening_credits)?;

        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&account.account_id) {
            return Err(BillingError::AccountExists(account.account_id));
        }

        let mut account = account.clone();
        let mut ledger = Vec::new();
        if let Some(tx) = opening {
            account.credit_balance = tx.balance_after;
            self.transactions
                .write()
                .await
                .insert(tx.transaction_id, tx.clone());
            ledger.push(tx);
        }

        accounts.insert(
            account.account_id,
            Arc::new(Mutex::new(AccountCell {
                account,
                ledger,
                dedup: HashMap::new(),
            })),
        );
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let cell = self.accounts.read().await.get(&account_id).cloned();
        match cell {
            Some(cell) => Ok(Some(cell.lock().await.account.clone())),
            None => Ok(None),
        }
    }

    async fn find_account_by_customer(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<Account>> {
        let cells: Vec<_> = self.accounts.read().await.values().cloned().collect();
        for cell in cells {
            let cell = cell.lock().await;
            if cell.account.external_customer_ref.as_deref() == Some(customer_ref) {
                return Ok(Some(cell.account.clone()));
            }
        }
        Ok(None)
    }

    async fn list_account_ids(&self) -> BillingResult<Vec<Uuid>> {
        Ok(self.accounts.read().await.keys().copied().collect())
    }

    async fn save_subscription(
        &self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<Account> {
        let cell = self.cell(account_id).await?;
        let mut cell = cell.lock().await;
        cell.account.apply_subscription(state);
        cell.account.updated_at = OffsetDateTime::now_utc();
        Ok(cell.account.clone())
    }

    async fn set_active(&self, account_id: Uuid, active: bool) -> BillingResult<()> {
        let cell = self.cell(account_id).await?;
        let mut cell = cell.lock().await;
        cell.account.active = active;
        cell.account.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn advance_event_clock(
        &self,
        account_id: Uuid,
        event_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let cell = self.cell(account_id).await?;
        let mut cell = cell.lock().await;
        match cell.account.last_event_at {
            Some(last) if event_at < last => Ok(false),
            _ => {
                cell.account.last_event_at = Some(event_at);
                Ok(true)
            }
        }
    }

    async fn append(&self, request: NewTransaction) -> BillingResult<AppendOutcome> {
        let cell = self.cell(request.account_id).await?;
        let mut cell = cell.lock().await;

        let key = request.dedup_key();
        if let Some(existing) = key.and_then(|k| cell.dedup.get(&k).copied()) {
            if let Some(tx) = cell.ledger.iter().find(|tx| tx.transaction_id == existing) {
                return Ok(AppendOutcome::Duplicate(tx.clone()));
            }
        }

        if !cell.account.active && request.kind == clipmeter_shared::TransactionKind::Usage {
            return Err(BillingError::AccountInactive(request.account_id));
        }

        let now = OffsetDateTime::now_utc();
        let tx = build_transaction(
            &request,
            cell.account.credit_balance,
            cell.account.subscription_tier,
            now,
        )?;

        cell.account.credit_balance = tx.balance_after;
        cell.account.updated_at = now;
        cell.ledger.push(tx.clone());
        if let Some(key) = key {
            cell.dedup.insert(key, tx.transaction_id);
            self.dedup.write().await.insert(key, tx.transaction_id);
        }
        self.transactions
            .write()
            .await
            .insert(tx.transaction_id, tx.clone());

        Ok(AppendOutcome::Appended(tx))
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<LedgerTransaction>> {
        Ok(self.transactions.read().await.get(&transaction_id).cloned())
    }

    async fn find_refund_for(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<LedgerTransaction>> {
        self.lookup(DedupKey::RefundOf(transaction_id)).await
    }

    async fn find_usage_for_job(&self, job_id: Uuid) -> BillingResult<Option<LedgerTransaction>> {
        self.lookup(DedupKey::UsageFor(job_id)).await
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<LedgerTransaction>> {
        let cell = self.cell(account_id).await?;
        let cell = cell.lock().await;
        Ok(cell
            .ledger
            .iter()
            .rev()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_transactions(&self, account_id: Uuid) -> BillingResult<i64> {
        let cell = self.cell(account_id).await?;
        let count = cell.lock().await.ledger.len();
        Ok(count as i64)
    }

    async fn account_transactions(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<LedgerTransaction>> {
        let cell = self.cell(account_id).await?;
        let ledger = cell.lock().await.ledger.clone();
        Ok(ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::NewTransaction;
    use clipmeter_shared::TransactionKind;

    async fn store_with_account(balance: i64) -> (InMemoryLedgerStore, Uuid) {
        let store = InMemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        store
            .create_account(&Account::new(account_id, OffsetDateTime::now_utc()), balance)
            .await
            .unwrap();
        (store, account_id)
    }

    #[tokio::test]
    async fn test_append_updates_cached_balance() {
        let (store, account_id) = store_with_account(10).await;
        store
            .append(NewTransaction::usage(account_id, 3, Uuid::new_v4()))
            .await
            .unwrap();

        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.credit_balance, 7);
        assert_eq!(store.count_transactions(account_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let (store, account_id) = store_with_account(10).await;
        let err = store
            .create_account(&Account::new(account_id, OffsetDateTime::now_utc()), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountExists(_)));

        // The existing ledger is untouched
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.credit_balance, 10);
        assert_eq!(store.count_transactions(account_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_account_opens_with_its_grant_recorded() {
        let (store, account_id) = store_with_account(10).await;

        let ledger = store.account_transactions(account_id).await.unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].kind, TransactionKind::Bonus);
        assert_eq!(ledger[0].balance_before, 0);
        assert_eq!(ledger[0].balance_after, 10);
        assert_eq!(
            store.get_transaction(ledger[0].transaction_id).await.unwrap(),
            Some(ledger[0].clone())
        );

        let (empty, empty_id) = store_with_account(0).await;
        assert_eq!(empty.count_transactions(empty_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_negative_opening_grant_rejected() {
        let store = InMemoryLedgerStore::new();
        let account_id = Uuid::new_v4();
        let err = store
            .create_account(&Account::new(account_id, OffsetDateTime::now_utc()), -1)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidInput(_)));
        assert!(store.get_account(account_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_usage_for_same_job_is_duplicate() {
        let (store, account_id) = store_with_account(10).await;
        let job_id = Uuid::new_v4();

        let first = store
            .append(NewTransaction::usage(account_id, 4, job_id))
            .await
            .unwrap();
        let second = store
            .append(NewTransaction::usage(account_id, 4, job_id))
            .await
            .unwrap();

        assert!(matches!(first, AppendOutcome::Appended(_)));
        assert!(matches!(second, AppendOutcome::Duplicate(_)));
        assert_eq!(
            first.transaction().transaction_id,
            second.transaction().transaction_id
        );
        let account = store.get_account(account_id).await.unwrap().unwrap();
        assert_eq!(account.credit_balance, 6);
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_paginated() {
        let (store, account_id) = store_with_account(10).await;
        for _ in 0..3 {
            store
                .append(NewTransaction::usage(account_id, 1, Uuid::new_v4()))
                .await
                .unwrap();
        }

        let page = store.list_transactions(account_id, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].balance_after, 7);
        assert_eq!(page[1].balance_after, 8);

        let rest = store.list_transactions(account_id, 10, 2).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].kind, TransactionKind::Bonus);
    }

    #[tokio::test]
    async fn test_event_clock_rejects_older_events() {
        let (store, account_id) = store_with_account(0).await;
        let now = OffsetDateTime::now_utc();

        assert!(store.advance_event_clock(account_id, now).await.unwrap());
        assert!(store.advance_event_clock(account_id, now).await.unwrap());
        assert!(!store
            .advance_event_clock(account_id, now - time::Duration::seconds(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_inactive_account_cannot_spend() {
        let (store, account_id) = store_with_account(10).await;
        store.set_active(account_id, false).await.unwrap();

        let err = store
            .append(NewTransaction::usage(account_id, 1, Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AccountInactive(_)));
    }
}
