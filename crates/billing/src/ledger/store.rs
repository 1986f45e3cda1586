use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{Account, AppendOutcome, LedgerTransaction, NewTransaction, SubscriptionState};
use crate::error::BillingResult;

/// Durable storage for accounts and their transaction log.
///
/// `append` is the only way to change a balance. Implementations must run the
/// balance read, overdraft check, duplicate check, insert and balance update as
/// one unit serialized per account; different accounts must not contend.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new account together with its opening `bonus` grant, as one
    /// unit. No grant is written when `opening_credits` is zero. Fails with
    /// `AccountExists` on a duplicate id.
    async fn create_account(&self, account: &Account, opening_credits: i64) -> BillingResult<()>;

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>>;

    async fn find_account_by_customer(&self, customer_ref: &str)
        -> BillingResult<Option<Account>>;

    async fn list_account_ids(&self) -> BillingResult<Vec<Uuid>>;

    /// Overwrite the subscription fields; never touches the balance.
    async fn save_subscription(
        &self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<Account>;

    async fn set_active(&self, account_id: Uuid, active: bool) -> BillingResult<()>;

    /// Move the account's provider event clock forward.
    ///
    /// Returns `false` without writing when `event_at` is strictly older than
    /// the last applied event.
    async fn advance_event_clock(
        &self,
        account_id: Uuid,
        event_at: OffsetDateTime,
    ) -> BillingResult<bool>;

    /// Atomically append a transaction and update the cached balance.
    async fn append(&self, request: NewTransaction) -> BillingResult<AppendOutcome>;

    async fn get_transaction(&self, transaction_id: Uuid)
        -> BillingResult<Option<LedgerTransaction>>;

    /// The refund recorded against a usage transaction, if any
    async fn find_refund_for(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<LedgerTransaction>>;

    /// The usage deduction recorded for a job, if any
    async fn find_usage_for_job(&self, job_id: Uuid) -> BillingResult<Option<LedgerTransaction>>;

    /// Newest first
    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<LedgerTransaction>>;

    async fn count_transactions(&self, account_id: Uuid) -> BillingResult<i64>;

    /// Full log of an account, oldest first
    async fn account_transactions(&self, account_id: Uuid)
        -> BillingResult<Vec<LedgerTransaction>>;
}
