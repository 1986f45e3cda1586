//! Credit ledger storage
//!
//! The ledger is an append-only log of balance-affecting transactions. The
//! balance stored on each account is a cache of that log and is only ever
//! written in the same atomic unit that appends a transaction.
//!
//! Two backends implement [`LedgerStore`]:
//!
//! - [`PgLedgerStore`]: Postgres, row lock per account (`SELECT ... FOR UPDATE`)
//! - [`InMemoryLedgerStore`]: per-account async mutex, for tests and local runs

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryLedgerStore;
pub use postgres::PgLedgerStore;
pub use store::LedgerStore;

use clipmeter_shared::{SubscriptionStatus, SubscriptionTier, TransactionKind};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// An account's cached balance and subscription state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub account_id: Uuid,
    pub credit_balance: i64,
    pub subscription_tier: SubscriptionTier,
    pub subscription_status: SubscriptionStatus,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    /// Start of the current billing period
    #[serde(with = "time::serde::rfc3339::option")]
    pub billing_anchor: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Downgrade requested by the user, applied at the next renewal
    pub pending_downgrade_tier: Option<SubscriptionTier>,
    /// Creation time of the newest provider event applied to this account
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Account {
    /// A fresh free-tier account with an empty balance
    pub fn new(account_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            account_id,
            credit_balance: 0,
            subscription_tier: SubscriptionTier::Free,
            subscription_status: SubscriptionStatus::None,
            external_customer_ref: None,
            external_subscription_ref: None,
            billing_anchor: None,
            current_period_end: None,
            cancel_at_period_end: false,
            pending_downgrade_tier: None,
            last_event_at: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subscription(&self) -> SubscriptionState {
        SubscriptionState {
            tier: self.subscription_tier,
            status: self.subscription_status,
            external_customer_ref: self.external_customer_ref.clone(),
            external_subscription_ref: self.external_subscription_ref.clone(),
            billing_anchor: self.billing_anchor,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            pending_downgrade_tier: self.pending_downgrade_tier,
        }
    }

    pub(crate) fn apply_subscription(&mut self, state: &SubscriptionState) {
        self.subscription_tier = state.tier;
        self.subscription_status = state.status;
        self.external_customer_ref = state.external_customer_ref.clone();
        self.external_subscription_ref = state.external_subscription_ref.clone();
        self.billing_anchor = state.billing_anchor;
        self.current_period_end = state.current_period_end;
        self.cancel_at_period_end = state.cancel_at_period_end;
        self.pending_downgrade_tier = state.pending_downgrade_tier;
    }
}

/// Subscription fields of an account, written as one unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub external_customer_ref: Option<String>,
    pub external_subscription_ref: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub billing_anchor: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub pending_downgrade_tier: Option<SubscriptionTier>,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerTransaction {
    pub transaction_id: Uuid,
    pub account_id: Uuid,
    /// Signed delta applied to the balance
    pub amount: i64,
    pub kind: TransactionKind,
    pub balance_before: i64,
    pub balance_after: i64,
    pub related_job_id: Option<Uuid>,
    /// For refunds, the usage transaction being reversed
    pub related_transaction_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// How a new transaction moves the balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceChange {
    /// Add a signed delta
    Delta(i64),
    /// Set the balance to an absolute value; the delta is computed under the lock
    SetTo(i64),
}

/// Whether the append must reject a debit that would overdraw the account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundsPolicy {
    /// Reject overdrafts unless the account is on an unlimited tier at the
    /// moment the lock is held
    EnforceForMetered,
    Unchecked,
}

/// Request to append a transaction
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub account_id: Uuid,
    pub kind: TransactionKind,
    pub change: BalanceChange,
    pub funds: FundsPolicy,
    pub related_job_id: Option<Uuid>,
    pub related_transaction_id: Option<Uuid>,
}

impl NewTransaction {
    pub fn usage(account_id: Uuid, amount: i64, job_id: Uuid) -> Self {
        Self {
            account_id,
            kind: TransactionKind::Usage,
            change: BalanceChange::Delta(-amount),
            funds: FundsPolicy::EnforceForMetered,
            related_job_id: Some(job_id),
            related_transaction_id: None,
        }
    }

    pub fn refund_of(original: &LedgerTransaction) -> Self {
        Self {
            account_id: original.account_id,
            kind: TransactionKind::Refund,
            change: BalanceChange::Delta(original.amount.abs()),
            funds: FundsPolicy::Unchecked,
            related_job_id: original.related_job_id,
            related_transaction_id: Some(original.transaction_id),
        }
    }

    pub fn grant(account_id: Uuid, kind: TransactionKind, change: BalanceChange) -> Self {
        Self {
            account_id,
            kind,
            change,
            funds: FundsPolicy::Unchecked,
            related_job_id: None,
            related_transaction_id: None,
        }
    }

    /// Key under which a second append is treated as a replay of the first
    pub(crate) fn dedup_key(&self) -> Option<DedupKey> {
        match self.kind {
            TransactionKind::Refund => self.related_transaction_id.map(DedupKey::RefundOf),
            TransactionKind::Usage => self.related_job_id.map(DedupKey::UsageFor),
            _ => None,
        }
    }

    /// Resolve the signed amount against the balance read under the lock
    pub(crate) fn amount_against(&self, balance: i64) -> Option<i64> {
        match self.change {
            BalanceChange::Delta(delta) => Some(delta),
            BalanceChange::SetTo(target) => target.checked_sub(balance),
        }
    }
}

/// Opening grant for a new account, built against its empty balance
pub(crate) fn opening_grant(
    account: &Account,
    opening_credits: i64,
) -> crate::error::BillingResult<Option<LedgerTransaction>> {
    if opening_credits < 0 {
        return Err(crate::error::BillingError::InvalidInput(format!(
            "opening credits must not be negative, got {opening_credits}"
        )));
    }
    if opening_credits == 0 {
        return Ok(None);
    }
    let request = NewTransaction::grant(
        account.account_id,
        TransactionKind::Bonus,
        BalanceChange::Delta(opening_credits),
    );
    build_transaction(
        &request,
        account.credit_balance,
        account.subscription_tier,
        account.created_at,
    )
    .map(Some)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum DedupKey {
    RefundOf(Uuid),
    UsageFor(Uuid),
}

/// Result of an append
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended(LedgerTransaction),
    /// An equivalent transaction was already recorded; nothing changed
    Duplicate(LedgerTransaction),
}

impl AppendOutcome {
    pub fn transaction(&self) -> &LedgerTransaction {
        match self {
            AppendOutcome::Appended(tx) | AppendOutcome::Duplicate(tx) => tx,
        }
    }
}

/// Check an append against the locked balance and build the transaction.
///
/// Shared by both backends so the overdraft rule lives in one place.
pub(crate) fn build_transaction(
    request: &NewTransaction,
    balance: i64,
    tier: SubscriptionTier,
    now: OffsetDateTime,
) -> crate::error::BillingResult<LedgerTransaction> {
    let overflow = || {
        crate::error::BillingError::InvalidInput(format!(
            "{} transaction would overflow balance {balance}",
            request.kind
        ))
    };
    let amount = request.amount_against(balance).ok_or_else(overflow)?;
    let balance_after = balance.checked_add(amount).ok_or_else(overflow)?;

    if request.funds == FundsPolicy::EnforceForMetered
        && !tier.is_unlimited()
        && amount < 0
        && balance_after < 0
    {
        return Err(crate::error::BillingError::InsufficientCredits {
            required: -amount,
            available: balance,
        });
    }

    Ok(LedgerTransaction {
        transaction_id: Uuid::new_v4(),
        account_id: request.account_id,
        amount,
        kind: request.kind,
        balance_before: balance,
        balance_after,
        related_job_id: request.related_job_id,
        related_transaction_id: request.related_transaction_id,
        created_at: now,
    })
}
