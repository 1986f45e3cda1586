//! Ledger invariant checks
//!
//! Replays every account's transaction log and compares it with the cached
//! balance and subscription fields. Checks only read. The worker runs them
//! on a schedule and logs anything found.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use clipmeter_shared::{SubscriptionStatus, TransactionKind};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::ledger::{Account, LedgerStore, LedgerTransaction};

/// Number of distinct invariants evaluated per run
const CHECKS_RUN: usize = 7;

/// A single broken invariant
#[derive(Debug, Clone, Serialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub account_id: Uuid,
    pub description: String,
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ViolationSeverity {
    /// Credits are wrong
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InvariantCheckSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub accounts_checked: usize,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let checked_at = OffsetDateTime::now_utc();
        let account_ids = self.store.list_account_ids().await?;
        let mut violations = Vec::new();

        for account_id in &account_ids {
            violations.extend(self.check_account(*account_id).await?);
        }

        let checks_failed = violations
            .iter()
            .map(|v| v.invariant.as_str())
            .collect::<HashSet<_>>()
            .len();

        Ok(InvariantCheckSummary {
            checked_at,
            accounts_checked: account_ids.len(),
            checks_run: CHECKS_RUN,
            checks_passed: CHECKS_RUN - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Every invariant for one account
    pub async fn check_account(&self, account_id: Uuid) -> BillingResult<Vec<InvariantViolation>> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(Vec::new());
        };
        let ledger = self.store.account_transactions(account_id).await?;

        let mut violations = Vec::new();
        violations.extend(check_balance_matches_ledger(&account, &ledger));
        violations.extend(check_chain_is_continuous(&account, &ledger));
        violations.extend(check_refunds(&account, &ledger));
        violations.extend(check_metered_balance(&account));
        violations.extend(check_subscription_fields(&account));
        Ok(violations)
    }
}

fn violation(
    invariant: &str,
    account: &Account,
    severity: ViolationSeverity,
    description: String,
    context: serde_json::Value,
) -> InvariantViolation {
    InvariantViolation {
        invariant: invariant.to_string(),
        account_id: account.account_id,
        description,
        context,
        severity,
    }
}

/// Cached balance equals the sum of all transaction amounts
fn check_balance_matches_ledger(
    account: &Account,
    ledger: &[LedgerTransaction],
) -> Option<InvariantViolation> {
    let sum: i64 = ledger.iter().map(|tx| tx.amount).sum();
    (sum != account.credit_balance).then(|| {
        violation(
            "balance_matches_ledger",
            account,
            ViolationSeverity::Critical,
            format!(
                "Balance {} does not match ledger sum {}",
                account.credit_balance, sum
            ),
            serde_json::json!({
                "credit_balance": account.credit_balance,
                "ledger_sum": sum,
                "transactions": ledger.len(),
            }),
        )
    })
}

/// Each transaction starts where the previous one ended
fn check_chain_is_continuous(
    account: &Account,
    ledger: &[LedgerTransaction],
) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();
    let mut expected_before = 0;

    for tx in ledger {
        if tx.balance_before != expected_before || tx.balance_after != tx.balance_before + tx.amount
        {
            violations.push(violation(
                "ledger_chain_continuous",
                account,
                ViolationSeverity::Critical,
                format!("Transaction {} breaks the balance chain", tx.transaction_id),
                serde_json::json!({
                    "transaction_id": tx.transaction_id,
                    "expected_balance_before": expected_before,
                    "balance_before": tx.balance_before,
                    "amount": tx.amount,
                    "balance_after": tx.balance_after,
                }),
            ));
        }
        expected_before = tx.balance_after;
    }

    violations
}

/// Refunds reverse exactly one usage deduction of the same account
fn check_refunds(account: &Account, ledger: &[LedgerTransaction]) -> Vec<InvariantViolation> {
    let by_id: HashMap<Uuid, &LedgerTransaction> =
        ledger.iter().map(|tx| (tx.transaction_id, tx)).collect();
    let mut refunds_per_usage: HashMap<Uuid, usize> = HashMap::new();
    let mut violations = Vec::new();

    for refund in ledger.iter().filter(|tx| tx.kind == TransactionKind::Refund) {
        let original = refund
            .related_transaction_id
            .and_then(|id| by_id.get(&id).copied());

        match original {
            Some(usage) if usage.kind == TransactionKind::Usage => {
                *refunds_per_usage.entry(usage.transaction_id).or_default() += 1;
                if refund.amount != -usage.amount {
                    violations.push(violation(
                        "refund_matches_usage",
                        account,
                        ViolationSeverity::Critical,
                        format!(
                            "Refund {} of {} does not reverse usage {} of {}",
                            refund.transaction_id,
                            refund.amount,
                            usage.transaction_id,
                            usage.amount
                        ),
                        serde_json::json!({
                            "refund_id": refund.transaction_id,
                            "usage_id": usage.transaction_id,
                        }),
                    ));
                }
            }
            _ => violations.push(violation(
                "refund_matches_usage",
                account,
                ViolationSeverity::Critical,
                format!(
                    "Refund {} does not reference a usage transaction of this account",
                    refund.transaction_id
                ),
                serde_json::json!({
                    "refund_id": refund.transaction_id,
                    "related_transaction_id": refund.related_transaction_id,
                }),
            )),
        }
    }

    for (usage_id, count) in refunds_per_usage {
        if count > 1 {
            violations.push(violation(
                "single_refund_per_usage",
                account,
                ViolationSeverity::Critical,
                format!("Usage {usage_id} was refunded {count} times"),
                serde_json::json!({ "usage_id": usage_id, "refunds": count }),
            ));
        }
    }

    violations
}

/// Only unlimited tiers may run a negative balance
fn check_metered_balance(account: &Account) -> Option<InvariantViolation> {
    (account.credit_balance < 0 && !account.subscription_tier.is_unlimited()).then(|| {
        violation(
            "metered_balance_non_negative",
            account,
            ViolationSeverity::High,
            format!(
                "{} account has negative balance {}",
                account.subscription_tier, account.credit_balance
            ),
            serde_json::json!({
                "tier": account.subscription_tier,
                "credit_balance": account.credit_balance,
            }),
        )
    })
}

fn check_subscription_fields(account: &Account) -> Vec<InvariantViolation> {
    let mut violations = Vec::new();

    if account.subscription_tier.is_paid() && account.external_subscription_ref.is_none() {
        violations.push(violation(
            "paid_tier_has_subscription",
            account,
            ViolationSeverity::Medium,
            format!(
                "Account is on {} without a provider subscription",
                account.subscription_tier
            ),
            serde_json::json!({ "tier": account.subscription_tier }),
        ));
    }

    if account.subscription_status == SubscriptionStatus::Canceled
        && account.current_period_end.is_none()
    {
        violations.push(violation(
            "canceled_has_period_end",
            account,
            ViolationSeverity::Low,
            "Canceled subscription has no period end".to_string(),
            serde_json::json!({ "status": account.subscription_status }),
        ));
    }

    violations
}
