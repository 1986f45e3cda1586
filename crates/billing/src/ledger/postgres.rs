use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    build_transaction, opening_grant, Account, AppendOutcome, DedupKey, LedgerStore,
    LedgerTransaction, NewTransaction, SubscriptionState,
};
use crate::error::{BillingError, BillingResult};
use clipmeter_shared::TransactionKind;

const ACCOUNT_COLUMNS: &str = r#"
    account_id, credit_balance, subscription_tier, subscription_status,
    external_customer_ref, external_subscription_ref, billing_anchor,
    current_period_end, cancel_at_period_end, pending_downgrade_tier,
    last_event_at, active, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    transaction_id, account_id, amount, kind, balance_before, balance_after,
    related_job_id, related_transaction_id, created_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    account_id: Uuid,
    credit_balance: i64,
    subscription_tier: String,
    subscription_status: String,
    external_customer_ref: Option<String>,
    external_subscription_ref: Option<String>,
    billing_anchor: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    pending_downgrade_tier: Option<String>,
    last_event_at: Option<OffsetDateTime>,
    active: bool,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<AccountRow> for Account {
    type Error = BillingError;

    fn try_from(row: AccountRow) -> Result<Self, Self::Error> {
        Ok(Account {
            account_id: row.account_id,
            credit_balance: row.credit_balance,
            subscription_tier: row.subscription_tier.parse()?,
            subscription_status: row.subscription_status.parse()?,
            external_customer_ref: row.external_customer_ref,
            external_subscription_ref: row.external_subscription_ref,
            billing_anchor: row.billing_anchor,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            pending_downgrade_tier: row
                .pending_downgrade_tier
                .map(|tier| tier.parse())
                .transpose()?,
            last_event_at: row.last_event_at,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    account_id: Uuid,
    amount: i64,
    kind: String,
    balance_before: i64,
    balance_after: i64,
    related_job_id: Option<Uuid>,
    related_transaction_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

impl TryFrom<TransactionRow> for LedgerTransaction {
    type Error = BillingError;

    fn try_from(row: TransactionRow) -> Result<Self, Self::Error> {
        Ok(LedgerTransaction {
            transaction_id: row.transaction_id,
            account_id: row.account_id,
            amount: row.amount,
            kind: row.kind.parse()?,
            balance_before: row.balance_before,
            balance_after: row.balance_after,
            related_job_id: row.related_job_id,
            related_transaction_id: row.related_transaction_id,
            created_at: row.created_at,
        })
    }
}

fn into_transactions(rows: Vec<TransactionRow>) -> BillingResult<Vec<LedgerTransaction>> {
    rows.into_iter().map(LedgerTransaction::try_from).collect()
}

/// Postgres-backed ledger
#[derive(Debug, Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a ledger row. `None` when a unique index rejected it.
    async fn insert_transaction<'e, E>(
        executor: E,
        tx: &LedgerTransaction,
    ) -> BillingResult<Option<Uuid>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO ledger_transactions
                (transaction_id, account_id, amount, kind, balance_before, balance_after,
                 related_job_id, related_transaction_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            RETURNING transaction_id
            "#,
        )
        .bind(tx.transaction_id)
        .bind(tx.account_id)
        .bind(tx.amount)
        .bind(tx.kind.as_str())
        .bind(tx.balance_before)
        .bind(tx.balance_after)
        .bind(tx.related_job_id)
        .bind(tx.related_transaction_id)
        .bind(tx.created_at)
        .fetch_optional(executor)
        .await?;
        Ok(inserted)
    }

    async fn find_by_key<'e, E>(
        executor: E,
        key: DedupKey,
    ) -> BillingResult<Option<LedgerTransaction>>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let (column, kind, id) = match key {
            DedupKey::RefundOf(id) => ("related_transaction_id", TransactionKind::Refund, id),
            DedupKey::UsageFor(id) => ("related_job_id", TransactionKind::Usage, id),
        };
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions WHERE {column} = $1 AND kind = $2"
        );
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(kind.as_str())
            .fetch_optional(executor)
            .await?;
        row.map(LedgerTransaction::try_from).transpose()
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn create_account(&self, account: &Account, opening_credits: i64) -> BillingResult<()> {
        let opening = opening_grant(account, opening_credits)?;
        let balance = opening
            .as_ref()
            .map_or(account.credit_balance, |tx| tx.balance_after);

        let mut db_tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO accounts
                (account_id, credit_balance, subscription_tier, subscription_status,
                 active, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account.account_id)
        .bind(balance)
        .bind(account.subscription_tier.as_str())
        .bind(account.subscription_status.as_str())
        .bind(account.active)
        .bind(account.created_at)
        .execute(&mut *db_tx)
        .await?;

        if result.rows_affected() == 0 {
            db_tx.rollback().await?;
            return Err(BillingError::AccountExists(account.account_id));
        }

        if let Some(tx) = &opening {
            Self::insert_transaction(&mut *db_tx, tx).await?;
        }

        db_tx.commit().await?;
        Ok(())
    }

    async fn get_account(&self, account_id: Uuid) -> BillingResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = $1");
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Account::try_from).transpose()
    }

    async fn find_account_by_customer(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE external_customer_ref = $1");
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(customer_ref)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Account::try_from).transpose()
    }

    async fn list_account_ids(&self) -> BillingResult<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT account_id FROM accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn save_subscription(
        &self,
        account_id: Uuid,
        state: &SubscriptionState,
    ) -> BillingResult<Account> {
        let sql = format!(
            r#"
            UPDATE accounts SET
                subscription_tier = $2,
                subscription_status = $3,
                external_customer_ref = $4,
                external_subscription_ref = $5,
                billing_anchor = $6,
                current_period_end = $7,
                cancel_at_period_end = $8,
                pending_downgrade_tier = $9,
                updated_at = NOW()
            WHERE account_id = $1
            RETURNING {ACCOUNT_COLUMNS}
            "#
        );
        let row: Option<AccountRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .bind(state.tier.as_str())
            .bind(state.status.as_str())
            .bind(&state.external_customer_ref)
            .bind(&state.external_subscription_ref)
            .bind(state.billing_anchor)
            .bind(state.current_period_end)
            .bind(state.cancel_at_period_end)
            .bind(state.pending_downgrade_tier.map(|tier| tier.as_str()))
            .fetch_optional(&self.pool)
            .await?;

        row.ok_or(BillingError::AccountNotFound(account_id))
            .and_then(Account::try_from)
    }

    async fn set_active(&self, account_id: Uuid, active: bool) -> BillingResult<()> {
        let result =
            sqlx::query("UPDATE accounts SET active = $2, updated_at = NOW() WHERE account_id = $1")
                .bind(account_id)
                .bind(active)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::AccountNotFound(account_id));
        }
        Ok(())
    }

    async fn advance_event_clock(
        &self,
        account_id: Uuid,
        event_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let advanced: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE accounts SET last_event_at = $2
            WHERE account_id = $1
              AND (last_event_at IS NULL OR last_event_at <= $2)
            RETURNING account_id
            "#,
        )
        .bind(account_id)
        .bind(event_at)
        .fetch_optional(&self.pool)
        .await?;

        if advanced.is_some() {
            return Ok(true);
        }

        // Distinguish a stale event from a missing account
        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT account_id FROM accounts WHERE account_id = $1")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        match exists {
            Some(_) => Ok(false),
            None => Err(BillingError::AccountNotFound(account_id)),
        }
    }

    async fn append(&self, request: NewTransaction) -> BillingResult<AppendOutcome> {
        let mut db_tx = self.pool.begin().await?;

        // Row lock serializes every balance change on this account
        let locked: Option<(i64, String, bool)> = sqlx::query_as(
            "SELECT credit_balance, subscription_tier, active FROM accounts WHERE account_id = $1 FOR UPDATE",
        )
        .bind(request.account_id)
        .fetch_optional(&mut *db_tx)
        .await?;

        let (balance, tier, active) =
            locked.ok_or(BillingError::AccountNotFound(request.account_id))?;

        let key = request.dedup_key();
        if let Some(key) = key {
            if let Some(existing) = Self::find_by_key(&mut *db_tx, key).await? {
                db_tx.rollback().await?;
                return Ok(AppendOutcome::Duplicate(existing));
            }
        }

        if !active && request.kind == TransactionKind::Usage {
            return Err(BillingError::AccountInactive(request.account_id));
        }

        let tx = build_transaction(&request, balance, tier.parse()?, OffsetDateTime::now_utc())?;

        let inserted = Self::insert_transaction(&mut *db_tx, &tx).await?;

        if inserted.is_none() {
            // A unique index fired; the row lock makes this unreachable for
            // writers on the same account, so the winner lives elsewhere.
            db_tx.rollback().await?;
            let existing = match key {
                Some(key) => Self::find_by_key(&self.pool, key).await?,
                None => None,
            };
            return existing.map(AppendOutcome::Duplicate).ok_or_else(|| {
                BillingError::Database(format!(
                    "ledger insert for account {} conflicted without a duplicate",
                    request.account_id
                ))
            });
        }

        sqlx::query(
            "UPDATE accounts SET credit_balance = $2, updated_at = NOW() WHERE account_id = $1",
        )
        .bind(tx.account_id)
        .bind(tx.balance_after)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;

        Ok(AppendOutcome::Appended(tx))
    }

    async fn get_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<LedgerTransaction>> {
        let sql =
            format!("SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions WHERE transaction_id = $1");
        let row: Option<TransactionRow> = sqlx::query_as(&sql)
            .bind(transaction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(LedgerTransaction::try_from).transpose()
    }

    async fn find_refund_for(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Option<LedgerTransaction>> {
        Self::find_by_key(&self.pool, DedupKey::RefundOf(transaction_id)).await
    }

    async fn find_usage_for_job(&self, job_id: Uuid) -> BillingResult<Option<LedgerTransaction>> {
        Self::find_by_key(&self.pool, DedupKey::UsageFor(job_id)).await
    }

    async fn list_transactions(
        &self,
        account_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<LedgerTransaction>> {
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions
            WHERE account_id = $1
            ORDER BY seq DESC
            LIMIT $2 OFFSET $3
            "#
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        into_transactions(rows)
    }

    async fn count_transactions(&self, account_id: Uuid) -> BillingResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_transactions WHERE account_id = $1")
                .bind(account_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn account_transactions(
        &self,
        account_id: Uuid,
    ) -> BillingResult<Vec<LedgerTransaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM ledger_transactions WHERE account_id = $1 ORDER BY seq"
        );
        let rows: Vec<TransactionRow> = sqlx::query_as(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        into_transactions(rows)
    }
}
