//! Job reservation storage

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{JobRecord, JobState};
use crate::error::{BillingError, BillingResult};

/// Durable job records. `transition` is a compare-and-set on the state so
/// racing completion signals and the recovery sweep settle a job exactly once.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateJob` if the id exists.
    async fn insert(&self, job: &JobRecord) -> BillingResult<()>;

    async fn get(&self, job_id: Uuid) -> BillingResult<Option<JobRecord>>;

    /// Drop a record that never reserved credits (a denied submission)
    async fn remove(&self, job_id: Uuid) -> BillingResult<()>;

    /// Move the job to `to` if it is currently in one of `from`.
    ///
    /// Returns the updated record, or `None` when the state did not match.
    async fn transition(
        &self,
        job_id: Uuid,
        from: &[JobState],
        to: JobState,
    ) -> BillingResult<Option<JobRecord>>;

    async fn set_transaction(&self, job_id: Uuid, transaction_id: Uuid) -> BillingResult<()>;

    async fn set_refund_transaction(
        &self,
        job_id: Uuid,
        refund_transaction_id: Uuid,
    ) -> BillingResult<()>;

    /// Non-terminal jobs not touched since `before`
    async fn list_stale(&self, before: OffsetDateTime) -> BillingResult<Vec<JobRecord>>;

    /// Refunded jobs whose refund was never recorded. Includes jobs whose
    /// deduction id was never written back to the record.
    async fn list_unrecorded_refunds(&self) -> BillingResult<Vec<JobRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> BillingResult<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.job_id) {
            return Err(BillingError::DuplicateJob(job.job_id));
        }
        jobs.insert(job.job_id, job.clone());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> BillingResult<Option<JobRecord>> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }

    async fn remove(&self, job_id: Uuid) -> BillingResult<()> {
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: &[JobState],
        to: JobState,
    ) -> BillingResult<Option<JobRecord>> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(BillingError::JobNotFound(job_id))?;
        if !from.contains(&job.state) {
            return Ok(None);
        }
        job.state = to;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(Some(job.clone()))
    }

    async fn set_transaction(&self, job_id: Uuid, transaction_id: Uuid) -> BillingResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(BillingError::JobNotFound(job_id))?;
        job.transaction_id = Some(transaction_id);
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn set_refund_transaction(
        &self,
        job_id: Uuid,
        refund_transaction_id: Uuid,
    ) -> BillingResult<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(&job_id)
            .ok_or(BillingError::JobNotFound(job_id))?;
        job.refund_transaction_id = Some(refund_transaction_id);
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_stale(&self, before: OffsetDateTime) -> BillingResult<Vec<JobRecord>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| !job.state.is_terminal() && job.updated_at < before)
            .cloned()
            .collect())
    }

    async fn list_unrecorded_refunds(&self) -> BillingResult<Vec<JobRecord>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| {
                job.state.is_refunded() && job.refund_transaction_id.is_none()
            })
            .cloned()
            .collect())
    }
}

const JOB_COLUMNS: &str = r#"
    job_id, account_id, estimated_cost, duration_seconds, state,
    transaction_id, refund_transaction_id, created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    account_id: Uuid,
    estimated_cost: i64,
    duration_seconds: f64,
    state: String,
    transaction_id: Option<Uuid>,
    refund_transaction_id: Option<Uuid>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = BillingError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(JobRecord {
            job_id: row.job_id,
            account_id: row.account_id,
            estimated_cost: row.estimated_cost,
            duration_seconds: row.duration_seconds,
            state: row.state.parse()?,
            transaction_id: row.transaction_id,
            refund_transaction_id: row.refund_transaction_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_where(&self, filter: &str) -> BillingResult<Vec<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_reservations WHERE {filter}");
        let rows: Vec<JobRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &JobRecord) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_reservations
                (job_id, account_id, estimated_cost, duration_seconds, state,
                 transaction_id, refund_transaction_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(job.account_id)
        .bind(job.estimated_cost)
        .bind(job.duration_seconds)
        .bind(job.state.as_str())
        .bind(job.transaction_id)
        .bind(job.refund_transaction_id)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::DuplicateJob(job.job_id));
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> BillingResult<Option<JobRecord>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_reservations WHERE job_id = $1");
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(JobRecord::try_from).transpose()
    }

    async fn remove(&self, job_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM job_reservations WHERE job_id = $1 AND transaction_id IS NULL")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn transition(
        &self,
        job_id: Uuid,
        from: &[JobState],
        to: JobState,
    ) -> BillingResult<Option<JobRecord>> {
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"
            UPDATE job_reservations SET state = $2, updated_at = NOW()
            WHERE job_id = $1 AND state = ANY($3)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let row: Option<JobRow> = sqlx::query_as(&sql)
            .bind(job_id)
            .bind(to.as_str())
            .bind(&from)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(JobRecord::try_from(row)?)),
            None if self.get(job_id).await?.is_none() => Err(BillingError::JobNotFound(job_id)),
            None => Ok(None),
        }
    }

    async fn set_transaction(&self, job_id: Uuid, transaction_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            "UPDATE job_reservations SET transaction_id = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_refund_transaction(
        &self,
        job_id: Uuid,
        refund_transaction_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            "UPDATE job_reservations SET refund_transaction_id = $2, updated_at = NOW() WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(refund_transaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_stale(&self, before: OffsetDateTime) -> BillingResult<Vec<JobRecord>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM job_reservations
            WHERE state IN ('pending', 'reserved', 'running') AND updated_at < $1
            ORDER BY updated_at
            LIMIT 500
            "#
        );
        let rows: Vec<JobRow> = sqlx::query_as(&sql)
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn list_unrecorded_refunds(&self) -> BillingResult<Vec<JobRecord>> {
        self.fetch_where(
            "state IN ('refunded', 'timed_out_refunded') \
             AND refund_transaction_id IS NULL \
             AND (transaction_id IS NOT NULL OR EXISTS ( \
                 SELECT 1 FROM ledger_transactions t \
                 WHERE t.related_job_id = job_reservations.job_id AND t.kind = 'usage')) \
             LIMIT 500",
        )
        .await
    }
}
