//! Job-credit integration
//!
//! Wraps a billable job's lifecycle around the credit ledger:
//!
//! ```text
//! Pending -> Reserved -> Running -> Completed
//!                               \-> Refunded
//!                               \-> TimedOutRefunded (recovery sweep)
//! ```
//!
//! Credits are deducted before the job is handed to the executor and given
//! back through the idempotent ledger refund on any failure path, so a job
//! that never reaches `Completed` never costs anything.

mod queue;
mod store;

pub use queue::{
    ExecutionRequest, InMemoryJobQueue, JobExecutor, RedisJobQueue, DEFAULT_QUEUE_KEY,
    RESERVED_PAYLOAD_KEYS,
};
pub use store::{InMemoryJobStore, JobStore, PgJobStore};

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clipmeter_shared::ParseEnumError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{CreditLedgerService, RefundOutcome};
use crate::error::{BillingError, BillingResult};

/// Default age after which an unfinished job is considered lost
pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Longest configurable job timeout, one week
pub const MAX_JOB_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

/// Job timeout from a configured number of minutes, within `1..=MAX_JOB_TIMEOUT_MINUTES`
pub fn job_timeout_from_minutes(minutes: u64) -> BillingResult<Duration> {
    if !(1..=MAX_JOB_TIMEOUT_MINUTES).contains(&minutes) {
        return Err(BillingError::InvalidInput(format!(
            "job timeout must be between 1 and {MAX_JOB_TIMEOUT_MINUTES} minutes, got {minutes}"
        )));
    }
    minutes
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| BillingError::InvalidInput(format!("job timeout of {minutes} minutes overflows")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Reserved,
    Running,
    Completed,
    Refunded,
    TimedOutRefunded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Reserved => "reserved",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Refunded => "refunded",
            JobState::TimedOutRefunded => "timed_out_refunded",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Refunded | JobState::TimedOutRefunded
        )
    }

    pub fn is_refunded(&self) -> bool {
        matches!(self, JobState::Refunded | JobState::TimedOutRefunded)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "reserved" => Ok(JobState::Reserved),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "refunded" => Ok(JobState::Refunded),
            "timed_out_refunded" => Ok(JobState::TimedOutRefunded),
            _ => Err(ParseEnumError::new("job state", s)),
        }
    }
}

const OPEN_STATES: [JobState; 3] = [JobState::Pending, JobState::Reserved, JobState::Running];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: Uuid,
    pub account_id: Uuid,
    pub estimated_cost: i64,
    pub duration_seconds: f64,
    pub state: JobState,
    /// The usage deduction holding the reservation
    pub transaction_id: Option<Uuid>,
    pub refund_transaction_id: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// A billable job submitted by a feature controller
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub job_id: Uuid,
    pub account_id: Uuid,
    /// Media duration to be processed. Falls back to
    /// `clip_end_time - clip_start_time` from the payload.
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl JobRequest {
    fn duration(&self) -> BillingResult<f64> {
        if let Some(duration) = self.duration_seconds {
            return Ok(duration);
        }
        let field = |name: &str| self.payload.get(name).and_then(|v| v.as_f64());
        match (field("clip_start_time"), field("clip_end_time")) {
            (Some(start), Some(end)) => Ok(end - start),
            _ => Err(BillingError::InvalidInput(
                "job needs duration_seconds or clip_start_time/clip_end_time".to_string(),
            )),
        }
    }
}

/// Result of an admitted submission
#[derive(Debug, Clone, Serialize)]
pub struct JobAdmission {
    pub job_id: Uuid,
    pub transaction_id: Uuid,
    pub estimated_cost: i64,
    pub state: JobState,
}

/// Terminal signal from the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Success,
    Failure,
}

/// Longest media a single job may process: 24 hours
pub const MAX_JOB_DURATION_SECS: f64 = 24.0 * 60.0 * 60.0;

/// Credits charged for processing `duration_seconds` of media: whole
/// minutes rounded up, never less than one.
pub fn estimate_cost(duration_seconds: f64) -> BillingResult<i64> {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return Err(BillingError::InvalidInput(format!(
            "job duration must be a positive number of seconds, got {duration_seconds}"
        )));
    }
    if duration_seconds > MAX_JOB_DURATION_SECS {
        return Err(BillingError::InvalidInput(format!(
            "job duration {duration_seconds}s exceeds the {MAX_JOB_DURATION_SECS}s limit"
        )));
    }
    let minutes = (duration_seconds / 60.0).ceil() as i64;
    Ok(minutes.max(1))
}

#[derive(Clone)]
pub struct JobCreditHelper {
    credits: CreditLedgerService,
    jobs: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
}

impl JobCreditHelper {
    pub fn new(
        credits: CreditLedgerService,
        jobs: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            credits,
            jobs,
            executor,
        }
    }

    pub async fn get(&self, job_id: Uuid) -> BillingResult<JobRecord> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(BillingError::JobNotFound(job_id))
    }

    /// Estimate, reserve and hand off a job.
    ///
    /// Denied submissions return `InsufficientCredits` and leave nothing
    /// behind. If the hand-off fails the reservation is refunded.
    pub async fn submit(&self, request: JobRequest) -> BillingResult<JobAdmission> {
        ExecutionRequest::check_payload(&request.payload)?;
        let duration = request.duration()?;
        let cost = estimate_cost(duration)?;
        let job_id = request.job_id;
        let account_id = request.account_id;

        if self.jobs.get(job_id).await?.is_some() {
            return Err(BillingError::DuplicateJob(job_id));
        }

        let account = self.credits.account(account_id).await?;
        if !self.credits.check_balance(account_id, cost).await? {
            tracing::info!(
                account_id = %account_id,
                job_id = %job_id,
                estimated_cost = cost,
                balance = account.credit_balance,
                "Job denied: insufficient credits"
            );
            return Err(BillingError::InsufficientCredits {
                required: cost,
                available: account.credit_balance,
            });
        }

        let now = OffsetDateTime::now_utc();
        self.jobs
            .insert(&JobRecord {
                job_id,
                account_id,
                estimated_cost: cost,
                duration_seconds: duration,
                state: JobState::Pending,
                transaction_id: None,
                refund_transaction_id: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        let transaction_id = match self
            .credits
            .reserve_and_deduct(account_id, cost, job_id)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                // Lost the race for the last credits, or the ledger failed
                self.jobs.remove(job_id).await?;
                return Err(e);
            }
        };

        self.jobs.set_transaction(job_id, transaction_id).await?;
        if self
            .jobs
            .transition(job_id, &[JobState::Pending], JobState::Reserved)
            .await?
            .is_none()
        {
            // The sweep settled the job while the deduction was in flight
            tracing::warn!(job_id = %job_id, "Job settled during reservation; refunding");
            self.refund_job(job_id, transaction_id).await?;
            let job = self.get(job_id).await?;
            return Err(BillingError::JobAlreadySettled {
                job_id,
                state: job.state.to_string(),
            });
        }

        let execution = ExecutionRequest {
            job_id,
            account_id,
            estimated_cost: cost,
            payload: request.payload,
        };

        if let Err(e) = self.executor.enqueue(&execution).await {
            tracing::error!(
                job_id = %job_id,
                error = %e,
                "Failed to hand job to executor; refunding reservation"
            );
            if self
                .jobs
                .transition(job_id, &[JobState::Reserved], JobState::Refunded)
                .await?
                .is_some()
            {
                self.refund_job(job_id, transaction_id).await?;
            }
            return Err(e);
        }

        let state = match self
            .jobs
            .transition(job_id, &[JobState::Reserved], JobState::Running)
            .await?
        {
            Some(job) => job.state,
            // A fast executor may already have reported back
            None => self.get(job_id).await?.state,
        };

        tracing::info!(
            account_id = %account_id,
            job_id = %job_id,
            transaction_id = %transaction_id,
            estimated_cost = cost,
            "Job admitted"
        );

        Ok(JobAdmission {
            job_id,
            transaction_id,
            estimated_cost: cost,
            state,
        })
    }

    /// Record the executor's terminal signal
    pub async fn complete(&self, job_id: Uuid, outcome: JobOutcome) -> BillingResult<JobRecord> {
        match outcome {
            JobOutcome::Success => self.settle(job_id).await,
            JobOutcome::Failure => self.fail(job_id, "executor reported failure").await,
        }
    }

    /// Caller-initiated cancellation before settlement
    pub async fn cancel(&self, job_id: Uuid) -> BillingResult<JobRecord> {
        self.fail(job_id, "cancelled by caller").await
    }

    async fn settle(&self, job_id: Uuid) -> BillingResult<JobRecord> {
        if let Some(job) = self
            .jobs
            .transition(
                job_id,
                &[JobState::Reserved, JobState::Running],
                JobState::Completed,
            )
            .await?
        {
            tracing::info!(
                job_id = %job_id,
                account_id = %job.account_id,
                cost = job.estimated_cost,
                "Job completed; reservation settled"
            );
            return Ok(job);
        }

        let job = self.get(job_id).await?;
        match job.state {
            JobState::Completed => Ok(job),
            state => {
                tracing::warn!(
                    job_id = %job_id,
                    state = %state,
                    "Late success signal ignored; job already settled"
                );
                Err(BillingError::JobAlreadySettled {
                    job_id,
                    state: state.to_string(),
                })
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: &str) -> BillingResult<JobRecord> {
        let job = match self
            .jobs
            .transition(job_id, &OPEN_STATES, JobState::Refunded)
            .await?
        {
            Some(job) => job,
            None => {
                let job = self.get(job_id).await?;
                if job.state == JobState::Completed {
                    return Err(BillingError::JobAlreadySettled {
                        job_id,
                        state: job.state.to_string(),
                    });
                }
                // Already refunded; make sure the refund itself landed
                job
            }
        };

        tracing::info!(job_id = %job_id, reason = %reason, "Refunding failed job");

        if job.refund_transaction_id.is_none() {
            if let Some(transaction_id) = self.reservation_of(&job).await? {
                self.refund_job(job_id, transaction_id).await?;
            }
        }

        self.get(job_id).await
    }

    /// The deduction backing a job, including one whose id was never
    /// written back to the job record
    async fn reservation_of(&self, job: &JobRecord) -> BillingResult<Option<Uuid>> {
        if let Some(id) = job.transaction_id {
            return Ok(Some(id));
        }
        Ok(self
            .credits
            .usage_for_job(job.job_id)
            .await?
            .map(|tx| tx.transaction_id))
    }

    async fn refund_job(&self, job_id: Uuid, transaction_id: Uuid) -> BillingResult<RefundOutcome> {
        let outcome = self.credits.refund(transaction_id).await?;
        self.jobs
            .set_refund_transaction(job_id, outcome.transaction_id())
            .await?;
        Ok(outcome)
    }
}

/// Totals from one recovery sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub timed_out: usize,
    pub refunds_retried: usize,
    pub errors: usize,
}

/// Periodic backstop for jobs whose terminal signal never arrived
#[derive(Clone)]
pub struct RecoverySweeper {
    helper: JobCreditHelper,
    timeout: Duration,
}

impl RecoverySweeper {
    pub fn new(helper: JobCreditHelper, timeout: Duration) -> Self {
        Self { helper, timeout }
    }

    pub async fn run(&self) -> SweepReport {
        self.run_at(OffsetDateTime::now_utc()).await
    }

    pub async fn run_at(&self, now: OffsetDateTime) -> SweepReport {
        let mut report = SweepReport::default();
        let cutoff = now - self.timeout;

        match self.helper.jobs.list_stale(cutoff).await {
            Ok(stale) => {
                for job in stale {
                    match self.time_out(&job).await {
                        Ok(true) => report.timed_out += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            tracing::error!(job_id = %job.job_id, error = %e, "Failed to time out job");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list stale jobs");
            }
        }

        match self.helper.jobs.list_unrecorded_refunds().await {
            Ok(pending) => {
                for job in pending {
                    match self.retry_refund(&job).await {
                        Ok(true) => report.refunds_retried += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            tracing::error!(job_id = %job.job_id, error = %e, "Refund retry failed");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                tracing::error!(error = %e, "Failed to list unrecorded refunds");
            }
        }

        if report.timed_out > 0 || report.refunds_retried > 0 || report.errors > 0 {
            tracing::warn!(
                timed_out = report.timed_out,
                refunds_retried = report.refunds_retried,
                errors = report.errors,
                "Recovery sweep reclaimed orphaned reservations"
            );
        }

        report
    }

    /// Re-issue the refund of a refunded job. Returns false when the job
    /// never reserved credits.
    async fn retry_refund(&self, job: &JobRecord) -> BillingResult<bool> {
        match self.helper.reservation_of(job).await? {
            Some(transaction_id) => {
                self.helper.refund_job(job.job_id, transaction_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn time_out(&self, job: &JobRecord) -> BillingResult<bool> {
        let Some(job) = self
            .helper
            .jobs
            .transition(job.job_id, &OPEN_STATES, JobState::TimedOutRefunded)
            .await?
        else {
            // Completed or failed since it was listed
            return Ok(false);
        };

        tracing::warn!(
            job_id = %job.job_id,
            account_id = %job.account_id,
            "Job exceeded timeout; refunding orphaned reservation"
        );

        if let Some(transaction_id) = self.helper.reservation_of(&job).await? {
            self.helper.refund_job(job.job_id, transaction_id).await?;
        }
        Ok(true)
    }
}
