//! Clipmeter Background Worker
//!
//! Handles scheduled jobs including:
//! - Recovery sweep refunding jobs that never reported back (every minute)
//! - Ledger invariant checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use clipmeter_billing::{
    job_timeout_from_minutes, BillingService, InMemoryJobQueue, InvariantCheckSummary,
    JobExecutor, RedisJobQueue, StripeClient, ViolationSeverity, DEFAULT_JOB_TIMEOUT,
    DEFAULT_QUEUE_KEY,
};
use clipmeter_shared::create_pool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

fn job_timeout() -> Duration {
    let Ok(value) = std::env::var("JOB_TIMEOUT_MINUTES") else {
        return DEFAULT_JOB_TIMEOUT;
    };
    let parsed = value
        .trim()
        .parse::<u64>()
        .map_err(|e| e.to_string())
        .and_then(|minutes| job_timeout_from_minutes(minutes).map_err(|e| e.to_string()));
    match parsed {
        Ok(timeout) => timeout,
        Err(e) => {
            warn!(value = %value, error = %e, "Invalid JOB_TIMEOUT_MINUTES, using default");
            DEFAULT_JOB_TIMEOUT
        }
    }
}

/// Log an invariant run, one line per violation at a level matching its severity
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    info!(
        accounts_checked = summary.accounts_checked,
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        healthy = summary.healthy,
        "Invariant check complete"
    );

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical | ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                account_id = %violation.account_id,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
            ViolationSeverity::Medium | ViolationSeverity::Low => warn!(
                invariant = %violation.invariant,
                account_id = %violation.account_id,
                severity = %violation.severity,
                context = %violation.context,
                "{}",
                violation.description
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Clipmeter Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set for the worker"))?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    // The sweep only refunds, but the job helper is built over an executor
    let executor: Arc<dyn JobExecutor> = match std::env::var("REDIS_URL") {
        Ok(url) => {
            let key = std::env::var("JOB_QUEUE_KEY").unwrap_or_else(|_| DEFAULT_QUEUE_KEY.to_string());
            Arc::new(RedisJobQueue::connect(&url, key).await?)
        }
        Err(_) => Arc::new(InMemoryJobQueue::new()),
    };

    let stripe = match StripeClient::from_env() {
        Ok(client) => Some(client),
        Err(e) => {
            warn!(error = %e, "Stripe not configured - provider calls disabled");
            None
        }
    };

    let billing = BillingService::postgres(pool, executor, stripe);
    let scheduler = JobScheduler::new().await?;

    // Job 1: Recovery sweep (every minute)
    let timeout = job_timeout();
    let sweeper = billing.sweeper(timeout);
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let sweeper = sweeper.clone();
            Box::pin(async move {
                let report = sweeper.run().await;
                if report.errors > 0 {
                    warn!(
                        timed_out = report.timed_out,
                        refunds_retried = report.refunds_retried,
                        errors = report.errors,
                        "Recovery sweep finished with errors"
                    );
                } else if report.timed_out > 0 || report.refunds_retried > 0 {
                    info!(
                        timed_out = report.timed_out,
                        refunds_retried = report.refunds_retried,
                        "Recovery sweep refunded stuck jobs"
                    );
                }
            })
        })?)
        .await?;
    info!(
        timeout_minutes = timeout.as_secs() / 60,
        "Scheduled: Recovery sweep (every minute)"
    );

    // Job 2: Ledger invariants (hourly)
    let checker = billing.invariants.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                info!("Running ledger invariant checks");
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Invariant check failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (hourly)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Clipmeter Worker started successfully with {} scheduled jobs", 3);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
