//! Application state

use std::sync::Arc;

use clipmeter_billing::{BillingService, InMemoryJobQueue, JobExecutor, RedisJobQueue, StripeClient};
use clipmeter_shared::{create_pool, run_migrations};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: BillingService,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        Self { config, billing }
    }

    /// Connect configured backends, falling back to in-process ones
    pub async fn connect(config: Config) -> anyhow::Result<Self> {
        let stripe = match StripeClient::from_env() {
            Ok(client) => {
                tracing::info!("Stripe payment provider initialized");
                Some(client)
            }
            Err(e) => {
                tracing::warn!("Stripe not configured: {}", e);
                None
            }
        };

        let executor: Arc<dyn JobExecutor> = match &config.redis_url {
            Some(url) => Arc::new(RedisJobQueue::connect(url, config.job_queue_key.clone()).await?),
            None => {
                tracing::warn!("REDIS_URL not set - jobs are queued in process only");
                Arc::new(InMemoryJobQueue::new())
            }
        };

        let billing = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to database...");
                let pool = create_pool(url).await?;
                run_migrations(&pool).await?;
                tracing::info!("Database ready");
                BillingService::postgres(pool, executor, stripe)
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using in-memory stores");
                BillingService::in_memory(executor, stripe)
            }
        };

        Ok(Self::new(config, billing))
    }
}
