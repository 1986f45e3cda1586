//! Server configuration from environment variables

use std::env;
use std::time::Duration;

use clipmeter_billing::{job_timeout_from_minutes, DEFAULT_JOB_TIMEOUT, DEFAULT_QUEUE_KEY};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Postgres connection; in-memory stores are used when unset
    pub database_url: Option<String>,
    /// Redis for the job queue; jobs stay in-process when unset
    pub redis_url: Option<String>,
    pub job_queue_key: String,
    /// Age after which the recovery sweep refunds an unfinished job
    pub job_timeout: Duration,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_job_timeout(value: Option<String>) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(DEFAULT_JOB_TIMEOUT);
    };
    value
        .trim()
        .parse::<u64>()
        .ok()
        .and_then(|minutes| job_timeout_from_minutes(minutes).ok())
        .ok_or(ConfigError::Invalid {
            name: "JOB_TIMEOUT_MINUTES",
            value,
        })
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let job_timeout = parse_job_timeout(optional("JOB_TIMEOUT_MINUTES"))?;

        let allowed_origins = optional("ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: optional("DATABASE_URL"),
            redis_url: optional("REDIS_URL"),
            job_queue_key: optional("JOB_QUEUE_KEY").unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string()),
            job_timeout,
            allowed_origins,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            database_url: None,
            redis_url: None,
            job_queue_key: DEFAULT_QUEUE_KEY.to_string(),
            job_timeout: DEFAULT_JOB_TIMEOUT,
            allowed_origins: Vec::new(),
        }
    }
}
