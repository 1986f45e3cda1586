//! Hand-off of reserved jobs to the external executor

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Queue the clipping workers pop from (`BRPOP`)
pub const DEFAULT_QUEUE_KEY: &str = "podcast_clipper_jobs";

/// Message handed to the executor once credits are reserved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub job_id: Uuid,
    pub account_id: Uuid,
    pub estimated_cost: i64,
    /// Executor-specific job fields, passed through untouched
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Top-level keys of [`ExecutionRequest`] that a flattened payload may not carry
pub const RESERVED_PAYLOAD_KEYS: [&str; 3] = ["job_id", "account_id", "estimated_cost"];

impl ExecutionRequest {
    /// Reject payloads whose keys would shadow the request's own fields
    pub fn check_payload(payload: &serde_json::Map<String, serde_json::Value>) -> BillingResult<()> {
        match RESERVED_PAYLOAD_KEYS.iter().find(|key| payload.contains_key(**key)) {
            Some(key) => Err(BillingError::InvalidInput(format!(
                "payload may not contain reserved field `{key}`"
            ))),
            None => Ok(()),
        }
    }
}

/// Something that accepts reserved jobs for execution
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn enqueue(&self, request: &ExecutionRequest) -> BillingResult<()>;
}

/// Redis list queue shared with the clipping workers
#[derive(Clone)]
pub struct RedisJobQueue {
    conn: ConnectionManager,
    key: String,
}

impl RedisJobQueue {
    pub async fn connect(redis_url: &str, key: impl Into<String>) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        let key = key.into();
        tracing::info!(queue = %key, "Connected to job queue");
        Ok(Self { conn, key })
    }
}

#[async_trait]
impl JobExecutor for RedisJobQueue {
    async fn enqueue(&self, request: &ExecutionRequest) -> BillingResult<()> {
        let body = serde_json::to_string(request)
            .map_err(|e| BillingError::Queue(format!("failed to encode job: {e}")))?;

        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.key, body).await?;

        tracing::info!(
            job_id = %request.job_id,
            queue = %self.key,
            "Enqueued job for execution"
        );
        Ok(())
    }
}

/// In-process queue for tests and local runs without Redis
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    queued: Mutex<VecDeque<ExecutionRequest>>,
    reject: AtomicBool,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent enqueues fail, simulating an unreachable queue
    pub fn set_rejecting(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.queued.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queued.lock().await.is_empty()
    }

    /// Pop the oldest request, the way a worker would
    pub async fn pop(&self) -> Option<ExecutionRequest> {
        self.queued.lock().await.pop_front()
    }
}

#[async_trait]
impl JobExecutor for InMemoryJobQueue {
    async fn enqueue(&self, request: &ExecutionRequest) -> BillingResult<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(BillingError::Queue("queue is not accepting jobs".to_string()));
        }
        self.queued.lock().await.push_back(request.clone());
        Ok(())
    }
}
