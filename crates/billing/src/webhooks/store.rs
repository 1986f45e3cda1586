//! Processed webhook event records
//!
//! A row is claimed before an event is applied, so concurrent deliveries of
//! the same event id cannot both mutate state. Failed events and claims stuck
//! in `processing` past [`PROCESSING_TIMEOUT_MINUTES`] can be claimed again.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use clipmeter_shared::ParseEnumError;
use serde::Serialize;
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

pub const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processing,
    Applied,
    Stale,
    Ignored,
    Failed,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processing => "processing",
            WebhookOutcome::Applied => "applied",
            WebhookOutcome::Stale => "stale",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for WebhookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WebhookOutcome {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(WebhookOutcome::Processing),
            "applied" => Ok(WebhookOutcome::Applied),
            "stale" => Ok(WebhookOutcome::Stale),
            "ignored" => Ok(WebhookOutcome::Ignored),
            "failed" => Ok(WebhookOutcome::Failed),
            other => Err(ParseEnumError::new("webhook outcome", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub external_event_id: String,
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_created_at: OffsetDateTime,
    pub account_id: Option<Uuid>,
    pub outcome: WebhookOutcome,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub processing_started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimResult {
    /// The caller now owns processing of this event
    Claimed,
    /// Another delivery settled or is processing it
    AlreadyClaimed(WebhookOutcome),
}

#[async_trait]
pub trait WebhookEventStore: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        created_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult>;

    /// Settle a claimed event
    async fn finish(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        account_id: Option<Uuid>,
    ) -> BillingResult<()>;

    /// Mark a claimed event failed so a redelivery can claim it again
    async fn release(&self, event_id: &str, error: &str) -> BillingResult<()>;

    /// Most recent events first, optionally filtered by outcome
    async fn recent(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryWebhookEventStore {
    events: RwLock<HashMap<String, WebhookEventRecord>>,
}

impl InMemoryWebhookEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn reclaimable(record: &WebhookEventRecord, now: OffsetDateTime) -> bool {
    match record.outcome {
        WebhookOutcome::Failed => true,
        WebhookOutcome::Processing => {
            record.processing_started_at
                < now - Duration::minutes(PROCESSING_TIMEOUT_MINUTES as i64)
        }
        _ => false,
    }
}

#[async_trait]
impl WebhookEventStore for InMemoryWebhookEventStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        created_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult> {
        let now = OffsetDateTime::now_utc();
        let mut events = self.events.write().await;

        if let Some(existing) = events.get_mut(event_id) {
            if !reclaimable(existing, now) {
                return Ok(ClaimResult::AlreadyClaimed(existing.outcome));
            }
            existing.outcome = WebhookOutcome::Processing;
            existing.processing_started_at = now;
            existing.processed_at = None;
            existing.error_message = None;
            return Ok(ClaimResult::Claimed);
        }

        events.insert(
            event_id.to_string(),
            WebhookEventRecord {
                external_event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                event_created_at: created_at,
                account_id: None,
                outcome: WebhookOutcome::Processing,
                error_message: None,
                processing_started_at: now,
                processed_at: None,
            },
        );
        Ok(ClaimResult::Claimed)
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        account_id: Option<Uuid>,
    ) -> BillingResult<()> {
        let mut events = self.events.write().await;
        let record = events.get_mut(event_id).ok_or_else(|| {
            BillingError::WebhookPayload(format!("event {event_id} was never claimed"))
        })?;
        record.outcome = outcome;
        record.account_id = account_id;
        record.processed_at = Some(OffsetDateTime::now_utc());
        Ok(())
    }

    async fn release(&self, event_id: &str, error: &str) -> BillingResult<()> {
        let mut events = self.events.write().await;
        if let Some(record) = events.get_mut(event_id) {
            record.outcome = WebhookOutcome::Failed;
            record.error_message = Some(error.to_string());
            record.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn recent(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let events = self.events.read().await;
        let mut records: Vec<_> = events
            .values()
            .filter(|r| outcome.map_or(true, |o| r.outcome == o))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.processing_started_at.cmp(&a.processing_started_at));
        records.truncate(limit.max(0) as usize);
        Ok(records)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookEventRow {
    external_event_id: String,
    event_type: String,
    event_created_at: OffsetDateTime,
    account_id: Option<Uuid>,
    outcome: String,
    error_message: Option<String>,
    processing_started_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

impl TryFrom<WebhookEventRow> for WebhookEventRecord {
    type Error = BillingError;

    fn try_from(row: WebhookEventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEventRecord {
            external_event_id: row.external_event_id,
            event_type: row.event_type,
            event_created_at: row.event_created_at,
            account_id: row.account_id,
            outcome: row.outcome.parse()?,
            error_message: row.error_message,
            processing_started_at: row.processing_started_at,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgWebhookEventStore {
    pool: PgPool,
}

impl PgWebhookEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookEventStore for PgWebhookEventStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        created_at: OffsetDateTime,
    ) -> BillingResult<ClaimResult> {
        // Only one concurrent delivery gets a row back
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO processed_webhook_events
                (external_event_id, event_type, event_created_at, outcome, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (external_event_id) DO UPDATE SET
                outcome = 'processing',
                processing_started_at = NOW(),
                processed_at = NULL,
                error_message = NULL
            WHERE processed_webhook_events.outcome = 'failed'
               OR (processed_webhook_events.outcome = 'processing'
                   AND processed_webhook_events.processing_started_at
                       < NOW() - make_interval(mins => $4))
            RETURNING external_event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(created_at)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(ClaimResult::Claimed);
        }

        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT outcome FROM processed_webhook_events WHERE external_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let outcome = match existing {
            Some((outcome,)) => outcome.parse()?,
            None => WebhookOutcome::Processing,
        };
        Ok(ClaimResult::AlreadyClaimed(outcome))
    }

    async fn finish(
        &self,
        event_id: &str,
        outcome: WebhookOutcome,
        account_id: Option<Uuid>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET outcome = $2, account_id = $3, processed_at = NOW()
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn release(&self, event_id: &str, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET outcome = 'failed', error_message = $2, processed_at = NOW()
            WHERE external_event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(
        &self,
        outcome: Option<WebhookOutcome>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<WebhookEventRow> = sqlx::query_as(
            r#"
            SELECT external_event_id, event_type, event_created_at, account_id, outcome,
                   error_message, processing_started_at, processed_at
            FROM processed_webhook_events
            WHERE $1::TEXT IS NULL OR outcome = $1
            ORDER BY processing_started_at DESC
            LIMIT $2
            "#,
        )
        .bind(outcome.map(|o| o.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookEventRecord::try_from).collect()
    }
}
