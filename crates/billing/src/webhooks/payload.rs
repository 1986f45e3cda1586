//! Provider event payloads
//!
//! Only the fields the processor reads are modelled. Stripe has moved period
//! and subscription fields between API versions, so both the older top-level
//! locations and the newer nested ones are accepted.

use std::collections::HashMap;

use clipmeter_shared::SubscriptionStatus;
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl ProviderEvent {
    pub fn created_at(&self) -> BillingResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.created)
            .map_err(|e| BillingError::WebhookPayload(format!("bad created timestamp: {e}")))
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }

    pub(crate) fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::WebhookPayload(format!("{} object: {e}", self.event_type))
        })
    }
}

/// Event types the processor acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    PaymentFailed,
    Other,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "invoice.paid" | "invoice.payment_succeeded" => Self::PaymentSucceeded,
            "invoice.payment_failed" => Self::PaymentFailed,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub items: Option<ItemList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ItemList {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Price {
    pub id: String,
}

impl SubscriptionObject {
    pub fn account_id(&self) -> Option<Uuid> {
        metadata_account_id(&self.metadata)
    }

    pub fn status(&self) -> SubscriptionStatus {
        SubscriptionStatus::from_provider(&self.status)
    }

    fn first_item(&self) -> Option<&SubscriptionItem> {
        self.items.as_ref().and_then(|items| items.data.first())
    }

    pub fn price_id(&self) -> Option<&str> {
        self.first_item()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.current_period_start
            .or_else(|| self.first_item().and_then(|i| i.current_period_start))
            .and_then(unix_to_datetime)
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| self.first_item().and_then(|i| i.current_period_end))
            .and_then(unix_to_datetime)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub billing_reason: Option<String>,
    #[serde(default)]
    pub parent: Option<InvoiceParent>,
    #[serde(default)]
    pub lines: Option<InvoiceLines>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceParent {
    #[serde(default)]
    pub subscription_details: Option<SubscriptionDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionDetails {
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    pub start: i64,
    pub end: i64,
}

impl InvoiceObject {
    fn details(&self) -> Option<&SubscriptionDetails> {
        self.parent
            .as_ref()
            .and_then(|p| p.subscription_details.as_ref())
    }

    pub fn subscription_ref(&self) -> Option<&str> {
        self.subscription
            .as_deref()
            .or_else(|| self.details().and_then(|d| d.subscription.as_deref()))
    }

    pub fn account_id(&self) -> Option<Uuid> {
        self.details().and_then(|d| metadata_account_id(&d.metadata))
    }

    /// Initial invoice of a new subscription; credits were granted on creation
    pub fn is_subscription_create(&self) -> bool {
        self.billing_reason.as_deref() == Some("subscription_create")
    }

    fn period(&self) -> Option<&Period> {
        self.lines
            .as_ref()
            .and_then(|lines| lines.data.first())
            .and_then(|line| line.period.as_ref())
    }

    pub fn period_start(&self) -> Option<OffsetDateTime> {
        self.period().and_then(|p| unix_to_datetime(p.start))
    }

    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.period().and_then(|p| unix_to_datetime(p.end))
    }
}

fn metadata_account_id(metadata: &HashMap<String, String>) -> Option<Uuid> {
    metadata
        .get("account_id")
        .and_then(|id| Uuid::parse_str(id).ok())
}

fn unix_to_datetime(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}
