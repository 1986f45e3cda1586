//! Account, subscription and webhook routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use clipmeter_billing::{
    CheckoutRedirect, HistoryPage, Pagination, SubscriptionPlan, SubscriptionView,
    TierChangeResult, UsageStats, WebhookDisposition, WebhookEventRecord, WebhookOutcome,
};
use clipmeter_shared::{BillingInterval, SubscriptionStatus, SubscriptionTier};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    /// Use the identity provider's id when the account already exists upstream
    #[serde(default)]
    pub account_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    pub account_id: Uuid,
    pub credit_balance: i64,
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub unlimited: bool,
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct TierRequest {
    pub tier: SubscriptionTier,
    #[serde(default)]
    pub interval: BillingInterval,
}

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub disposition: WebhookDisposition,
}

#[derive(Debug, Deserialize)]
pub struct WebhookEventsQuery {
    pub outcome: Option<String>,
    pub limit: Option<i64>,
}

// =============================================================================
// Handlers
// =============================================================================

pub async fn list_plans(State(state): State<AppState>) -> Json<Vec<SubscriptionPlan>> {
    Json(state.billing.subscriptions.plans())
}

pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> ApiResult<(StatusCode, Json<BalanceResponse>)> {
    let account_id = request.account_id.unwrap_or_else(Uuid::new_v4);

    let account = state.billing.credits.open_account(account_id).await?;
    let plan = SubscriptionPlan::for_tier(account.subscription_tier);

    Ok((
        StatusCode::CREATED,
        Json(BalanceResponse {
            account_id: account.account_id,
            credit_balance: account.credit_balance,
            tier: account.subscription_tier,
            status: account.subscription_status,
            unlimited: plan.unlimited,
            active: account.active,
        }),
    ))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BalanceResponse>> {
    let account = state.billing.credits.account(id).await?;
    let plan = SubscriptionPlan::for_tier(account.subscription_tier);

    Ok(Json(BalanceResponse {
        account_id: account.account_id,
        credit_balance: account.credit_balance,
        tier: account.subscription_tier,
        status: account.subscription_status,
        unlimited: plan.unlimited,
        active: account.active,
    }))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(pagination): Query<Pagination>,
) -> ApiResult<Json<HistoryPage>> {
    Ok(Json(state.billing.credits.history(id, pagination).await?))
}

pub async fn get_usage(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<UsageStats>> {
    Ok(Json(state.billing.credits.stats(id).await?))
}

pub async fn deactivate_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.billing.credits.deactivate(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    Ok(Json(state.billing.subscriptions.subscription(id).await?))
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TierRequest>,
) -> ApiResult<Json<CheckoutRedirect>> {
    let redirect = state
        .billing
        .subscriptions
        .initiate_subscription(id, req.tier, req.interval)
        .await?;
    Ok(Json(redirect))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    Ok(Json(state.billing.subscriptions.cancel(id).await?))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SubscriptionView>> {
    Ok(Json(state.billing.subscriptions.resume(id).await?))
}

pub async fn change_tier(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TierRequest>,
) -> ApiResult<Json<TierChangeResult>> {
    let result = state
        .billing
        .subscriptions
        .change_tier(id, req.tier, req.interval)
        .await?;
    Ok(Json(result))
}

/// Provider webhook endpoint. Takes the raw body since the signature
/// covers the exact bytes sent.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Validation(format!("missing {SIGNATURE_HEADER} header")))?;

    let disposition = state.billing.webhooks.handle(&body, signature).await?;

    Ok(Json(WebhookResponse {
        received: true,
        disposition,
    }))
}

pub async fn list_webhook_events(
    State(state): State<AppState>,
    Query(query): Query<WebhookEventsQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    let outcome = query
        .outcome
        .as_deref()
        .map(str::parse::<WebhookOutcome>)
        .transpose()
        .map_err(|e| ApiError::Validation(e.to_string()))?;
    let limit = query.limit.unwrap_or(50).clamp(1, 500);

    Ok(Json(
        state.billing.webhooks.recent_events(outcome, limit).await?,
    ))
}
