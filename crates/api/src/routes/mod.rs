//! HTTP routes

mod billing;
mod jobs;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/plans", get(billing::list_plans))
        .route("/accounts", post(billing::create_account))
        .route("/accounts/{id}/balance", get(billing::get_balance))
        .route("/accounts/{id}/transactions", get(billing::list_transactions))
        .route("/accounts/{id}/usage", get(billing::get_usage))
        .route("/accounts/{id}/deactivate", post(billing::deactivate_account))
        .route("/accounts/{id}/subscription", get(billing::get_subscription))
        .route(
            "/accounts/{id}/subscription/checkout",
            post(billing::create_checkout),
        )
        .route(
            "/accounts/{id}/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route(
            "/accounts/{id}/subscription/resume",
            post(billing::resume_subscription),
        )
        .route(
            "/accounts/{id}/subscription/change-tier",
            post(billing::change_tier),
        )
        .route("/webhooks/events", get(billing::list_webhook_events))
        .route("/jobs", post(jobs::submit_job))
        .route("/jobs/{job_id}", get(jobs::get_job))
        .route("/jobs/{job_id}/complete", post(jobs::complete_job))
        .route("/jobs/{job_id}/cancel", post(jobs::cancel_job));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/stripe", post(billing::stripe_webhook))
        .nest("/api/v1", api)
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "provider_configured": state.billing.subscriptions.has_provider(),
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use clipmeter_billing::{
        compute_signature, BillingService, FakePaymentProvider, InMemoryJobQueue,
        InMemoryJobStore, InMemoryLedgerStore, InMemoryWebhookEventStore, PriceIds,
    };
    use serde_json::{json, Value};
    use time::OffsetDateTime;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::config::Config;

    const SECRET: &str = "whsec_routes";

    fn app() -> (Router, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let billing = BillingService::with_provider(
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryWebhookEventStore::new()),
            queue.clone(),
            Some(Arc::new(FakePaymentProvider::new())),
            SECRET.to_string(),
            PriceIds::default(),
        );
        let router = create_router(AppState::new(Config::default(), billing));
        (router, queue)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn open_account(app: &Router) -> Uuid {
        let (status, body) = send(app, "POST", "/api/v1/accounts", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        body["account_id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_new_account_has_free_credits() {
        let (app, _) = app();
        let account_id = open_account(&app).await;

        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/v1/accounts/{account_id}/balance"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["credit_balance"], 10);
        assert_eq!(body["tier"], "free");
    }

    #[tokio::test]
    async fn test_unknown_account_is_404() {
        let (app, _) = app();
        let (status, body) = send(
            &app,
            "GET",
            &format!("/api/v1/accounts/{}/balance", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_job_submit_fail_and_history() {
        let (app, queue) = app();
        let account_id = open_account(&app).await;
        let job_id = Uuid::new_v4();

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(json!({
                "job_id": job_id,
                "account_id": account_id,
                "duration_seconds": 420.0,
                "payload": { "project_id": "p-1" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["status"], "allowed");
        assert_eq!(body["estimated_cost"], 7);
        assert_eq!(queue.len().await, 1);

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/jobs/{job_id}/complete"),
            Some(json!({ "outcome": "failure" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "refunded");

        let (_, body) = send(
            &app,
            "GET",
            &format!("/api/v1/accounts/{account_id}/transactions?limit=10"),
            None,
        )
        .await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["transactions"][0]["kind"], "refund");
    }

    #[tokio::test]
    async fn test_job_payload_with_reserved_field_is_400() {
        let (app, queue) = app();
        let account_id = open_account(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(json!({
                "job_id": Uuid::new_v4(),
                "account_id": account_id,
                "duration_seconds": 60.0,
                "payload": { "job_id": Uuid::new_v4(), "project_id": "p-1" }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["message"].as_str().unwrap().contains("job_id"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_job_denied_is_402() {
        let (app, queue) = app();
        let account_id = open_account(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            "/api/v1/jobs",
            Some(json!({
                "job_id": Uuid::new_v4(),
                "account_id": account_id,
                "duration_seconds": 3600.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["status"], "denied");
        assert_eq!(body["required"], 60);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_webhook_signature_required() {
        let (app, _) = app();
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/stripe")
            .header("stripe-signature", "t=1,v1=deadbeef")
            .body(Body::from("{}"))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_signed_webhook_activates_subscription() {
        let (app, _) = app();
        let account_id = open_account(&app).await;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let payload = json!({
            "id": "evt_route_1",
            "type": "customer.subscription.created",
            "created": now,
            "data": { "object": {
                "id": "sub_r",
                "customer": "cus_r",
                "status": "active",
                "metadata": { "account_id": account_id.to_string(), "tier": "basic" }
            }}
        })
        .to_string();
        let signature = format!(
            "t={now},v1={}",
            compute_signature(&payload, SECRET, now).unwrap()
        );

        for _ in 0..2 {
            let request = Request::builder()
                .method("POST")
                .uri("/webhooks/stripe")
                .header("stripe-signature", &signature)
                .body(Body::from(payload.clone()))
                .unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let (_, body) = send(
            &app,
            "GET",
            &format!("/api/v1/accounts/{account_id}/subscription"),
            None,
        )
        .await;
        assert_eq!(body["tier"], "basic");
        assert_eq!(body["status"], "active");
        assert_eq!(body["credit_balance"], 100);
    }

    #[tokio::test]
    async fn test_checkout_returns_redirect() {
        let (app, _) = app();
        let account_id = open_account(&app).await;

        let (status, body) = send(
            &app,
            "POST",
            &format!("/api/v1/accounts/{account_id}/subscription/checkout"),
            Some(json!({ "tier": "premium", "interval": "annual" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["url"].as_str().unwrap().starts_with("https://"));
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_404() {
        let (app, _) = app();
        let account_id = open_account(&app).await;

        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/v1/accounts/{account_id}/subscription/cancel"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
