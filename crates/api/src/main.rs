//! Clipmeter API Server
//!
//! Serves balances, job admission, subscription management and the
//! payment provider webhook.

use std::net::SocketAddr;

use axum::http::{header, HeaderValue, Method};
use clipmeter_api::{create_router, AppState, Config};
use tokio::time::{interval, Duration};
use tower_http::{
    compression::CompressionLayer,
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,clipmeter_api=debug,clipmeter_billing=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Clipmeter API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let addr: SocketAddr = config.bind_address.parse()?;
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
    let in_process = config.database_url.is_none();
    let job_timeout = config.job_timeout;

    let state = AppState::connect(config).await?;

    // Without a shared database the worker cannot see this process's jobs
    if in_process {
        tokio::spawn(recovery_sweep_task(state.clone(), job_timeout));
        tracing::info!("In-process recovery sweep started");
    }

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ])
        .expose_headers([header::CONTENT_TYPE]);

    let app = create_router(state)
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Refund jobs that never reported back
async fn recovery_sweep_task(state: AppState, timeout: Duration) {
    let sweeper = state.billing.sweeper(timeout);
    let mut interval = interval(Duration::from_secs(60));

    loop {
        interval.tick().await;
        let report = sweeper.run().await;
        if report.timed_out > 0 || report.refunds_retried > 0 || report.errors > 0 {
            tracing::info!(
                timed_out = report.timed_out,
                refunds_retried = report.refunds_retried,
                errors = report.errors,
                "Recovery sweep finished"
            );
        }
    }
}
