//! Credit-gated job routes used by feature controllers and executors

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use clipmeter_billing::{JobAdmission, JobOutcome, JobRecord, JobRequest};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub admission: JobAdmission,
}

#[derive(Debug, Deserialize)]
pub struct CompleteJobRequest {
    pub outcome: JobOutcome,
}

/// Reserve credits and hand the job to the executor. A denial maps to
/// 402 with the required and available amounts.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<JobRequest>,
) -> ApiResult<(StatusCode, Json<SubmitJobResponse>)> {
    let admission = state.billing.jobs.submit(req).await?;

    Ok((
        StatusCode::CREATED,
        Json(SubmitJobResponse {
            status: "allowed",
            admission,
        }),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.billing.jobs.get(job_id).await?))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(req): Json<CompleteJobRequest>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.billing.jobs.complete(job_id, req.outcome).await?))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.billing.jobs.cancel(job_id).await?))
}
