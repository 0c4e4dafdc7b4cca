//! Job management API handlers
//!
//! Thin adapters over `CoreService`: extract the caller, delegate, map the
//! result into DTOs. No business rules live here.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use shootout_common::Result;

use crate::api::middleware::{CallerId, JobsState};
use crate::domain::entities::{
    DiTrack, ErrorKind, Job, JobStatus, Shootout, ShootoutDraft, SignalChain,
};
use crate::hub::ProgressEvent;
use crate::repository::{JobFilter, Page};
use crate::service::{CredentialGrant, JobSnapshot};

/// Job response DTO (canonical persisted fields)
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    pub shootout_id: Uuid,
    pub owner_id: Uuid,
    pub status: JobStatus,
    pub progress: i16,
    pub message: Option<String>,
    pub attempts: i16,
    pub result_path: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            shootout_id: job.shootout_id,
            owner_id: job.owner_id,
            status: job.status,
            progress: job.progress,
            message: job.message,
            attempts: job.attempts,
            result_path: job.result_path,
            error_kind: job.error_kind,
            error_detail: job.error_detail,
            created_at: job.created_at,
            started_at: job.started_at,
            completed_at: job.completed_at,
        }
    }
}

/// Shootout response DTO
#[derive(Debug, Serialize)]
pub struct ShootoutResponse {
    pub shootout_id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub di_tracks: Vec<DiTrack>,
    pub signal_chains: Vec<SignalChain>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Shootout> for ShootoutResponse {
    fn from(shootout: Shootout) -> Self {
        Self {
            shootout_id: shootout.id,
            owner_id: shootout.owner_id,
            title: shootout.title,
            description: shootout.description,
            di_tracks: shootout.di_tracks.0,
            signal_chains: shootout.signal_chains.0,
            created_at: shootout.created_at,
            updated_at: shootout.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Submit a shootout for rendering
pub async fn submit_shootout(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Json(draft): Json<ShootoutDraft>,
) -> Result<(StatusCode, Json<SubmitResponse>)> {
    let job_id = state.core.submit_shootout(owner_id, draft).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id })))
}

/// Get a stored shootout
pub async fn get_shootout(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ShootoutResponse>> {
    let shootout = state.core.get_shootout(owner_id, id).await?;
    Ok(Json(shootout.into()))
}

/// List jobs for the caller
pub async fn list_jobs(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<Vec<JobResponse>>> {
    let filter = JobFilter {
        status: params.status,
    };
    let page = Page {
        limit: params.limit.unwrap_or(20),
        offset: params.offset.unwrap_or(0),
    };
    let jobs = state.core.list_jobs(owner_id, filter, page).await?;
    Ok(Json(jobs.into_iter().map(Into::into).collect()))
}

/// Get a single job by ID
pub async fn get_job(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobResponse>> {
    let job = state.core.get_job(owner_id, id).await?;
    Ok(Json(job.into()))
}

/// Cancel a job
pub async fn cancel_job(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.core.cancel_job(owner_id, id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Delete a terminal job and its artifact
pub async fn delete_job(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode> {
    state.core.delete_job(owner_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Subscribe to job progress (SSE)
///
/// Frames: `snapshot` once on connect, then `progress` events, then exactly
/// one `terminal`. A consumer that stops draining gets a `lagged` frame and
/// the stream ends.
pub async fn job_events(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Path(id): Path<Uuid>,
) -> Result<
    Sse<impl futures_core::Stream<Item = std::result::Result<Event, std::convert::Infallible>>>,
> {
    let (job, subscription) = state.core.subscribe_job(owner_id, id).await?;

    let stream = async_stream::stream! {
        let snapshot = JobSnapshot::from(&job);
        yield Ok(Event::default()
            .event("snapshot")
            .data(serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())));

        let Some(mut subscription) = subscription else {
            // Already terminal: emit the terminal frame from the row and close
            yield Ok(terminal_frame(
                job.status,
                job.result_path.clone(),
                job.error_kind,
                job.error_detail.clone(),
            ));
            return;
        };

        while let Some(event) = subscription.next().await {
            match event {
                ProgressEvent::Progress { progress, message } => {
                    yield Ok(Event::default()
                        .event("progress")
                        .data(json!({ "progress": progress, "message": message }).to_string()));
                }
                ProgressEvent::Terminal {
                    status,
                    result_path,
                    error_kind,
                    error_detail,
                } => {
                    yield Ok(terminal_frame(status, result_path, error_kind, error_detail));
                    break;
                }
                ProgressEvent::Lagged => {
                    yield Ok(Event::default().event("lagged").data("{}"));
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn terminal_frame(
    status: JobStatus,
    result_path: Option<String>,
    error_kind: Option<ErrorKind>,
    error_detail: Option<String>,
) -> Event {
    Event::default().event("terminal").data(
        json!({
            "status": status,
            "result_path": result_path,
            "error_kind": error_kind,
            "error_detail": error_detail,
        })
        .to_string(),
    )
}

/// Store the caller's external-provider credential
pub async fn store_credential(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
    Json(grant): Json<CredentialGrant>,
) -> Result<StatusCode> {
    state.core.store_credential(owner_id, grant).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove the caller's credential
pub async fn revoke_credential(
    CallerId(owner_id): CallerId,
    State(state): State<JobsState>,
) -> Result<StatusCode> {
    state.core.revoke_credential(owner_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
