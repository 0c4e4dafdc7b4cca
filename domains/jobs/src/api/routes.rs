//! Route definitions for the Jobs domain API

use axum::{
    routing::{get, post, put},
    Router,
};

use super::handlers;
use super::middleware::JobsState;

/// Create all Jobs domain API routes
pub fn routes() -> Router<JobsState> {
    Router::new()
        .route("/v1/shootouts", post(handlers::submit_shootout))
        .route("/v1/shootouts/{id}", get(handlers::get_shootout))
        .route("/v1/jobs", get(handlers::list_jobs))
        .route(
            "/v1/jobs/{id}",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/v1/jobs/{id}/cancel", post(handlers::cancel_job))
        .route("/v1/jobs/{id}/events", get(handlers::job_events))
        .route(
            "/v1/credentials",
            put(handlers::store_credential).delete(handlers::revoke_credential),
        )
}
