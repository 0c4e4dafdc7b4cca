//! HTTP front-door adapter tests
//!
//! The router is exercised in-process with `tower::ServiceExt::oneshot`
//! over the in-memory backends; no server or database is started.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use shootout_broker::MemoryBroker;
use shootout_common::{Clock, SystemClock};
use shootout_jobs::{CoreService, JobsState, MemoryStore, ProgressHub};

const CALLER_HEADER: &str = "x-shootout-user";

fn test_app() -> Router {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new(clock.clone()));
    let hub = Arc::new(ProgressHub::new(clock.clone()));
    let core = Arc::new(CoreService::new(store, broker, hub, clock));
    shootout_jobs::routes().with_state(JobsState { core })
}

fn request(method: Method, uri: &str, caller: Option<Uuid>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(caller) = caller {
        builder = builder.header(CALLER_HEADER, caller.to_string());
    }
    if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        builder
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap()
    } else {
        builder.body(Body::empty()).unwrap()
    }
}

async fn parse_body(response: axum::http::Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn submission() -> Value {
    json!({
        "title": "Plexi vs JCM800",
        "di_tracks": [{"path": "u/riff.wav", "guitar": "LP Standard"}],
        "signal_chains": [
            {
                "name": "plexi",
                "stages": [
                    {"kind": "model", "parameter": "neural/plexi-v2"},
                    {"kind": "ir", "parameter": "irs/412.wav"}
                ]
            }
        ]
    })
}

async fn submit(app: &Router, caller: Uuid) -> Uuid {
    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/v1/shootouts",
            Some(caller),
            Some(submission()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = parse_body(response).await;
    body["job_id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn test_missing_caller_header_is_unauthorized() {
    let app = test_app();
    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/shootouts",
            None,
            Some(submission()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_submit_and_get_job() {
    let app = test_app();
    let caller = Uuid::new_v4();
    let job_id = submit(&app, caller).await;

    let response = app
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = parse_body(response).await;
    assert_eq!(body["status"], "queued");
    assert_eq!(body["progress"], 0);
    assert_eq!(body["attempts"], 0);
    assert!(body["result_path"].is_null());
}

#[tokio::test]
async fn test_invalid_submission_returns_field_and_reason() {
    let app = test_app();
    let mut bad = submission();
    bad["signal_chains"] = json!([]);

    let response = app
        .oneshot(request(
            Method::POST,
            "/v1/shootouts",
            Some(Uuid::new_v4()),
            Some(bad),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = parse_body(response).await;
    assert_eq!(body["field"], "signal_chains");
    assert_eq!(body["reason"], "non_empty_required");
}

#[tokio::test]
async fn test_foreign_caller_is_forbidden() {
    let app = test_app();
    let owner = Uuid::new_v4();
    let job_id = submit(&app, owner).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", job_id),
            Some(Uuid::new_v4()),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = parse_body(response).await;
    assert_eq!(body["error"]["code"], "FORBIDDEN");

    // Unknown job ids stay a plain 404
    let response = app
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", Uuid::new_v4()),
            Some(owner),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_then_cancel_again_conflicts() {
    let app = test_app();
    let caller = Uuid::new_v4();
    let job_id = submit(&app, caller).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/v1/jobs/{}/cancel", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/v1/jobs/{}/cancel", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // The terminal record is stable
    let response = app
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    let body = parse_body(response).await;
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["error_kind"], "cancelled");
}

#[tokio::test]
async fn test_list_jobs_with_status_filter() {
    let app = test_app();
    let caller = Uuid::new_v4();
    let first = submit(&app, caller).await;
    let _second = submit(&app, caller).await;

    // Cancel the first job, then filter by status
    app.clone()
        .oneshot(request(
            Method::POST,
            &format!("/v1/jobs/{}/cancel", first),
            Some(caller),
            None,
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/v1/jobs?status=cancelled",
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["job_id"], first.to_string());

    let response = app
        .oneshot(request(Method::GET, "/v1/jobs", Some(caller), None))
        .await
        .unwrap();
    let body = parse_body(response).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_get_shootout_roundtrip() {
    let app = test_app();
    let caller = Uuid::new_v4();
    let job_id = submit(&app, caller).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    let job = parse_body(response).await;
    let shootout_id = job["shootout_id"].as_str().unwrap();

    let response = app
        .oneshot(request(
            Method::GET,
            &format!("/v1/shootouts/{}", shootout_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = parse_body(response).await;
    assert_eq!(body["title"], "Plexi vs JCM800");
    assert_eq!(body["signal_chains"][0]["stages"][0]["kind"], "model");
}

#[tokio::test]
async fn test_credential_lifecycle() {
    let app = test_app();
    let caller = Uuid::new_v4();

    let grant = json!({
        "access_token": "at",
        "refresh_token": "rt",
        "access_expires_at": "2026-01-01T00:00:00Z"
    });
    let response = app
        .clone()
        .oneshot(request(
            Method::PUT,
            "/v1/credentials",
            Some(caller),
            Some(grant),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(request(Method::DELETE, "/v1/credentials", Some(caller), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request(Method::DELETE, "/v1/credentials", Some(caller), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_requires_terminal_job() {
    let app = test_app();
    let caller = Uuid::new_v4();
    let job_id = submit(&app, caller).await;

    let response = app
        .clone()
        .oneshot(request(
            Method::DELETE,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    app.clone()
        .oneshot(request(
            Method::POST,
            &format!("/v1/jobs/{}/cancel", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(request(
            Method::DELETE,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request(
            Method::GET,
            &format!("/v1/jobs/{}", job_id),
            Some(caller),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
