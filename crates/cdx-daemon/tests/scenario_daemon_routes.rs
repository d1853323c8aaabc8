//! In-process scenario tests for cdx-daemon HTTP endpoints.
//!
//! Spins up the Axum router without binding a TCP socket and drives it via
//! `tower::ServiceExt::oneshot`. `AppState::from_env` needs a live Postgres
//! (for the cursor store migration) and the pipeline's required
//! configuration env vars, so this is gated the same way the rest of this
//! workspace gates its DB-backed scenario tests.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use cdx_daemon::{routes, state};
use http_body_util::BodyExt;
use tower::ServiceExt;

macro_rules! require_db {
    () => {
        if std::env::var(cdx_cursor::ENV_DB_URL).is_err() {
            eprintln!("skipping: {} not set", cdx_cursor::ENV_DB_URL);
            return;
        }
    };
}

fn set_required_config_env() {
    std::env::set_var("AWS_REGION", "us-east-1");
    std::env::set_var("Application", "scenario-daemon-routes");
    std::env::set_var("LeaseTable", "lease");
    std::env::set_var("NeptuneStreamEndpoint", "https://db.example.com:8182/gremlin/stream");
    std::env::set_var("StreamRecordsHandler", "gremlin");
    std::env::set_var("StreamRecordsBatchSize", "100");
}

async fn make_router() -> axum::Router {
    set_required_config_env();
    let st = Arc::new(state::AppState::from_env().await.expect("AppState::from_env failed"));
    routes::build_router(st)
}

async fn call(router: axum::Router, req: Request<axum::body::Body>) -> (StatusCode, bytes::Bytes) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp.into_body().collect().await.expect("body collect failed").to_bytes();
    (status, body)
}

fn parse_json(b: bytes::Bytes) -> serde_json::Value {
    serde_json::from_slice(&b).expect("body is not valid JSON")
}

#[tokio::test]
async fn healthz_returns_200_ok_true() {
    require_db!();
    let router = make_router().await;
    let req = Request::builder().method("GET").uri("/healthz").body(axum::body::Body::empty()).unwrap();

    let (status, body) = call(router, req).await;
    assert_eq!(status, StatusCode::OK);

    let json = parse_json(body);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "cdx-daemon");
}
