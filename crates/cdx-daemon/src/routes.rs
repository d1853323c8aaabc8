//! Axum router and HTTP handlers for cdx-daemon.
//!
//! `build_router` is the single entry point; `main.rs` attaches middleware
//! after this call so tests can exercise the bare router.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use cdx_pipeline::{run_cycle, CycleInput};

use crate::{
    api_types::{CycleErrorResponse, HealthResponse},
    state::AppState,
};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/cycle", post(cycle))
        .with_state(state)
}

pub(crate) async fn healthz(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse { ok: true, service: st.build.service, version: st.build.version }),
    )
}

/// Run one bounded poll cycle and hand the `{index, continue, count,
/// wait_time}` triple back to the orchestrator. A cycle failure surfaces
/// as `500` with the error text; the orchestrator is expected to retry the
/// same input on its own schedule rather than the daemon retrying itself.
pub(crate) async fn cycle(State(st): State<Arc<AppState>>, Json(input): Json<CycleInput>) -> Response {
    match run_cycle(&st.ctx, input).await {
        Ok(output) => (StatusCode::OK, Json(output)).into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "cycle failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(CycleErrorResponse { error: e.to_string() })).into_response()
        }
    }
}
