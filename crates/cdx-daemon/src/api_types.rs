//! Request and response types for the cdx-daemon HTTP endpoints.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
}

/// Returned when a cycle fails; the orchestrator is expected to retry the
/// same `{index, count, wait_time}` input on its own schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleErrorResponse {
    pub error: String,
}
