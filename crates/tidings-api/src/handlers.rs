//! Request handlers for the operator endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tidings_engine::SweepSummary;
use tracing::{error, instrument};

use crate::AppState;

/// Standard response envelope for all endpoints.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Human-readable detail, set on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Operation payload, set on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self { success: true, message: None, data: Some(data) }
    }

    fn error(message: impl Into<String>) -> Self {
        Self { success: false, message: Some(message.into()), data: None }
    }
}

/// Health check payload.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the process serves requests.
    pub status: &'static str,
    /// When this health check ran.
    pub timestamp: DateTime<Utc>,
    /// Service version from the build.
    pub version: &'static str,
}

/// Wire shape of the manual trigger result.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualTriggerData {
    /// Pending records examined.
    pub total: usize,
    /// Records newly enqueued.
    pub queued: usize,
    /// Records whose job was already queued or active.
    pub skipped_already_queued: usize,
    /// Records left for a later tick.
    pub skipped_not_due: usize,
    /// Number of failures.
    pub failed: usize,
    /// Keys that errored during the sweep.
    pub failed_ids: Vec<String>,
}

impl From<SweepSummary> for ManualTriggerData {
    fn from(summary: SweepSummary) -> Self {
        Self {
            total: summary.total,
            queued: summary.queued,
            skipped_already_queued: summary.skipped_already_queued,
            skipped_not_due: summary.skipped_not_due,
            failed: summary.failed(),
            failed_ids: summary.failed_ids,
        }
    }
}

/// Liveness probe.
#[instrument(skip_all)]
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Operator endpoint forcing immediate dispatch of today's due records.
///
/// Runs the sweeper with `force = true`, bypassing the send-hour gate.
/// Used when a recipient registers on their birthday after the send
/// hour has passed.
#[instrument(skip_all)]
pub async fn manual_send_birthday_message(State(state): State<AppState>) -> impl IntoResponse {
    match state.sweeper.sweep(true).await {
        Ok(summary) => {
            (StatusCode::OK, Json(ApiResponse::ok(ManualTriggerData::from(summary))))
        },
        Err(err) => {
            error!(error = %err, "manual trigger sweep failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("sweep failed: {err}"))),
            )
        },
    }
}
