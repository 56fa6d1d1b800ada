// HTTP route handlers for the execution service

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use verifier_common::types::RunRequest;
use verifier_runner::RunnerError;

use crate::metrics::InFlight;
use crate::AppState;

/// POST /run_code - Execute one program with one stdin
pub async fn run_code(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Response {
    let _permit = match state.permits.acquire().await {
        Ok(permit) => permit,
        Err(_) => return (StatusCode::SERVICE_UNAVAILABLE, "Shutting down").into_response(),
    };
    let _in_flight = InFlight::enter(&state.metrics.runs_in_flight);

    let started = Instant::now();
    let result = state.runner.execute(&request).await;
    state
        .metrics
        .run_duration
        .observe(started.elapsed().as_secs_f64());

    match result {
        Ok(response) => {
            let status = response.status.to_string();
            debug!(
                status = %status,
                return_code = ?response.return_code,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Execution finished"
            );
            state.metrics.record_outcome(&status);
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(RunnerError::RequestTooLarge(reason)) => {
            warn!(reason = %reason, "Rejected oversized request");
            state.metrics.record_outcome("too_large");
            (StatusCode::PAYLOAD_TOO_LARGE, reason).into_response()
        }
        Err(e) => {
            error!(error = %e, "Runner failed");
            state.metrics.record_outcome("runner_error");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// GET /health - Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /metrics - Prometheus exposition
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
