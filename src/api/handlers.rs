use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::atomic::Ordering;

use crate::api::requests::{HelloRequest, IncrementRequest, ValidationError};
use crate::api::responses::{
    ApiResponse, CounterResponse, ErrorResponse, HealthResponse, HelloResponse,
    ValidationErrorDetail,
};
use crate::idempotency::MetricsSnapshot;

use super::routes::AppState;

type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn validation_error(errors: Vec<ValidationError>) -> ApiError {
    let details: Vec<ValidationErrorDetail> = errors
        .into_iter()
        .map(|e| ValidationErrorDetail {
            field: e.field,
            message: e.message,
        })
        .collect();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed")
                .with_details(details),
        )),
    )
}

/// Health check endpoint.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let health = state.health_checker.check_all().await;
    let status = if health.status.is_unhealthy() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (status, Json(ApiResponse::success(HealthResponse::from(health))))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match &state.metrics_handle {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

/// Counters of the coordinator guarding `/api`.
pub async fn idempotency_stats(State(state): State<AppState>) -> Json<ApiResponse<MetricsSnapshot>> {
    Json(ApiResponse::success(state.coordinator.metrics().snapshot()))
}

// ============================================================================
// Protected Handlers
// ============================================================================

/// Greets the caller.
pub async fn hello(Json(request): Json<HelloRequest>) -> Result<Json<HelloResponse>, ApiError> {
    request.validate().map_err(validation_error)?;
    Ok(Json(HelloResponse::greet(&request.name)))
}

/// Bumps the shared counter. Every execution is visible in the returned value,
/// so a replay is distinguishable from a second run.
pub async fn increment_counter(
    State(state): State<AppState>,
    Json(request): Json<IncrementRequest>,
) -> Result<Json<CounterResponse>, ApiError> {
    request.validate().map_err(validation_error)?;

    let amount = request.amount();
    let value = state.counter.fetch_add(amount, Ordering::SeqCst) + amount;
    tracing::info!(amount, value, "Counter incremented");

    Ok(Json(CounterResponse {
        value,
        incremented_by: amount,
    }))
}
