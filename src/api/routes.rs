use axum::{
    extract::{MatchedPath, Request},
    http::HeaderName,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::idempotency::{idempotency_middleware, IdempotencyCoordinator};
use crate::observability::{get_metrics, HealthChecker, LatencyTimer};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IdempotencyCoordinator>,
    pub health_checker: Arc<HealthChecker>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub counter: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(coordinator: Arc<IdempotencyCoordinator>) -> Self {
        let health_checker = Arc::new(HealthChecker::new(coordinator.store()));
        Self {
            coordinator,
            health_checker,
            metrics_handle: None,
            counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }
}

/// Creates the main API router with all routes.
///
/// Only `/api` routes run behind the idempotency middleware.
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/hello", post(handlers::hello))
        .route("/api/counter/increment", post(handlers::increment_counter))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.coordinator),
            idempotency_middleware,
        ));

    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/idempotency/stats", get(handlers::idempotency_stats))
        .merge(protected)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateHeaderLayer::new(REQUEST_ID_HEADER))
        .layer(SetRequestIdLayer::new(REQUEST_ID_HEADER, MakeRequestUuid))
        .with_state(state)
}

async fn track_http_metrics(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let timer = LatencyTimer::new();
    let response = next.run(request).await;
    get_metrics().record_http_request(&method, &path, response.status().as_u16(), timer.elapsed_ms());

    response
}
