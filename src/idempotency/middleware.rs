use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

use crate::error::AppError;
use crate::idempotency::coordinator::{CoordinatorError, DownstreamError, IdempotencyCoordinator};
use crate::idempotency::request::{IdempotentRequest, StoredResponse};

/// A 5xx response from the wrapped router. Passed back to the client
/// unchanged and never stored for replay.
#[derive(Debug)]
pub struct ServerErrorResponse(pub Response);

/// Axum middleware that puts the wrapped routes behind the coordinator.
///
/// Requests declined by an `Always` or `OptIn` strategy are forwarded with
/// their body stream untouched. Everything else is buffered up to
/// `max_body_bytes` first.
///
/// ```ignore
/// let protected = Router::new()
///     .route("/api/hello", post(hello))
///     .layer(middleware::from_fn_with_state(coordinator, idempotency_middleware));
/// ```
pub async fn idempotency_middleware(
    State(coordinator): State<Arc<IdempotencyCoordinator>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let config = coordinator.config();
    if config
        .activation
        .decide_from_headers(request.headers(), &config.header_name)
        == Some(false)
    {
        coordinator.record_pass_through();
        return Ok(next.run(request).await);
    }

    let limit = config.max_body_bytes;
    let status_header = config.status_header;
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| AppError::PayloadTooLarge(limit))?;

    let idempotent = IdempotentRequest::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        bytes.clone(),
    );

    // Only a custom predicate can still decline here.
    if !coordinator.is_applicable(&idempotent).await {
        coordinator.record_pass_through();
        return Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await);
    }

    // The original parts are forwarded so extensions set by outer layers survive.
    let result = coordinator
        .process_applicable_with(idempotent, |_| async move {
            let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;
            if response.status().is_server_error() {
                return Err(DownstreamError::Failed(ServerErrorResponse(response)));
            }

            // The handler has run by now, so a response that cannot be
            // buffered must not release the lock.
            StoredResponse::from_response(response, limit)
                .await
                .map_err(|e| {
                    DownstreamError::Unstorable(AppError::Internal(anyhow::anyhow!(
                        "failed to buffer handler response: {}",
                        e
                    )))
                })
        })
        .await;

    match result {
        Ok(outcome) => Ok(outcome.into_response_with_status(status_header)),
        Err(CoordinatorError::Idempotency(err)) => Err(err),
        Err(CoordinatorError::Downstream(ServerErrorResponse(response))) => {
            tracing::warn!(status = %response.status(), "Handler failed, response not stored");
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::activation::ActivationStrategy;
    use crate::idempotency::coordinator::CoordinatorConfig;
    use crate::idempotency::outcome::IDEMPOTENCY_STATUS_HEADER;
    use crate::idempotency::specification::{DefaultSpecification, IDEMPOTENCY_KEY_HEADER};
    use crate::idempotency::storage::MemoryIdempotencyStore;
    use axum::{http::StatusCode, middleware, routing::post, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::ServiceExt;

    const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn coordinator(config: CoordinatorConfig) -> Arc<IdempotencyCoordinator> {
        Arc::new(IdempotencyCoordinator::new(
            Arc::new(MemoryIdempotencyStore::new()),
            Arc::new(DefaultSpecification::with_default_config()),
            config,
        ))
    }

    fn post_request(body: &'static str) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri("/flaky")
            .header(IDEMPOTENCY_KEY_HEADER, KEY)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_server_errors_are_not_replayed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let app = Router::new()
            .route(
                "/flaky",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            (StatusCode::SERVICE_UNAVAILABLE, "try again")
                        } else {
                            (StatusCode::OK, "done")
                        }
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(
                coordinator(CoordinatorConfig::default()),
                idempotency_middleware,
            ));

        let first = app.clone().oneshot(post_request("{}")).await.unwrap();
        assert_eq!(first.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(first.headers().get(IDEMPOTENCY_STATUS_HEADER).is_none());

        let second = app.oneshot(post_request("{}")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.headers()[IDEMPOTENCY_STATUS_HEADER], "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let app = Router::new()
            .route("/flaky", post(|| async { "unreachable" }))
            .layer(middleware::from_fn_with_state(
                coordinator(CoordinatorConfig {
                    max_body_bytes: 8,
                    ..CoordinatorConfig::default()
                }),
                idempotency_middleware,
            ));

        let response = app
            .oneshot(post_request(r#"{"name":"far too long"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_handler_sees_original_body() {
        let app = Router::new()
            .route("/flaky", post(|body: String| async move { body }))
            .layer(middleware::from_fn_with_state(
                coordinator(CoordinatorConfig::default()),
                idempotency_middleware,
            ));

        let response = app.oneshot(post_request(r#"{"a":1}"#)).await.unwrap();
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();

        assert_eq!(body.as_ref(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_declined_request_bypasses_body_limit() {
        let app = Router::new()
            .route("/flaky", post(|body: String| async move { body.len().to_string() }))
            .layer(middleware::from_fn_with_state(
                coordinator(CoordinatorConfig {
                    activation: ActivationStrategy::OptIn,
                    max_body_bytes: 16,
                    ..CoordinatorConfig::default()
                }),
                idempotency_middleware,
            ));

        let request = axum::http::Request::builder()
            .method("POST")
            .uri("/flaky")
            .body(Body::from("x".repeat(50)))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(IDEMPOTENCY_STATUS_HEADER).is_none());
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"50");
    }
}
