#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Request, Response};
use idempotency_engine::api::{create_router, AppState};
use idempotency_engine::idempotency::{
    CoordinatorConfig, DefaultSpecification, IdempotencyCoordinator, IdempotentRequest,
    MemoryIdempotencyStore, IDEMPOTENCY_KEY_HEADER,
};
use http::{HeaderValue, Method, Uri};
use std::sync::Arc;
use uuid::Uuid;

pub const BODY_LIMIT: usize = 64 * 1024;

pub fn new_key() -> String {
    Uuid::new_v4().to_string()
}

pub fn memory_coordinator(
    config: CoordinatorConfig,
) -> (Arc<IdempotencyCoordinator>, Arc<MemoryIdempotencyStore>) {
    let store = Arc::new(MemoryIdempotencyStore::new());
    let coordinator = Arc::new(IdempotencyCoordinator::new(
        store.clone(),
        Arc::new(DefaultSpecification::with_default_config()),
        config,
    ));
    (coordinator, store)
}

pub fn test_state(config: CoordinatorConfig) -> (AppState, Arc<MemoryIdempotencyStore>) {
    let (coordinator, store) = memory_coordinator(config);
    (AppState::new(coordinator), store)
}

pub fn test_router() -> axum::Router {
    let (state, _) = test_state(CoordinatorConfig::default());
    create_router(state)
}

pub fn idempotent_request(key: Option<&str>, path: &'static str, body: &str) -> IdempotentRequest {
    let request = IdempotentRequest::builder(Method::POST, Uri::from_static(path))
        .with_header(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        )
        .with_body(body.to_string());
    match key {
        Some(key) => request.with_header(
            IDEMPOTENCY_KEY_HEADER,
            HeaderValue::from_str(key).expect("key is a valid header value"),
        ),
        None => request,
    }
}

pub fn json_post(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), BODY_LIMIT)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), BODY_LIMIT)
        .await
        .unwrap()
        .to_vec()
}
