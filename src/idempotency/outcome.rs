use axum::response::{IntoResponse, Response};
use axum::Json;
use http::{HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};

use crate::api::responses::{ApiResponse, ErrorResponse};
use crate::idempotency::request::StoredResponse;

/// Response header describing how the idempotency layer handled a request.
pub const IDEMPOTENCY_STATUS_HEADER: HeaderName = HeaderName::from_static("idempotency-status");

/// Value of the `idempotency-status` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyStatus {
    New,
    Replayed,
    Conflict,
    Mismatch,
}

impl IdempotencyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdempotencyStatus::New => "new",
            IdempotencyStatus::Replayed => "replayed",
            IdempotencyStatus::Conflict => "conflict",
            IdempotencyStatus::Mismatch => "mismatch",
        }
    }
}

/// Protocol-level refusals. These are normal client outcomes, not faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    MissingKey,
    InvalidKey,
    PayloadMismatch,
    Conflict,
}

impl Rejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Rejection::MissingKey | Rejection::InvalidKey => StatusCode::BAD_REQUEST,
            Rejection::PayloadMismatch => StatusCode::UNPROCESSABLE_ENTITY,
            Rejection::Conflict => StatusCode::CONFLICT,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MissingKey => "IDEMPOTENCY_KEY_MISSING",
            Rejection::InvalidKey => "IDEMPOTENCY_KEY_INVALID",
            Rejection::PayloadMismatch => "IDEMPOTENCY_KEY_REUSED",
            Rejection::Conflict => "IDEMPOTENCY_KEY_IN_USE",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Rejection::MissingKey => "Idempotency-Key header is required for this request",
            Rejection::InvalidKey => "Idempotency-Key header must be a valid key",
            Rejection::PayloadMismatch => {
                "Idempotency-Key has already been used with a different request payload"
            }
            Rejection::Conflict => {
                "A request with this Idempotency-Key is still being processed. Please retry later."
            }
        }
    }

    pub fn status(&self) -> Option<IdempotencyStatus> {
        match self {
            Rejection::PayloadMismatch => Some(IdempotencyStatus::Mismatch),
            Rejection::Conflict => Some(IdempotencyStatus::Conflict),
            Rejection::MissingKey | Rejection::InvalidKey => None,
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(ApiResponse::<()>::error(ErrorResponse::new(
                self.code(),
                self.message(),
            ))),
        )
            .into_response()
    }
}

/// Result of running a request through the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyOutcome {
    /// Activation declined; the downstream handler ran without any tracking.
    NotApplicable(StoredResponse),
    Rejected(Rejection),
    /// A stored response returned verbatim; the handler did not run.
    Replayed(StoredResponse),
    /// The handler ran and its response is now stored for replay.
    Committed(StoredResponse),
}

impl IdempotencyOutcome {
    pub fn status(&self) -> Option<IdempotencyStatus> {
        match self {
            IdempotencyOutcome::NotApplicable(_) => None,
            IdempotencyOutcome::Rejected(rejection) => rejection.status(),
            IdempotencyOutcome::Replayed(_) => Some(IdempotencyStatus::Replayed),
            IdempotencyOutcome::Committed(_) => Some(IdempotencyStatus::New),
        }
    }

    /// Label used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            IdempotencyOutcome::NotApplicable(_) => "not_applicable",
            IdempotencyOutcome::Rejected(Rejection::MissingKey) => "missing_key",
            IdempotencyOutcome::Rejected(Rejection::InvalidKey) => "invalid_key",
            IdempotencyOutcome::Rejected(Rejection::PayloadMismatch) => "mismatch",
            IdempotencyOutcome::Rejected(Rejection::Conflict) => "conflict",
            IdempotencyOutcome::Replayed(_) => "replayed",
            IdempotencyOutcome::Committed(_) => "committed",
        }
    }

    /// Returns the stored or fresh response, if the outcome carries one.
    pub fn response(&self) -> Option<&StoredResponse> {
        match self {
            IdempotencyOutcome::NotApplicable(response)
            | IdempotencyOutcome::Replayed(response)
            | IdempotencyOutcome::Committed(response) => Some(response),
            IdempotencyOutcome::Rejected(_) => None,
        }
    }

    /// Converts the outcome into an HTTP response, optionally tagging it with
    /// the `idempotency-status` header.
    pub fn into_response_with_status(self, status_header: bool) -> Response {
        let status = self.status();
        let mut response = match self {
            IdempotencyOutcome::NotApplicable(response)
            | IdempotencyOutcome::Replayed(response)
            | IdempotencyOutcome::Committed(response) => response.into_response(),
            IdempotencyOutcome::Rejected(rejection) => rejection.into_response(),
        };

        if let (true, Some(status)) = (status_header, status) {
            response.headers_mut().insert(
                IDEMPOTENCY_STATUS_HEADER,
                HeaderValue::from_static(status.as_str()),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(Rejection::MissingKey.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(Rejection::InvalidKey.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Rejection::PayloadMismatch.status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(Rejection::Conflict.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_missing_and_invalid_messages_differ() {
        assert_ne!(Rejection::MissingKey.message(), Rejection::InvalidKey.message());
    }

    #[tokio::test]
    async fn test_rejection_body() {
        let response = Rejection::PayloadMismatch.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "IDEMPOTENCY_KEY_REUSED");
    }

    #[test]
    fn test_status_header_applied() {
        let outcome = IdempotencyOutcome::Replayed(StoredResponse::new(StatusCode::OK, "hi"));
        let response = outcome.into_response_with_status(true);
        assert_eq!(response.headers()[IDEMPOTENCY_STATUS_HEADER], "replayed");

        let outcome = IdempotencyOutcome::Committed(StoredResponse::new(StatusCode::OK, "hi"));
        let response = outcome.into_response_with_status(false);
        assert!(response.headers().get(IDEMPOTENCY_STATUS_HEADER).is_none());
    }

    #[test]
    fn test_missing_key_has_no_status_header() {
        let response =
            IdempotencyOutcome::Rejected(Rejection::MissingKey).into_response_with_status(true);
        assert!(response.headers().get(IDEMPOTENCY_STATUS_HEADER).is_none());
    }
}
