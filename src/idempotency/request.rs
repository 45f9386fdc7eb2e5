use axum::body::{Body, Bytes};
use axum::response::{IntoResponse, Response};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::idempotency::outcome::IDEMPOTENCY_STATUS_HEADER;

/// A request whose body has been buffered once so it can be inspected any
/// number of times (activation, fingerprinting, downstream handling).
///
/// Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone)]
pub struct IdempotentRequest {
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl IdempotentRequest {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            method,
            uri,
            headers,
            body: body.into(),
        }
    }

    /// Starts a request with no headers and an empty body.
    pub fn builder(method: Method, uri: Uri) -> Self {
        Self::new(method, uri, HeaderMap::new(), Bytes::new())
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns an independent view of the buffered body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn has_header(&self, name: &HeaderName) -> bool {
        self.headers.contains_key(name)
    }

    /// Returns the header value when present and representable as text.
    pub fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// A fully buffered HTTP response, as persisted for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "hex")]
    pub body: Vec<u8>,
}

impl StoredResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: status.as_u16(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Builds a JSON response with the matching content type.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(status, body).with_header(header::CONTENT_TYPE.as_str(), "application/json"))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Buffers a framework response so it can be persisted.
    ///
    /// `content-length` is dropped (it is recomputed on replay), as is the
    /// idempotency status header, which describes the current exchange only.
    pub async fn from_response(response: Response, limit: usize) -> Result<Self> {
        let (parts, body) = response.into_parts();
        let bytes = axum::body::to_bytes(body, limit)
            .await
            .map_err(|_| AppError::PayloadTooLarge(limit))?;

        let headers = parts
            .headers
            .iter()
            .filter(|(name, _)| **name != header::CONTENT_LENGTH && **name != IDEMPOTENCY_STATUS_HEADER)
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        Ok(Self {
            status: parts.status.as_u16(),
            headers,
            body: bytes.to_vec(),
        })
    }
}

impl IntoResponse for StoredResponse {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    response.headers_mut().append(name, value);
                }
                _ => tracing::warn!(header = %name, "Skipping unrepresentable stored header"),
            }
        }

        response
    }
}
