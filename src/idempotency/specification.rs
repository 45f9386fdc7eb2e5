use http::HeaderName;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::idempotency::request::IdempotentRequest;

/// Request header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: HeaderName = HeaderName::from_static("idempotency-key");

/// Digest of the parts of a request that make two requests "the same".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage key for one retry group: an idempotency key scoped to an operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LookupKey(String);

impl LookupKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the raw client key survives verbatim inside this lookup key.
    pub fn contains_key(&self, idempotency_key: &str) -> bool {
        !idempotency_key.is_empty() && self.0.contains(idempotency_key)
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decides what a valid key looks like and how requests are identified.
pub trait IdempotencySpecification: Send + Sync {
    fn is_valid_key(&self, key: &str) -> bool;

    fn fingerprint(&self, request: &IdempotentRequest) -> Fingerprint;

    /// Must embed the raw idempotency key; the coordinator refuses lookup keys
    /// that do not.
    fn lookup_key(&self, request: &IdempotentRequest) -> LookupKey;
}

/// Configuration for [`DefaultSpecification`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecificationConfig {
    pub header_name: String,
    /// Prefix for lookup keys
    pub key_prefix: String,
    /// Request headers folded into the fingerprint, besides method, URI and body
    pub fingerprint_headers: Vec<String>,
    /// Hash JSON bodies in canonical form (sorted object keys, no whitespace)
    pub canonicalize_json: bool,
}

impl Default for SpecificationConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER.as_str().to_string(),
            key_prefix: "idem".to_string(),
            fingerprint_headers: vec!["content-type".to_string()],
            canonicalize_json: true,
        }
    }
}

/// UUIDv4 keys, SHA-256 fingerprints and `{prefix}:{METHOD}:{path}:{key}`
/// lookup keys.
#[derive(Debug, Clone)]
pub struct DefaultSpecification {
    header_name: HeaderName,
    key_prefix: String,
    fingerprint_headers: Vec<HeaderName>,
    canonicalize_json: bool,
}

impl DefaultSpecification {
    pub fn new(config: SpecificationConfig) -> Result<Self> {
        let header_name = parse_header_name(&config.header_name)?;

        let mut fingerprint_headers = config
            .fingerprint_headers
            .iter()
            .map(|name| parse_header_name(name))
            .collect::<Result<Vec<_>>>()?;
        fingerprint_headers.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        fingerprint_headers.dedup();

        Ok(Self {
            header_name,
            key_prefix: config.key_prefix,
            fingerprint_headers,
            canonicalize_json: config.canonicalize_json,
        })
    }

    pub fn with_default_config() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER,
            key_prefix: "idem".to_string(),
            fingerprint_headers: vec![http::header::CONTENT_TYPE],
            canonicalize_json: true,
        }
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }

    fn body_for_fingerprint(&self, request: &IdempotentRequest) -> Vec<u8> {
        let raw = request.body();
        if !self.canonicalize_json || raw.is_empty() {
            return raw.to_vec();
        }

        match serde_json::from_slice::<Value>(raw) {
            Ok(value) => {
                let mut canonical = Vec::with_capacity(raw.len());
                match write_canonical_json(&value, &mut canonical) {
                    Ok(()) => canonical,
                    Err(_) => raw.to_vec(),
                }
            }
            Err(_) => raw.to_vec(),
        }
    }
}

impl IdempotencySpecification for DefaultSpecification {
    fn is_valid_key(&self, key: &str) -> bool {
        // Hyphenated form only; `Uuid::parse_str` also accepts simple and URN forms.
        key.len() == 36
            && Uuid::parse_str(key)
                .map(|id| id.get_version_num() == 4)
                .unwrap_or(false)
    }

    fn fingerprint(&self, request: &IdempotentRequest) -> Fingerprint {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, b"method", request.method().as_str().as_bytes());

        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| request.path());
        update_field(&mut hasher, b"uri", target.as_bytes());

        for name in &self.fingerprint_headers {
            for value in request.headers().get_all(name) {
                update_field(&mut hasher, name.as_str().as_bytes(), value.as_bytes());
            }
        }

        update_field(&mut hasher, b"body", &self.body_for_fingerprint(request));

        Fingerprint(hex::encode(hasher.finalize()))
    }

    fn lookup_key(&self, request: &IdempotentRequest) -> LookupKey {
        let key = request.header_str(&self.header_name).unwrap_or_default();
        LookupKey(format!(
            "{}:{}:{}:{}",
            self.key_prefix,
            request.method(),
            request.path(),
            key
        ))
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().to_ascii_lowercase().as_bytes())
        .map_err(|e| AppError::Configuration(format!("invalid header name '{}': {}", name, e)))
}

/// Length-prefixed so adjacent fields cannot bleed into each other.
fn update_field(hasher: &mut Sha256, label: &[u8], value: &[u8]) {
    hasher.update(label);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value);
}

/// Serializes JSON with object keys in sorted order regardless of how the
/// `serde_json` map is configured.
fn write_canonical_json(value: &Value, out: &mut Vec<u8>) -> serde_json::Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));

            out.push(b'{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical_json(value, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_canonical_json(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method, Uri};

    const KEY: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn request(method: Method, uri: &'static str, body: &'static str) -> IdempotentRequest {
        IdempotentRequest::builder(method, Uri::from_static(uri))
            .with_header(IDEMPOTENCY_KEY_HEADER, HeaderValue::from_static(KEY))
            .with_header(
                http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(body)
    }

    #[test]
    fn test_valid_keys() {
        let spec = DefaultSpecification::with_default_config();

        assert!(spec.is_valid_key(KEY));
        assert!(spec.is_valid_key(&Uuid::new_v4().to_string()));
        assert!(spec.is_valid_key(&KEY.to_uppercase()));
    }

    #[test]
    fn test_invalid_keys() {
        let spec = DefaultSpecification::with_default_config();

        assert!(!spec.is_valid_key(""));
        assert!(!spec.is_valid_key("not-a-uuid"));
        // version 1
        assert!(!spec.is_valid_key("c232ab00-9414-11ec-b3c8-9f6bdeced846"));
        // simple form
        assert!(!spec.is_valid_key("550e8400e29b41d4a716446655440000"));
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let spec = DefaultSpecification::with_default_config();
        let a = request(Method::POST, "/api/hello", r#"{"name":"Gouki"}"#);
        let b = request(Method::POST, "/api/hello", r#"{"name":"Gouki"}"#);

        assert_eq!(spec.fingerprint(&a), spec.fingerprint(&b));
        assert_eq!(spec.fingerprint(&a).as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_json_key_order_and_whitespace() {
        let spec = DefaultSpecification::with_default_config();
        let a = request(Method::POST, "/api/hello", r#"{"a":1,"b":{"y":2,"x":[1,2]}}"#);
        let b = request(Method::POST, "/api/hello", r#"{ "b": {"x": [1, 2], "y": 2}, "a": 1 }"#);

        assert_eq!(spec.fingerprint(&a), spec.fingerprint(&b));
    }

    #[test]
    fn test_fingerprint_distinguishes_payloads() {
        let spec = DefaultSpecification::with_default_config();
        let a = request(Method::POST, "/api/hello", r#"{"name":"Gouki"}"#);
        let b = request(Method::POST, "/api/hello", r#"{"name":"X"}"#);
        let c = request(Method::POST, "/api/hello", r#"{"x": [2, 1]}"#);
        let d = request(Method::POST, "/api/hello", r#"{"x": [1, 2]}"#);

        assert_ne!(spec.fingerprint(&a), spec.fingerprint(&b));
        assert_ne!(spec.fingerprint(&c), spec.fingerprint(&d));
    }

    #[test]
    fn test_fingerprint_covers_method_and_query() {
        let spec = DefaultSpecification::with_default_config();
        let post = request(Method::POST, "/api/hello", "{}");
        let put = request(Method::PUT, "/api/hello", "{}");
        let query = request(Method::POST, "/api/hello?dry_run=true", "{}");

        assert_ne!(spec.fingerprint(&post), spec.fingerprint(&put));
        assert_ne!(spec.fingerprint(&post), spec.fingerprint(&query));
    }

    #[test]
    fn test_raw_body_hashing_when_canonicalization_disabled() {
        let spec = DefaultSpecification::new(SpecificationConfig {
            canonicalize_json: false,
            ..SpecificationConfig::default()
        })
        .unwrap();
        let a = request(Method::POST, "/api/hello", r#"{"a":1,"b":2}"#);
        let b = request(Method::POST, "/api/hello", r#"{"b":2,"a":1}"#);

        assert_ne!(spec.fingerprint(&a), spec.fingerprint(&b));
    }

    #[test]
    fn test_lookup_key_contains_raw_key_and_operation() {
        let spec = DefaultSpecification::with_default_config();
        let hello = request(Method::POST, "/api/hello", "{}");
        let other = request(Method::POST, "/api/counter/increment", "{}");

        let key = spec.lookup_key(&hello);
        assert_eq!(key.as_str(), format!("idem:POST:/api/hello:{}", KEY));
        assert!(key.contains_key(KEY));
        assert_ne!(key, spec.lookup_key(&other));
    }

    #[test]
    fn test_lookup_key_ignores_query_string() {
        let spec = DefaultSpecification::with_default_config();
        let a = request(Method::POST, "/api/hello?x=1", "{}");
        let b = request(Method::POST, "/api/hello?x=2", "{}");

        assert_eq!(spec.lookup_key(&a), spec.lookup_key(&b));
    }

    #[test]
    fn test_custom_header_name() {
        let spec = DefaultSpecification::new(SpecificationConfig {
            header_name: "X-Request-Key".to_string(),
            key_prefix: "api".to_string(),
            ..SpecificationConfig::default()
        })
        .unwrap();
        let request = IdempotentRequest::builder(Method::POST, Uri::from_static("/pay"))
            .with_header(
                HeaderName::from_static("x-request-key"),
                HeaderValue::from_static(KEY),
            );

        assert_eq!(spec.header_name().as_str(), "x-request-key");
        assert_eq!(
            spec.lookup_key(&request).as_str(),
            format!("api:POST:/pay:{}", KEY)
        );
    }

    #[test]
    fn test_invalid_header_name_is_configuration_error() {
        let result = DefaultSpecification::new(SpecificationConfig {
            header_name: "bad header".to_string(),
            ..SpecificationConfig::default()
        });

        assert!(matches!(result, Err(AppError::Configuration(_))));
    }

    #[test]
    fn test_empty_key_never_contained() {
        assert!(!LookupKey::new("idem:POST:/x:").contains_key(""));
    }
}
