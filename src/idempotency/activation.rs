use http::{HeaderMap, HeaderName};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::AppError;
use crate::idempotency::request::IdempotentRequest;

pub type ActivationFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

pub type ActivationPredicate = Arc<dyn Fn(&IdempotentRequest) -> ActivationFuture + Send + Sync>;

/// Decides whether a request goes through idempotency handling at all.
#[derive(Clone)]
pub enum ActivationStrategy {
    /// Every request is handled.
    Always,
    /// Only requests that carry the idempotency key header. Presence is enough;
    /// the key itself is validated later.
    OptIn,
    /// Caller-supplied predicate. It may inspect the body, so the axum
    /// middleware buffers (and size-checks) every request before asking it.
    Custom(ActivationPredicate),
}

impl ActivationStrategy {
    pub fn custom<F>(predicate: F) -> Self
    where
        F: Fn(&IdempotentRequest) -> bool + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(move |request: &IdempotentRequest| -> ActivationFuture {
            let active = predicate(request);
            Box::pin(std::future::ready(active))
        }))
    }

    /// The returned future must be `'static`; clone what it needs from the
    /// request (cloning an [`IdempotentRequest`] is cheap).
    pub fn custom_async<F, Fut>(predicate: F) -> Self
    where
        F: Fn(&IdempotentRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        Self::Custom(Arc::new(move |request: &IdempotentRequest| -> ActivationFuture {
            Box::pin(predicate(request))
        }))
    }

    pub async fn is_active(&self, request: &IdempotentRequest, key_header: &HeaderName) -> bool {
        match self {
            ActivationStrategy::Custom(predicate) => predicate(request).await,
            _ => self
                .decide_from_headers(request.headers(), key_header)
                .unwrap_or(true),
        }
    }

    /// Decides from the headers alone, or `None` when the strategy needs the
    /// whole request.
    pub fn decide_from_headers(&self, headers: &HeaderMap, key_header: &HeaderName) -> Option<bool> {
        match self {
            ActivationStrategy::Always => Some(true),
            ActivationStrategy::OptIn => Some(headers.contains_key(key_header)),
            ActivationStrategy::Custom(_) => None,
        }
    }
}

impl Default for ActivationStrategy {
    fn default() -> Self {
        ActivationStrategy::Always
    }
}

impl fmt::Debug for ActivationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationStrategy::Always => f.write_str("Always"),
            ActivationStrategy::OptIn => f.write_str("OptIn"),
            ActivationStrategy::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FromStr for ActivationStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" => Ok(ActivationStrategy::Always),
            "opt-in" | "optin" | "opt_in" => Ok(ActivationStrategy::OptIn),
            other => Err(AppError::Configuration(format!(
                "unknown activation strategy '{}', expected 'always' or 'opt-in'",
                other
            ))),
        }
    }
}
