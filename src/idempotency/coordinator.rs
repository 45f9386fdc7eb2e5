use chrono::{Duration, Utc};
use http::HeaderName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::AppError;
use crate::idempotency::activation::ActivationStrategy;
use crate::idempotency::outcome::{IdempotencyOutcome, Rejection};
use crate::idempotency::request::{IdempotentRequest, StoredResponse};
use crate::idempotency::specification::{
    DefaultSpecification, IdempotencySpecification, IDEMPOTENCY_KEY_HEADER,
};
use crate::idempotency::storage::{IdempotencyStore, IdempotentRequestRecord, StorageError};
use crate::observability::logging::mask_key;
use crate::observability::metrics::{get_metrics, LatencyTimer};

/// Per-coordinator counters.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub not_applicable: AtomicU64,
    pub new_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub mismatches: AtomicU64,
    pub rejected_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub storage_errors: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_new(&self) {
        self.new_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_error(&self) {
        self.storage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_outcome(&self, outcome: &IdempotencyOutcome) {
        let counter = match outcome {
            IdempotencyOutcome::NotApplicable(_) => &self.not_applicable,
            IdempotencyOutcome::Rejected(Rejection::MissingKey)
            | IdempotencyOutcome::Rejected(Rejection::InvalidKey) => &self.rejected_requests,
            IdempotencyOutcome::Rejected(Rejection::PayloadMismatch) => &self.mismatches,
            IdempotencyOutcome::Rejected(Rejection::Conflict) => &self.conflicts,
            IdempotencyOutcome::Replayed(_) => &self.replayed_requests,
            IdempotencyOutcome::Committed(_) => &self.completed_requests,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn replay_rate(&self) -> f64 {
        self.snapshot().replay_rate()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            not_applicable: self.not_applicable.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            mismatches: self.mismatches.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            storage_errors: self.storage_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub not_applicable: u64,
    pub new_requests: u64,
    pub replayed_requests: u64,
    pub conflicts: u64,
    pub mismatches: u64,
    pub rejected_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub storage_errors: u64,
}

impl MetricsSnapshot {
    /// Share of tracked requests answered from a stored response.
    pub fn replay_rate(&self) -> f64 {
        // Counters are loaded one at a time, so a pass-through may land in between.
        let tracked = self.total_requests.saturating_sub(self.not_applicable);
        if tracked == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / tracked as f64
        }
    }
}

/// Runtime configuration for [`IdempotencyCoordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub header_name: HeaderName,
    pub activation: ActivationStrategy,
    /// Locks older than this may be taken over. `None` treats every held lock
    /// as in flight.
    pub lock_timeout: Option<Duration>,
    /// Tag responses with the `idempotency-status` header.
    pub status_header: bool,
    /// Upper bound for buffered request and response bodies.
    pub max_body_bytes: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            header_name: IDEMPOTENCY_KEY_HEADER,
            activation: ActivationStrategy::Always,
            lock_timeout: None,
            status_header: true,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// How a downstream handler run through
/// [`IdempotencyCoordinator::process_applicable_with`] can fail.
#[derive(Debug)]
pub enum DownstreamError<E> {
    /// The handler failed before causing side effects. The record is unlocked
    /// so a retry runs the handler again.
    Failed(E),
    /// The handler ran but its response cannot be stored. The record stays
    /// locked, like a failed persist.
    Unstorable(AppError),
}

/// Error returned by [`IdempotencyCoordinator::process`].
///
/// Handler errors come back untouched in `Downstream`; everything the
/// coordinator itself raises is an [`AppError`].
#[derive(Debug)]
pub enum CoordinatorError<E> {
    Idempotency(AppError),
    Downstream(E),
}

impl<E> From<AppError> for CoordinatorError<E> {
    fn from(err: AppError) -> Self {
        CoordinatorError::Idempotency(err)
    }
}

impl<E: fmt::Display> fmt::Display for CoordinatorError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Idempotency(err) => write!(f, "{}", err),
            CoordinatorError::Downstream(err) => write!(f, "Downstream handler failed: {}", err),
        }
    }
}

impl<E> std::error::Error for CoordinatorError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CoordinatorError::Idempotency(err) => Some(err),
            CoordinatorError::Downstream(err) => Some(err),
        }
    }
}

/// Drives one request through the idempotency-key protocol.
///
/// Holds no record state between calls; all mutual exclusion lives in the
/// store, so any number of coordinators may share one.
pub struct IdempotencyCoordinator {
    store: Arc<dyn IdempotencyStore>,
    specification: Arc<dyn IdempotencySpecification>,
    config: CoordinatorConfig,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyCoordinator {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        specification: Arc<dyn IdempotencySpecification>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            specification,
            config,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn with_defaults(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::new(
            store,
            Arc::new(DefaultSpecification::with_default_config()),
            CoordinatorConfig::default(),
        )
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn IdempotencyStore> {
        Arc::clone(&self.store)
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Evaluates the activation strategy. Has no side effects.
    pub async fn is_applicable(&self, request: &IdempotentRequest) -> bool {
        self.config
            .activation
            .is_active(request, &self.config.header_name)
            .await
    }

    /// Counts a request that bypassed the protocol. Hosts that evaluate
    /// [`Self::is_applicable`] themselves call this instead of [`Self::process`].
    pub fn record_pass_through(&self) {
        self.metrics.record_request();
        self.metrics.not_applicable.fetch_add(1, Ordering::Relaxed);
        get_metrics().record_idempotency_outcome("not_applicable");
    }

    /// Runs `downstream` under the protocol, or directly when activation
    /// declines the request.
    pub async fn process<F, Fut, E>(
        &self,
        request: IdempotentRequest,
        downstream: F,
    ) -> Result<IdempotencyOutcome, CoordinatorError<E>>
    where
        F: FnOnce(IdempotentRequest) -> Fut,
        Fut: Future<Output = Result<StoredResponse, E>>,
    {
        if !self.is_applicable(&request).await {
            self.record_pass_through();
            let response = downstream(request)
                .await
                .map_err(CoordinatorError::Downstream)?;
            return Ok(IdempotencyOutcome::NotApplicable(response));
        }

        self.process_applicable(request, downstream).await
    }

    /// Runs the protocol without consulting the activation strategy.
    pub async fn process_applicable<F, Fut, E>(
        &self,
        request: IdempotentRequest,
        downstream: F,
    ) -> Result<IdempotencyOutcome, CoordinatorError<E>>
    where
        F: FnOnce(IdempotentRequest) -> Fut,
        Fut: Future<Output = Result<StoredResponse, E>>,
    {
        self.process_applicable_with(request, |request| {
            let response = downstream(request);
            async move { response.await.map_err(DownstreamError::Failed) }
        })
        .await
    }

    /// Like [`Self::process_applicable`], for hosts that can tell a handler
    /// failure apart from a response that ran but cannot be stored.
    pub async fn process_applicable_with<F, Fut, E>(
        &self,
        request: IdempotentRequest,
        downstream: F,
    ) -> Result<IdempotencyOutcome, CoordinatorError<E>>
    where
        F: FnOnce(IdempotentRequest) -> Fut,
        Fut: Future<Output = Result<StoredResponse, DownstreamError<E>>>,
    {
        self.metrics.record_request();

        let key = match request.header_str(&self.config.header_name) {
            Some(key) => key.to_string(),
            None if request.has_header(&self.config.header_name) => {
                return Ok(self.reject(Rejection::InvalidKey));
            }
            None => return Ok(self.reject(Rejection::MissingKey)),
        };

        if !self.specification.is_valid_key(&key) {
            return Ok(self.reject(Rejection::InvalidKey));
        }

        let masked = mask_key(&key);
        let fingerprint = self.specification.fingerprint(&request);
        let lookup_key = self.specification.lookup_key(&request);

        if !lookup_key.contains_key(&key) {
            tracing::error!(
                idempotency_key = %masked,
                "Lookup key does not embed the idempotency key"
            );
            return Err(AppError::Contract(
                "lookup key must contain the idempotency key".to_string(),
            )
            .into());
        }

        let record = match self
            .store
            .get(&lookup_key)
            .await
            .map_err(|e| self.storage_failure("get", e))?
        {
            Some(record) => record,
            None => self
                .store
                .create(&lookup_key, &fingerprint)
                .await
                .map_err(|e| self.storage_failure("create", e))?,
        };

        // Checked on created records too: `create` may hand back a record
        // another request inserted first.
        if !record.matches_fingerprint(&fingerprint) {
            tracing::info!(idempotency_key = %masked, "Idempotency key reused with a different payload");
            return Ok(self.reject(Rejection::PayloadMismatch));
        }

        if record.is_locked() && !self.is_stale(&record) {
            tracing::info!(idempotency_key = %masked, "Request with this key is already in flight");
            return Ok(self.reject(Rejection::Conflict));
        }

        if let Some(response) = &record.response {
            tracing::debug!(idempotency_key = %masked, status = response.status, "Replaying stored response");
            let outcome = IdempotencyOutcome::Replayed(response.clone());
            self.observe(&outcome);
            return Ok(outcome);
        }

        if record.is_locked() {
            get_metrics().record_stale_lock_takeover();
            tracing::warn!(
                idempotency_key = %masked,
                locked_at = ?record.locked_at,
                "Taking over stale lock"
            );
        }

        let locked = self
            .store
            .lock(&record)
            .await
            .map_err(|e| self.storage_failure("lock", e))?;
        self.metrics.record_new();
        tracing::debug!(idempotency_key = %masked, "Lock acquired, invoking handler");

        let timer = LatencyTimer::new();
        let result = downstream(request).await;
        get_metrics().record_handler_latency(timer.elapsed_ms());

        match result {
            Ok(response) => {
                self.store
                    .set_response_and_unlock(&locked, &response)
                    .await
                    .map_err(|e| self.storage_failure("set_response", e))?;

                let outcome = IdempotencyOutcome::Committed(response);
                self.observe(&outcome);
                Ok(outcome)
            }
            Err(DownstreamError::Unstorable(err)) => {
                self.metrics.record_failed();
                get_metrics().record_handler_failure();
                tracing::error!(
                    idempotency_key = %masked,
                    error = %err,
                    "Handler ran but its response cannot be stored, record stays locked"
                );
                Err(CoordinatorError::Idempotency(err))
            }
            Err(DownstreamError::Failed(err)) => {
                self.metrics.record_failed();
                get_metrics().record_handler_failure();

                // The record goes back to idle so a retry can run the handler.
                if let Err(unlock_err) = self.store.unlock(&locked).await {
                    self.storage_failure("unlock", unlock_err);
                }

                tracing::debug!(idempotency_key = %masked, "Handler failed, no response stored");
                Err(CoordinatorError::Downstream(err))
            }
        }
    }

    fn is_stale(&self, record: &IdempotentRequestRecord) -> bool {
        match (self.config.lock_timeout, record.lock_age(Utc::now())) {
            (Some(timeout), Some(age)) => age > timeout,
            _ => false,
        }
    }

    fn reject(&self, rejection: Rejection) -> IdempotencyOutcome {
        let outcome = IdempotencyOutcome::Rejected(rejection);
        self.observe(&outcome);
        outcome
    }

    fn observe(&self, outcome: &IdempotencyOutcome) {
        self.metrics.record_outcome(outcome);
        get_metrics().record_idempotency_outcome(outcome.label());
    }

    fn storage_failure(&self, operation: &'static str, err: StorageError) -> AppError {
        self.metrics.record_storage_error();
        get_metrics().record_storage_error(operation);
        tracing::error!(operation, error = %err, "Idempotency store operation failed");
        AppError::Storage(err)
    }
}
