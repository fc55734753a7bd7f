use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::memory::MemoryLimiter;
use super::policy::RateLimitPolicy;
use super::scripts::{BucketParams, ScriptRuntime, WindowMode, WindowParams};
use super::shard::shard_key;
use crate::error::{AdmissionError, StoreError};
use crate::observability::Observability;
use crate::utils::hash::random_token;

/// Key mark for total-count (token bucket) counters.
pub const TOTAL_COUNT_MARK: &str = "MRRL";
/// Key mark for success-count (sliding window) counters.
pub const SUCCESS_COUNT_MARK: &str = "MRRLS";

/// Extra key lifetime past the window for model policies.
const KEY_EXPIRY_SLACK_SECS: i64 = 60;

pub enum LimiterBackend {
    Shared(ScriptRuntime),
    Local(Arc<MemoryLimiter>),
}

impl LimiterBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Shared(_) => "shared",
            Self::Local(_) => "local",
        }
    }
}

/// A speculative success record. Left standing on success; cancelled on failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub key: String,
    pub token: String,
    pub window: Duration,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Reserve {
    Reserved(Reservation),
    NotRequired,
    Rejected,
}

/// Reservations held by one admitted request until its outcome is known.
#[must_use = "pass the admission to `DistributedRateLimiter::complete` once the response status is known"]
#[derive(Debug, Default)]
pub struct Admission {
    reservations: Vec<Reservation>,
}

impl Admission {
    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

pub struct DistributedRateLimiter {
    backend: LimiterBackend,
    shard_count: u32,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("backend", &self.backend.name())
            .field("shard_count", &self.shard_count)
            .finish()
    }
}

impl DistributedRateLimiter {
    pub fn new(backend: LimiterBackend, shard_count: u32, observability: Arc<Observability>) -> Self {
        Self {
            backend,
            shard_count: shard_count.max(1),
            observability,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn success_key(&self, policy: &RateLimitPolicy) -> String {
        shard_key(
            policy.scope.as_str(),
            SUCCESS_COUNT_MARK,
            &policy.identifier,
            self.shard_count,
        )
    }

    pub fn total_key(&self, policy: &RateLimitPolicy) -> String {
        shard_key(
            policy.scope.as_str(),
            TOTAL_COUNT_MARK,
            &policy.identifier,
            self.shard_count,
        )
    }

    /// Raw sliding-window call against either backend.
    pub async fn window(
        &self,
        key: &str,
        params: WindowParams,
        mode: WindowMode,
        entry: Option<&str>,
    ) -> Result<bool, StoreError> {
        match &self.backend {
            LimiterBackend::Shared(runtime) => {
                runtime.sliding_window(key, params, mode, entry).await
            }
            LimiterBackend::Local(memory) => Ok(memory.sliding_window(
                key,
                params.max_count,
                Duration::from_secs(params.window_seconds.max(0) as u64),
                mode,
                entry,
            )),
        }
    }

    /// Check-and-record a success slot under a fresh token, before the outcome is known.
    pub async fn reserve_success(&self, policy: &RateLimitPolicy) -> Result<Reserve, StoreError> {
        if policy.max_success <= 0 || policy.window.is_zero() {
            return Ok(Reserve::NotRequired);
        }
        let key = self.success_key(policy);
        let token = random_token();
        let window_seconds = policy.window_seconds();
        let params = WindowParams {
            max_count: policy.max_success,
            window_seconds,
            expire_seconds: window_seconds + KEY_EXPIRY_SLACK_SECS,
        };
        let admitted = self
            .window(&key, params, WindowMode::CheckAndRecord, Some(&token))
            .await?;
        if !admitted {
            return Ok(Reserve::Rejected);
        }
        Ok(Reserve::Reserved(Reservation {
            key,
            token,
            window: policy.window,
        }))
    }

    /// Token-bucket total-count check. Counts every request, success or not.
    pub async fn check_total(&self, policy: &RateLimitPolicy) -> Result<bool, StoreError> {
        if policy.max_total <= 0 || policy.window.is_zero() {
            return Ok(true);
        }
        let key = self.total_key(policy);
        let window_seconds = policy.window_seconds();
        let params = BucketParams::per_window(
            policy.max_total,
            window_seconds,
            window_seconds + KEY_EXPIRY_SLACK_SECS,
        );
        match &self.backend {
            LimiterBackend::Shared(runtime) => runtime.allow(&key, params).await,
            LimiterBackend::Local(memory) => Ok(memory.allow(&key, params)),
        }
    }

    /// Remove a speculative record. Retried once; failures are logged and swallowed.
    pub async fn cancel(&self, reservation: &Reservation) {
        let params = WindowParams {
            max_count: 1,
            window_seconds: 1,
            expire_seconds: reservation.window.as_secs() as i64,
        };
        for attempt in 1..=2 {
            match self
                .window(
                    &reservation.key,
                    params,
                    WindowMode::Rollback,
                    Some(&reservation.token),
                )
                .await
            {
                Ok(_) => {
                    self.observability.record_rollback();
                    return;
                }
                Err(err) => {
                    warn!(
                        key = %reservation.key,
                        entry = %reservation.token,
                        attempt,
                        error = %err,
                        "rollback of success reservation failed"
                    );
                }
            }
        }
        self.observability.record_rollback_failure();
    }

    async fn cancel_all(&self, reservations: &[Reservation]) {
        for reservation in reservations.iter().rev() {
            self.cancel(reservation).await;
        }
    }

    /// Evaluate every policy as an AND. Success slots are reserved before each total check;
    /// any rejection, store failure or cancellation rolls back what was reserved so far.
    pub async fn admit(
        &self,
        policies: &[RateLimitPolicy],
        cancel: &CancellationToken,
    ) -> Result<Admission, AdmissionError> {
        let mut admission = Admission::default();
        for policy in policies.iter().filter(|policy| policy.is_active()) {
            if cancel.is_cancelled() {
                return Err(self.abort(admission, AdmissionError::Cancelled).await);
            }
            match self.reserve_success(policy).await {
                Ok(Reserve::Reserved(reservation)) => admission.reservations.push(reservation),
                Ok(Reserve::NotRequired) => {}
                Ok(Reserve::Rejected) => {
                    let err = AdmissionError::RateLimited {
                        reason: policy.success_exceeded_reason(),
                    };
                    return Err(self.abort(admission, err).await);
                }
                Err(err) => return Err(self.abort(admission, err.into()).await),
            }

            if cancel.is_cancelled() {
                return Err(self.abort(admission, AdmissionError::Cancelled).await);
            }
            match self.check_total(policy).await {
                Ok(true) => {}
                Ok(false) => {
                    let err = AdmissionError::RateLimited {
                        reason: policy.total_exceeded_reason(),
                    };
                    return Err(self.abort(admission, err).await);
                }
                Err(err) => return Err(self.abort(admission, err.into()).await),
            }
        }

        if cancel.is_cancelled() {
            return Err(self.abort(admission, AdmissionError::Cancelled).await);
        }
        Ok(admission)
    }

    async fn abort(&self, admission: Admission, err: AdmissionError) -> AdmissionError {
        match &err {
            AdmissionError::RateLimited { .. } => self.observability.record_rate_limited(),
            AdmissionError::Store(_) => self.observability.record_store_failure(),
            _ => {}
        }
        if !admission.is_empty() {
            debug!(
                reservations = admission.reservations.len(),
                "rolling back reservations of rejected request"
            );
        }
        self.cancel_all(&admission.reservations).await;
        err
    }

    /// Finalize after the response: reservations stand on success and are rolled back on status >= 400.
    pub async fn complete(&self, admission: Admission, status: u16) {
        if status >= 400 {
            self.cancel_all(&admission.reservations).await;
        }
    }
}
