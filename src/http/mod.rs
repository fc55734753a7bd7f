//! Middleware entry points in front of the relay.

mod error;
mod middleware;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

pub use error::{OpenAiErrorDetail, OpenAiErrorResponse, map_admission_error};
pub use middleware::{
    MAX_ADMISSION_BODY_BYTES, admission, client_ip, global_api_limit, identity_from_headers,
};

use crate::clock::Clock;
use crate::config::AdmissionConfig;
use crate::dispatch::{AffinityStore, Channel, ChannelIndex, Distributor};
use crate::fingerprint::{FingerprintCache, RelayMode};
use crate::limiter::{DistributedRateLimiter, LimiterBackend};
use crate::observability::{Observability, ObservabilitySnapshot};

/// Routing metadata attached to admitted requests for the relay stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingContext {
    pub model: String,
    pub relay_mode: RelayMode,
    pub platform: Option<String>,
    pub channel: Option<Channel>,
    /// Group the channel was selected under.
    pub group: String,
    pub token_group: String,
    pub fingerprint_hit: bool,
    pub started_at_millis: u64,
}

/// Everything the admission middleware needs, built once at startup.
#[derive(Clone)]
pub struct AdmissionState {
    pub config: Arc<AdmissionConfig>,
    pub cache: Arc<FingerprintCache>,
    pub limiter: Arc<DistributedRateLimiter>,
    pub distributor: Arc<Distributor>,
    pub observability: Arc<Observability>,
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdmissionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionState")
            .field("cache", &self.cache)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}

impl AdmissionState {
    pub fn new(
        config: AdmissionConfig,
        backend: LimiterBackend,
        index: Arc<dyn ChannelIndex>,
        affinity: Arc<dyn AffinityStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let observability = Arc::new(Observability::default());
        let cache = Arc::new(FingerprintCache::new(config.fingerprint.clone(), clock.clone()));
        let limiter = Arc::new(DistributedRateLimiter::new(
            backend,
            config.rate_limit.shard_count,
            observability.clone(),
        ));
        let distributor = Arc::new(Distributor::new(index, affinity, observability.clone()));
        Self {
            config: Arc::new(config),
            cache,
            limiter,
            distributor,
            observability,
            clock,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    limiter_backend: &'static str,
    fingerprint_entries: usize,
}

async fn health(State(state): State<AdmissionState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        limiter_backend: state.limiter.backend_name(),
        fingerprint_entries: state.cache.len(),
    })
}

async fn metrics(State(state): State<AdmissionState>) -> Json<ObservabilitySnapshot> {
    Json(state.observability.snapshot())
}

/// Wraps `relay` with the global per-IP limit and admission, and adds the admin routes.
pub fn router(state: AdmissionState, relay: Router) -> Router {
    let admitted = relay
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            admission,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            global_api_limit,
        ));
    Router::new()
        .route("/health", get(health))
        .route("/admission/metrics", get(metrics))
        .with_state(state)
        .merge(admitted)
}
