use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::Next;
use axum::response::Response;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::reject;
use super::{AdmissionState, RoutingContext};
use crate::dispatch::{Identity, check_global_api, compose_policies};
use crate::error::{AdmissionError, StoreError};
use crate::fingerprint::{RequestView, parse_request};
use crate::limiter::{Admission, DistributedRateLimiter, RateLimitPolicy};

/// Largest body the admission stage buffers.
pub const MAX_ADMISSION_BODY_BYTES: usize = 32 * 1024 * 1024;

const TOKEN_ID_HEADER: &str = "x-admission-token-id";
const USER_ID_HEADER: &str = "x-admission-user-id";
const USER_GROUP_HEADER: &str = "x-admission-user-group";
const TOKEN_GROUP_HEADER: &str = "x-admission-token-group";
const CHANNEL_HEADER: &str = "x-admission-channel";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// First `x-forwarded-for` hop, then `x-real-ip`, then the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|hop| !hop.is_empty()) {
            return Some(first.to_string());
        }
    }
    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        return Some(real_ip.to_string());
    }
    peer.map(|addr| addr.ip().to_string())
}

fn request_client_ip(request: &Request) -> Option<String> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    client_ip(request.headers(), peer)
}

/// Identity taken from headers set by a trusted auth proxy. Leaves an identity already
/// placed by an earlier layer untouched.
pub async fn identity_from_headers(mut request: Request, next: Next) -> Response {
    if request.extensions().get::<Identity>().is_none() {
        let headers = request.headers();
        let identity = Identity {
            token_id: header_str(headers, TOKEN_ID_HEADER)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            user_id: header_str(headers, USER_ID_HEADER)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0),
            user_group: header_str(headers, USER_GROUP_HEADER)
                .unwrap_or("default")
                .to_string(),
            token_group: header_str(headers, TOKEN_GROUP_HEADER)
                .unwrap_or_default()
                .to_string(),
            pinned_channel: header_str(headers, CHANNEL_HEADER).map(str::to_string),
            ..Default::default()
        };
        request.extensions_mut().insert(identity);
    }
    next.run(request).await
}

/// Global per-IP API limit. Requests without a known address pass.
pub async fn global_api_limit(
    State(state): State<AdmissionState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(ip) = request_client_ip(&request) else {
        return next.run(request).await;
    };
    if let Err(err) = check_global_api(&state.limiter, &state.config.rate_limit, &ip).await {
        match &err {
            AdmissionError::RateLimited { .. } => state.observability.record_rate_limited(),
            AdmissionError::Store(_) => state.observability.record_store_failure(),
            _ => {}
        }
        return reject(err, request.uri().path());
    }
    next.run(request).await
}

/// Fingerprint, dispatch and rate-limit the request, then settle the limiter and affinity
/// once the response status is known.
pub async fn admission(State(state): State<AdmissionState>, request: Request, next: Next) -> Response {
    state.observability.record_request();
    let started_at_millis = state.clock.now_millis();
    let path = request.uri().path().to_string();
    let client_ip = request_client_ip(&request);

    let (mut parts, body) = request.into_parts();
    let body = match to_bytes(body, MAX_ADMISSION_BODY_BYTES).await {
        Ok(body) => body,
        Err(err) => {
            return reject(
                AdmissionError::invalid_request(format!("failed to read request body: {err}")),
                &path,
            );
        }
    };
    let identity = parts
        .extensions
        .get::<Identity>()
        .cloned()
        .unwrap_or_default();

    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let mut view = RequestView::new(
        parts.method.as_str(),
        path.as_str(),
        parts.uri.query().unwrap_or_default(),
        content_type,
        body.clone(),
    );
    if let Some(scope) = identity.cache_scope() {
        view = view.with_token_scope(scope);
    }

    let (decision, fingerprint_hit) = match state.cache.resolve(&view, parse_request) {
        Ok(resolved) => resolved,
        Err(err) => return reject(err, &path),
    };
    state.observability.record_fingerprint(fingerprint_hit);
    drop(view);

    let dispatch = match state.distributor.dispatch(&identity, &decision).await {
        Ok(dispatch) => dispatch,
        Err(err) => return reject(err, &path),
    };

    let policies = compose_policies(&state.config.rate_limit, &identity, client_ip.as_deref());
    let admission = match evaluate_policies(&state, policies).await {
        Ok(admission) => admission,
        Err(err) => return reject(err, &path),
    };

    parts.extensions.insert(RoutingContext {
        model: decision.model.clone(),
        relay_mode: decision.relay_mode,
        platform: decision.platform.clone(),
        channel: dispatch.channel.clone(),
        group: dispatch.group.clone(),
        token_group: decision
            .token_group
            .clone()
            .unwrap_or_else(|| identity.token_group.clone()),
        fingerprint_hit,
        started_at_millis,
    });
    debug!(
        path = %path,
        model = %decision.model,
        channel = ?dispatch.channel_id(),
        group = %dispatch.group,
        fingerprint_hit,
        "request admitted"
    );

    let pending = PendingOutcome::new(state.limiter.clone(), admission);
    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    let status = response.status().as_u16();
    pending.settle(status).await;
    state
        .distributor
        .record_outcome(&decision.model, &dispatch, status)
        .await;
    response
}

/// Holds an admitted request's reservations until the relay answers. Dropped unsettled
/// (the client went away mid-relay), it rolls them back as a client-closed request.
struct PendingOutcome {
    limiter: Arc<DistributedRateLimiter>,
    admission: Option<Admission>,
}

impl PendingOutcome {
    fn new(limiter: Arc<DistributedRateLimiter>, admission: Admission) -> Self {
        Self {
            limiter,
            admission: Some(admission),
        }
    }

    async fn settle(mut self, status: u16) {
        if let Some(admission) = self.admission.take() {
            self.limiter.complete(admission, status).await;
        }
    }
}

impl Drop for PendingOutcome {
    fn drop(&mut self) {
        let Some(admission) = self.admission.take() else {
            return;
        };
        if admission.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                reservations = admission.reservations().len(),
                "no runtime to roll back reservations of an abandoned request"
            );
            return;
        };
        debug!("client closed before the relay answered; rolling back reservations");
        let limiter = self.limiter.clone();
        let status = AdmissionError::Cancelled.status_code();
        runtime.spawn(async move {
            limiter.complete(admission, status).await;
        });
    }
}

/// Runs the policy chain on its own task. If the client goes away the token is cancelled:
/// the in-flight store call finishes, nothing further runs and reservations are rolled back.
async fn evaluate_policies(
    state: &AdmissionState,
    policies: Vec<RateLimitPolicy>,
) -> Result<Admission, AdmissionError> {
    if policies.is_empty() {
        return Ok(Admission::default());
    }
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let limiter = state.limiter.clone();
    let task = tokio::spawn(async move { limiter.admit(&policies, &cancel).await });
    match task.await {
        Ok(result) => result,
        Err(err) => Err(AdmissionError::Store(StoreError::Unavailable(format!(
            "admission task failed: {err}"
        )))),
    }
}
