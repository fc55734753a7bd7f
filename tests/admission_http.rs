use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::{Json, Router};
use ditto_admission::dispatch::{
    Channel, Identity, MemoryAffinityStore, StaticChannelIndex, TokenRateLimit,
};
use ditto_admission::http::router;
use ditto_admission::limiter::{LimiterBackend, MemoryLimiter, ScriptRuntime};
use ditto_admission::test_support::MemoryScriptStore;
use ditto_admission::{
    AdmissionConfig, AdmissionState, ManualClock, ObservabilitySnapshot, RoutingContext,
};
use serde_json::{Value, json};
use tower::util::ServiceExt;

async fn relay(
    Extension(context): Extension<RoutingContext>,
    headers: HeaderMap,
) -> axum::response::Response {
    if headers.contains_key("x-upstream-hang") {
        std::future::pending::<()>().await;
    }
    let status = headers
        .get("x-upstream-status")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK);
    let body = json!({
        "model": context.model,
        "channel": context.channel.map(|channel| channel.id),
        "group": context.group,
        "fingerprint_hit": context.fingerprint_hit,
    });
    (status, Json(body)).into_response()
}

fn channel(id: i64, enabled: bool) -> Channel {
    Channel {
        id,
        name: format!("ch-{id}"),
        enabled,
        weight: 1,
        priority: 0,
        groups: vec!["default".to_string()],
        models: vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()],
    }
}

fn limited_config(total: i64, success: i64) -> AdmissionConfig {
    let mut config = AdmissionConfig::default();
    config.rate_limit.model.enabled = true;
    config.rate_limit.model.duration_minutes = 1;
    config.rate_limit.model.total_count = total;
    config.rate_limit.model.success_count = success;
    config
}

fn local_app(config: AdmissionConfig, channels: Vec<Channel>) -> (AdmissionState, Router) {
    let clock = Arc::new(ManualClock::default());
    let backend = LimiterBackend::Local(Arc::new(MemoryLimiter::new(clock.clone())));
    build_app(config, backend, channels, clock)
}

fn build_app(
    config: AdmissionConfig,
    backend: LimiterBackend,
    channels: Vec<Channel>,
    clock: Arc<ManualClock>,
) -> (AdmissionState, Router) {
    let state = AdmissionState::new(
        config,
        backend,
        Arc::new(StaticChannelIndex::new(channels)),
        Arc::new(MemoryAffinityStore::new()),
        clock,
    );
    let relay = Router::new().route("/v1/*path", any(relay));
    let app = router(state.clone(), relay);
    (state, app)
}

fn token(token_id: i64) -> Identity {
    Identity {
        token_id,
        user_id: 100 + token_id,
        user_group: "default".to_string(),
        ..Default::default()
    }
}

fn chat(identity: Identity, model: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .extension(identity)
        .body(Body::from(json!({ "model": model, "messages": [] }).to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn token_override_tightens_total_limit_for_that_token_only() {
    let (_state, app) = local_app(limited_config(100, 1000), vec![channel(1, true)]);
    let mut limited = token(1);
    limited.rate_limit = TokenRateLimit {
        enabled: true,
        duration_minutes: 1,
        total_count: 10,
        success_count: 0,
    };

    for _ in 0..10 {
        let response = app.clone().oneshot(chat(limited.clone(), "gpt-4o")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(chat(limited.clone(), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("at most 10 requests per 1 minute")
    );

    let other = app.clone().oneshot(chat(token(2), "gpt-4o")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn failed_upstream_call_does_not_use_success_quota() {
    let (state, app) = local_app(limited_config(0, 1), vec![channel(1, true)]);

    let mut failing = chat(token(1), "gpt-4o");
    failing
        .headers_mut()
        .insert("x-upstream-status", "502".parse().unwrap());
    let response = app.clone().oneshot(failing).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(state.observability.snapshot().rollbacks, 1);
}

#[tokio::test]
async fn abandoned_request_releases_its_success_slot() {
    let (state, app) = local_app(limited_config(0, 1), vec![channel(1, true)]);

    let mut hanging = chat(token(1), "gpt-4o");
    hanging
        .headers_mut()
        .insert("x-upstream-hang", "1".parse().unwrap());
    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), app.clone().oneshot(hanging)).await;
    assert!(abandoned.is_err());

    // The rollback runs on a spawned task once the request future is dropped.
    for _ in 0..50 {
        if state.observability.snapshot().rollbacks == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state.observability.snapshot().rollbacks, 1);

    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn unreachable_store_fails_closed_then_recovers() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(MemoryScriptStore::new(clock.clone()));
    let runtime = ScriptRuntime::new(store.clone(), Duration::from_millis(500));
    let (state, app) = build_app(
        limited_config(100, 1000),
        LimiterBackend::Shared(runtime),
        vec![channel(1, true)],
        clock,
    );

    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    store.set_offline(true);
    for _ in 0..3 {
        let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"]["code"], "rate_limit_check_failed");
    }

    store.set_offline(false);
    store.flush_scripts();
    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = state.observability.snapshot();
    assert_eq!(snapshot.store_failures, 3);
    assert_eq!(snapshot.rate_limited, 0);
}

#[tokio::test]
async fn disabled_pinned_channel_is_rejected() {
    let (_state, app) = local_app(
        AdmissionConfig::default(),
        vec![channel(7, false), channel(8, true)],
    );
    let mut pinned = token(1);
    pinned.pinned_channel = Some("7".to_string());

    let response = app.clone().oneshot(chat(pinned, "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"]["code"], "channel_disabled");

    let mut unknown = token(1);
    unknown.pinned_channel = Some("99".to_string());
    let response = app.clone().oneshot(chat(unknown, "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn repeated_request_hits_the_fingerprint_cache() {
    let (state, app) = local_app(AdmissionConfig::default(), vec![channel(1, true)]);

    let first = json_body(app.clone().oneshot(chat(token(1), "gpt-4o-mini")).await.unwrap()).await;
    assert_eq!(first["fingerprint_hit"], false);
    assert_eq!(first["model"], "gpt-4o-mini");
    assert_eq!(first["channel"], 1);

    let second = json_body(app.clone().oneshot(chat(token(1), "gpt-4o-mini")).await.unwrap()).await;
    assert_eq!(second["fingerprint_hit"], true);
    assert_eq!(second["model"], "gpt-4o-mini");

    // Another token has its own scoped namespace.
    let other = json_body(app.clone().oneshot(chat(token(2), "gpt-4o-mini")).await.unwrap()).await;
    assert_eq!(other["fingerprint_hit"], false);

    let snapshot = state.observability.snapshot();
    assert_eq!(snapshot.fingerprint_hits, 1);
    assert_eq!(snapshot.fingerprint_misses, 2);
}

#[tokio::test]
async fn prewarmed_models_hit_for_any_token() {
    let (state, app) = local_app(AdmissionConfig::default(), vec![channel(1, true)]);
    assert!(state.cache.prewarm() > 0);

    let body = json_body(app.clone().oneshot(chat(token(77), "gpt-4o")).await.unwrap()).await;
    assert_eq!(body["fingerprint_hit"], true);
    assert_eq!(body["model"], "gpt-4o");
}

#[tokio::test]
async fn malformed_body_and_unknown_model_are_rejected() {
    let (_state, app) = local_app(AdmissionConfig::default(), vec![channel(1, true)]);

    let bad = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .extension(token(1))
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.clone().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let response = app.clone().oneshot(chat(token(1), "claude-3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn global_limit_applies_per_forwarded_address() {
    let mut config = AdmissionConfig::default();
    config.rate_limit.global_api.max_requests = 2;
    config.rate_limit.global_api.duration_seconds = 60;
    let (_state, app) = local_app(config, vec![channel(1, true)]);

    let from = |ip: &str| {
        let mut request = chat(token(1), "gpt-4o");
        request
            .headers_mut()
            .insert("x-forwarded-for", ip.parse().unwrap());
        request
    };
    for _ in 0..2 {
        let response = app.clone().oneshot(from("198.51.100.1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(from("198.51.100.1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let response = app.clone().oneshot(from("198.51.100.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn metrics_endpoint_reports_counters() {
    let (_state, app) = local_app(AdmissionConfig::default(), vec![channel(1, true)]);
    let response = app.clone().oneshot(chat(token(1), "gpt-4o")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .method("GET")
        .uri("/admission/metrics")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let metrics: ObservabilitySnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics.requests, 1);
}
