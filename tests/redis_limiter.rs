#![cfg(feature = "store-redis")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ditto_admission::limiter::{
    DistributedRateLimiter, LimiterBackend, PolicyScope, RateLimitPolicy, RedisScriptStore,
    Reserve, ScriptRuntime, WindowMode, WindowParams,
};
use ditto_admission::{AdmissionError, Observability};
use tokio_util::sync::CancellationToken;

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn redis_url() -> Option<String> {
    env_nonempty("DITTO_REDIS_URL").or_else(|| env_nonempty("REDIS_URL"))
}

static PREFIX_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn test_prefix() -> String {
    let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("ditto_admission_test:{millis}:{n}")
}

async fn runtime(url: String) -> ScriptRuntime {
    let store = RedisScriptStore::new(url, 4)
        .expect("store")
        .with_prefix(test_prefix());
    store.ping().await.expect("ping");
    let runtime = ScriptRuntime::new(Arc::new(store), Duration::from_secs(2));
    runtime.preload().await.expect("preload");
    runtime
}

#[tokio::test]
async fn sliding_window_admits_max_then_rolls_back_by_entry() {
    let Some(url) = redis_url() else {
        return;
    };
    let runtime = runtime(url).await;
    let params = WindowParams {
        max_count: 2,
        window_seconds: 60,
        expire_seconds: 120,
    };

    assert!(
        runtime
            .sliding_window("w", params, WindowMode::CheckAndRecord, Some("a"))
            .await
            .expect("a")
    );
    assert!(
        runtime
            .sliding_window("w", params, WindowMode::CheckAndRecord, Some("b"))
            .await
            .expect("b")
    );
    assert!(
        !runtime
            .sliding_window("w", params, WindowMode::CheckAndRecord, Some("c"))
            .await
            .expect("c")
    );

    for _ in 0..2 {
        assert!(
            runtime
                .sliding_window("w", params, WindowMode::Rollback, Some("a"))
                .await
                .expect("rollback")
        );
    }
    assert!(
        runtime
            .sliding_window("w", params, WindowMode::Check, None)
            .await
            .expect("check")
    );
}

#[tokio::test]
async fn token_bucket_limits_total_count() {
    let Some(url) = redis_url() else {
        return;
    };
    let limiter = DistributedRateLimiter::new(
        LimiterBackend::Shared(runtime(url).await),
        2,
        Arc::new(Observability::default()),
    );
    let policy = RateLimitPolicy::new(PolicyScope::Model, "7", Duration::from_secs(60), 3, 0);
    let cancel = CancellationToken::new();
    let mut admitted = 0;
    for _ in 0..4 {
        match limiter.admit(std::slice::from_ref(&policy), &cancel).await {
            Ok(admission) => {
                admitted += 1;
                limiter.complete(admission, 200).await;
            }
            Err(AdmissionError::RateLimited { .. }) => {}
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!(admitted, 3);
}

#[tokio::test]
async fn success_reservation_is_released_on_failure() {
    let Some(url) = redis_url() else {
        return;
    };
    let limiter = DistributedRateLimiter::new(
        LimiterBackend::Shared(runtime(url).await),
        1,
        Arc::new(Observability::default()),
    );
    let policy = RateLimitPolicy::new(PolicyScope::Model, "9", Duration::from_secs(60), 0, 1);

    let Reserve::Reserved(reservation) = limiter.reserve_success(&policy).await.expect("reserve")
    else {
        panic!("expected a reservation");
    };
    assert_eq!(
        limiter.reserve_success(&policy).await.expect("second"),
        Reserve::Rejected
    );
    limiter.cancel(&reservation).await;
    assert!(matches!(
        limiter.reserve_success(&policy).await.expect("third"),
        Reserve::Reserved(_)
    ));
}
