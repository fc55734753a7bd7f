use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub fingerprint_hits: u64,
    pub fingerprint_misses: u64,
    pub rate_limited: u64,
    pub store_failures: u64,
    pub rollbacks: u64,
    pub rollback_failures: u64,
    pub dispatch_rejections: u64,
}

/// Admission counters, shared by handle across tasks.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    fingerprint_hits: AtomicU64,
    fingerprint_misses: AtomicU64,
    rate_limited: AtomicU64,
    store_failures: AtomicU64,
    rollbacks: AtomicU64,
    rollback_failures: AtomicU64,
    dispatch_rejections: AtomicU64,
}

impl Observability {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fingerprint(&self, hit: bool) {
        if hit {
            self.fingerprint_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fingerprint_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback_failure(&self) {
        self.rollback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_rejection(&self) {
        self.dispatch_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            fingerprint_hits: self.fingerprint_hits.load(Ordering::Relaxed),
            fingerprint_misses: self.fingerprint_misses.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
            rollback_failures: self.rollback_failures.load(Ordering::Relaxed),
            dispatch_rejections: self.dispatch_rejections.load(Ordering::Relaxed),
        }
    }
}
