use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::scripts::{BucketParams, WindowMode};
use crate::clock::Clock;
use crate::utils::task::AbortOnDrop;

#[derive(Debug)]
struct Stamp {
    at_millis: u64,
    entry: Option<String>,
}

/// Stamps in insertion order, keyed by sequence number, with named entries indexed for rollback.
#[derive(Debug, Default)]
struct Ring {
    window_millis: u64,
    next_seq: u64,
    stamps: BTreeMap<u64, Stamp>,
    entries: HashMap<String, u64>,
}

impl Ring {
    fn len(&self) -> usize {
        self.stamps.len()
    }

    fn newest_millis(&self) -> Option<u64> {
        self.stamps.last_key_value().map(|(_, stamp)| stamp.at_millis)
    }

    fn push(&mut self, at_millis: u64, entry: Option<String>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = &entry {
            if let Some(previous) = self.entries.insert(entry.clone(), seq) {
                self.stamps.remove(&previous);
            }
        }
        self.stamps.insert(seq, Stamp { at_millis, entry });
    }

    fn pop_oldest(&mut self) {
        if let Some((seq, stamp)) = self.stamps.pop_first() {
            if let Some(entry) = stamp.entry {
                if self.entries.get(&entry) == Some(&seq) {
                    self.entries.remove(&entry);
                }
            }
        }
    }

    fn remove_entry(&mut self, entry: &str) {
        if let Some(seq) = self.entries.remove(entry) {
            self.stamps.remove(&seq);
        }
    }

    fn evict_expired(&mut self, now: u64) {
        while let Some((_, oldest)) = self.stamps.first_key_value() {
            if now.saturating_sub(oldest.at_millis) >= self.window_millis {
                self.pop_oldest();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    updated_millis: u64,
    idle_millis: u64,
}

/// Process-local limiter with the same window and bucket semantics as the shared scripts.
/// Only correct within one process.
pub struct MemoryLimiter {
    clock: Arc<dyn Clock>,
    windows: DashMap<String, Ring>,
    buckets: DashMap<String, Bucket>,
}

impl std::fmt::Debug for MemoryLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryLimiter")
            .field("windows", &self.windows.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl MemoryLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            buckets: DashMap::new(),
        }
    }

    pub fn sliding_window(
        &self,
        key: &str,
        max_count: i64,
        window: Duration,
        mode: WindowMode,
        entry: Option<&str>,
    ) -> bool {
        if mode == WindowMode::Rollback {
            self.rollback(key, entry);
            return true;
        }
        if max_count <= 0 || window.is_zero() {
            return true;
        }
        let max_count = max_count as usize;
        let now = self.clock.now_millis();

        let mut ring = self.windows.entry(key.to_string()).or_default();
        ring.window_millis = window.as_millis() as u64;
        ring.evict_expired(now);

        if mode != WindowMode::Record && ring.len() >= max_count {
            return false;
        }
        if mode == WindowMode::Check {
            return true;
        }

        ring.push(now, entry.filter(|entry| !entry.is_empty()).map(str::to_string));
        while ring.len() > max_count {
            ring.pop_oldest();
        }
        true
    }

    fn rollback(&self, key: &str, entry: Option<&str>) {
        let Some(entry) = entry.filter(|entry| !entry.is_empty()) else {
            return;
        };
        if let Some(mut ring) = self.windows.get_mut(key) {
            ring.remove_entry(entry);
        }
    }

    pub fn allow(&self, key: &str, params: BucketParams) -> bool {
        if params.capacity <= 0 || params.rate <= 0 {
            return true;
        }
        let now = self.clock.now_millis();
        let capacity = params.capacity as f64;
        let idle_millis = if params.expire_seconds > 0 {
            params.expire_seconds as u64 * 1000
        } else {
            (params.capacity / params.rate).max(1) as u64 * 2000
        };

        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            updated_millis: now,
            idle_millis,
        });
        let elapsed = now.saturating_sub(bucket.updated_millis) as f64 / 1000.0;
        let mut tokens = (bucket.tokens + elapsed * params.rate as f64).min(capacity);
        let requested = params.requested as f64;
        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }
        *bucket = Bucket {
            tokens,
            updated_millis: now,
            idle_millis,
        };
        allowed
    }

    /// Live entries in a window, after expiry.
    pub fn window_len(&self, key: &str) -> usize {
        let now = self.clock.now_millis();
        match self.windows.get_mut(key) {
            Some(mut ring) => {
                ring.evict_expired(now);
                ring.len()
            }
            None => 0,
        }
    }

    pub fn key_count(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    /// Drop windows whose newest entry aged out and buckets idle past their expiry.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.key_count();
        self.windows.retain(|_, ring| {
            ring.newest_millis()
                .is_some_and(|newest| now.saturating_sub(newest) < ring.window_millis)
        });
        self.buckets
            .retain(|_, bucket| now.saturating_sub(bucket.updated_millis) < bucket.idle_millis);
        before.saturating_sub(self.key_count())
    }

    pub fn spawn_janitor(self: &Arc<Self>, every: Duration) -> AbortOnDrop {
        let limiter = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    return;
                };
                let evicted = limiter.sweep();
                if evicted > 0 {
                    debug!(evicted, "in-memory limiter janitor evicted keys");
                }
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }
}
