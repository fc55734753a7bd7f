use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::key::{CacheKeys, RequestView, WARM_MODEL_PATHS, warm_model_key};
use super::{RelayMode, RoutingDecision, normalize_warm_model, with_compact_suffix};
use crate::clock::Clock;
use crate::config::FingerprintCacheConfig;
use crate::error::Result;
use crate::utils::task::AbortOnDrop;

#[derive(Clone, Debug)]
struct CachedDecision {
    decision: RoutingDecision,
    expires_at_millis: u64,
}

/// Memoizes request parsing per fingerprint. Never blocks on I/O.
pub struct FingerprintCache {
    config: FingerprintCacheConfig,
    warm_models: HashSet<String>,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, CachedDecision>,
    count: AtomicUsize,
    sweeping: AtomicBool,
    last_sweep_millis: AtomicU64,
}

impl std::fmt::Debug for FingerprintCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCache")
            .field("enabled", &self.config.enabled)
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl FingerprintCache {
    pub fn new(config: FingerprintCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let warm_models = config
            .warm_models
            .iter()
            .map(|model| normalize_warm_model(model).to_string())
            .filter(|model| !model.is_empty())
            .collect();
        let now = clock.now_millis();
        Self {
            config,
            warm_models,
            clock,
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            sweeping: AtomicBool::new(false),
            last_sweep_millis: AtomicU64::new(now),
        }
    }

    pub fn config(&self) -> &FingerprintCacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_warm_model(&self, model: &str) -> bool {
        self.warm_models.contains(normalize_warm_model(model))
    }

    pub fn ttl_for(&self, model: &str) -> Duration {
        if self.is_warm_model(model) {
            self.config.warm_ttl()
        } else {
            self.config.ttl()
        }
    }

    pub fn keys_for(&self, view: &RequestView) -> CacheKeys {
        CacheKeys::derive(view, &self.config)
    }

    /// Scoped namespace first, then the warm-model namespace.
    pub fn lookup(&self, keys: &CacheKeys) -> Option<RoutingDecision> {
        keys.scoped
            .as_deref()
            .and_then(|key| self.get(key))
            .or_else(|| keys.warm.as_deref().and_then(|key| self.get(key)))
    }

    /// Returns the decision and whether it came from the cache. A miss runs `parse` and
    /// stores its result under the scoped key.
    pub fn resolve<F>(&self, view: &RequestView, parse: F) -> Result<(RoutingDecision, bool)>
    where
        F: FnOnce(&RequestView) -> Result<RoutingDecision>,
    {
        let keys = self.keys_for(view);
        if let Some(decision) = self.lookup(&keys) {
            return Ok((decision, true));
        }
        let decision = parse(view)?;
        if let Some(key) = keys.scoped {
            self.store(key, decision.clone());
        }
        Ok((decision, false))
    }

    pub fn get(&self, key: &str) -> Option<RoutingDecision> {
        if key.is_empty() {
            return None;
        }
        self.maybe_sweep(false);
        let now = self.clock.now_millis();
        let hit = self.entries.get(key).map(|entry| {
            (entry.expires_at_millis > now).then(|| entry.decision.clone())
        })?;
        if hit.is_none() && self.remove_expired(key, now) {
            debug!(key, "expired fingerprint entry dropped on read");
        }
        hit
    }

    /// Insert with a fresh expiry. Last writer wins; dropped when the ceiling holds after a forced sweep.
    pub fn store(&self, key: impl Into<String>, decision: RoutingDecision) -> bool {
        let key = key.into();
        if key.is_empty() {
            return false;
        }
        self.maybe_sweep(false);
        let expires_at_millis =
            self.clock.now_millis() + self.ttl_for(&decision.model).as_millis() as u64;
        let cached = CachedDecision {
            decision,
            expires_at_millis,
        };

        if let Some(mut existing) = self.entries.get_mut(&key) {
            *existing = cached;
            return true;
        }
        if self.len() >= self.config.max_entries {
            self.maybe_sweep(true);
            if self.len() >= self.config.max_entries {
                debug!(entries = self.len(), "fingerprint cache full, dropping insert");
                return false;
            }
        }
        if self.entries.insert(key, cached).is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Seed the warm namespace for every warm model on every warm path.
    pub fn prewarm(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }
        let mut seeded = 0;
        for model in &self.warm_models {
            for path in WARM_MODEL_PATHS {
                let relay_mode = RelayMode::from_path("POST", path);
                let served_model = if relay_mode == RelayMode::ResponsesCompact {
                    with_compact_suffix(model)
                } else {
                    model.clone()
                };
                let decision = RoutingDecision {
                    model: served_model,
                    relay_mode,
                    should_select_channel: true,
                    ..Default::default()
                };
                if self.store(warm_model_key("POST", path, "", model), decision) {
                    seeded += 1;
                }
            }
        }
        seeded
    }

    fn remove_expired(&self, key: &str, now: u64) -> bool {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.expires_at_millis <= now)
            .is_some();
        if removed {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every expired entry. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = entry.expires_at_millis > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            self.count.fetch_sub(removed, Ordering::Relaxed);
        }
        self.last_sweep_millis.store(now, Ordering::Relaxed);
        removed
    }

    fn maybe_sweep(&self, force: bool) {
        let now = self.clock.now_millis();
        if !force {
            let last = self.last_sweep_millis.load(Ordering::Relaxed);
            let interval = self.config.cleanup_interval().as_millis() as u64;
            if now.saturating_sub(last) < interval {
                return;
            }
        }
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let removed = self.sweep();
        self.sweeping.store(false, Ordering::Release);
        if removed > 0 {
            debug!(removed, force, "fingerprint cache sweep");
        }
    }

    /// Periodic sweep; warm seeds are refreshed on each tick so the shared namespace stays populated.
    pub fn spawn_sweeper(self: &Arc<Self>) -> AbortOnDrop {
        let cache = Arc::downgrade(self);
        let every = self.config.cleanup_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                cache.maybe_sweep(true);
                cache.prewarm();
            }
        });
        AbortOnDrop::new(handle.abort_handle())
    }
}
