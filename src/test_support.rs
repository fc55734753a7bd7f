//! In-memory stand-ins for the shared store, used by tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::limiter::scripts::ScriptKind;
use crate::limiter::{BucketParams, MemoryLimiter, ScriptStore, WindowMode};
use crate::utils::hash::sha256_hex;

/// A `ScriptStore` that runs both admission scripts against a `MemoryLimiter`.
pub struct MemoryScriptStore {
    limiter: MemoryLimiter,
    scripts: DashMap<String, ScriptKind>,
    offline: AtomicBool,
    calls: AtomicU64,
}

impl MemoryScriptStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiter: MemoryLimiter::new(clock),
            scripts: DashMap::new(),
            offline: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    /// While offline every call fails with a connection error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Forget loaded scripts, like `SCRIPT FLUSH`.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn window_len(&self, key: &str) -> usize {
        self.limiter.window_len(key)
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    fn execute(&self, kind: ScriptKind, keys: &[String], args: &[String]) -> Result<i64, StoreError> {
        let key = keys
            .first()
            .ok_or_else(|| StoreError::Response("missing key".to_string()))?;
        let int_arg = |index: usize| -> Result<i64, StoreError> {
            args.get(index)
                .and_then(|raw| raw.parse().ok())
                .ok_or_else(|| StoreError::Response(format!("bad argument {}", index + 1)))
        };
        let admitted = match kind {
            ScriptKind::TokenBucket => self.limiter.allow(
                key,
                BucketParams {
                    requested: int_arg(0)?,
                    rate: int_arg(1)?,
                    capacity: int_arg(2)?,
                    expire_seconds: int_arg(3)?,
                },
            ),
            ScriptKind::SlidingWindow => {
                let mode = WindowMode::from_arg(int_arg(3)?)
                    .ok_or_else(|| StoreError::Response("unknown mode".to_string()))?;
                let window = Duration::from_secs(int_arg(1)?.max(0) as u64);
                self.limiter.sliding_window(
                    key,
                    int_arg(0)?,
                    window,
                    mode,
                    args.get(4).map(String::as_str),
                )
            }
        };
        Ok(i64::from(admitted))
    }
}

#[async_trait]
impl ScriptStore for MemoryScriptStore {
    async fn load_script(&self, source: &str) -> Result<String, StoreError> {
        self.ensure_online()?;
        let kind = ScriptKind::from_source(source)
            .ok_or_else(|| StoreError::Response("unknown script".to_string()))?;
        let sha = sha256_hex(source.as_bytes());
        self.scripts.insert(sha.clone(), kind);
        Ok(sha)
    }

    async fn eval_sha(
        &self,
        sha: &str,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        self.ensure_online()?;
        let kind = self
            .scripts
            .get(sha)
            .map(|kind| *kind)
            .ok_or(StoreError::NoScript)?;
        self.execute(kind, keys, args)
    }

    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<i64, StoreError> {
        self.ensure_online()?;
        let kind = ScriptKind::from_source(source)
            .ok_or_else(|| StoreError::Response("unknown script".to_string()))?;
        self.execute(kind, keys, args)
    }
}
