use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Token bucket. KEYS[1] = bucket hash; ARGV = requested, rate/s, capacity, expire seconds.
/// Returns 1 when the requested cost was taken, 0 otherwise.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local requested = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local expire = tonumber(ARGV[4])

local t = redis.call("TIME")
local now = tonumber(t[1]) + tonumber(t[2]) / 1000000

local state = redis.call("HMGET", key, "tokens", "ts")
local tokens = tonumber(state[1])
local ts = tonumber(state[2])
if tokens == nil or ts == nil then
  tokens = capacity
  ts = now
end

local elapsed = now - ts
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * rate)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

redis.call("HSET", key, "tokens", tostring(tokens), "ts", tostring(now))
if expire <= 0 then
  expire = math.ceil(capacity / rate) * 2
end
redis.call("EXPIRE", key, expire)
return allowed
"#;

/// Sliding window. KEYS[1] = window zset, KEYS[2] = entry index hash.
/// ARGV = max count, window seconds, expire seconds, mode, entry token.
/// Members are `<micros>:<seq>` with `|<entry>` appended when an entry token is given.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local index_key = KEYS[2]
local max_count = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local expire = tonumber(ARGV[3])
local mode = tonumber(ARGV[4])
local entry = ARGV[5] or ""

if mode == 3 then
  if entry == "" then
    return 1
  end
  local member = redis.call("HGET", index_key, entry)
  if member then
    redis.call("ZREM", key, member)
    redis.call("HDEL", index_key, entry)
  end
  return 1
end

local function forget(members)
  for _, member in ipairs(members) do
    local sep = string.find(member, "|", 1, true)
    if sep then
      redis.call("HDEL", index_key, string.sub(member, sep + 1))
    end
  end
end

local t = redis.call("TIME")
local now_us = tonumber(t[1]) * 1000000 + tonumber(t[2])
local cutoff = now_us - window * 1000000

local expired = redis.call("ZRANGEBYSCORE", key, "-inf", cutoff)
if #expired > 0 then
  forget(expired)
  redis.call("ZREMRANGEBYSCORE", key, "-inf", cutoff)
end

local count = redis.call("ZCARD", key)
if mode ~= 2 and count >= max_count then
  return 0
end
if mode == 0 then
  return 1
end

local seq = redis.call("HINCRBY", index_key, "__seq", 1)
local member = tostring(now_us) .. ":" .. tostring(seq)
if entry ~= "" then
  member = member .. "|" .. entry
  redis.call("HSET", index_key, entry, member)
end
redis.call("ZADD", key, now_us, member)

local overflow = redis.call("ZCARD", key) - max_count
if overflow > 0 then
  forget(redis.call("ZRANGE", key, 0, overflow - 1))
  redis.call("ZREMRANGEBYRANK", key, 0, overflow - 1)
end

if expire > 0 then
  redis.call("EXPIRE", key, expire)
  redis.call("EXPIRE", index_key, expire)
end
return 1
"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    TokenBucket,
    SlidingWindow,
}

impl ScriptKind {
    pub fn source(self) -> &'static str {
        match self {
            Self::TokenBucket => TOKEN_BUCKET_SCRIPT,
            Self::SlidingWindow => SLIDING_WINDOW_SCRIPT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::SlidingWindow => "sliding_window",
        }
    }

    pub fn from_source(source: &str) -> Option<Self> {
        if source == TOKEN_BUCKET_SCRIPT {
            Some(Self::TokenBucket)
        } else if source == SLIDING_WINDOW_SCRIPT {
            Some(Self::SlidingWindow)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowMode {
    Check = 0,
    CheckAndRecord = 1,
    Record = 2,
    Rollback = 3,
}

impl WindowMode {
    pub fn as_arg(self) -> i64 {
        self as i64
    }

    pub fn from_arg(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Check),
            1 => Some(Self::CheckAndRecord),
            2 => Some(Self::Record),
            3 => Some(Self::Rollback),
            _ => None,
        }
    }
}

/// Token bucket parameters as sent to the script.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: i64,
    pub rate: i64,
    pub requested: i64,
    pub expire_seconds: i64,
}

impl BucketParams {
    /// Burst of exactly `max_count`, refilled at `max_count` per window.
    pub fn per_window(max_count: i64, window_seconds: i64, expire_seconds: i64) -> Self {
        Self {
            capacity: max_count.saturating_mul(window_seconds),
            rate: max_count,
            requested: window_seconds,
            expire_seconds,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowParams {
    pub max_count: i64,
    pub window_seconds: i64,
    pub expire_seconds: i64,
}

/// Minimal surface of a scripting key/value store.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Upload a script and return the handle used by `eval_sha`.
    async fn load_script(&self, source: &str) -> Result<String, StoreError>;

    /// Must return `StoreError::NoScript` when the handle is unknown.
    async fn eval_sha(&self, sha: &str, keys: &[String], args: &[String])
    -> Result<i64, StoreError>;

    async fn eval(&self, source: &str, keys: &[String], args: &[String]) -> Result<i64, StoreError>;
}

#[derive(Default)]
struct LoadedShas {
    token_bucket: Option<String>,
    sliding_window: Option<String>,
}

impl LoadedShas {
    fn get(&self, kind: ScriptKind) -> Option<String> {
        match kind {
            ScriptKind::TokenBucket => self.token_bucket.clone(),
            ScriptKind::SlidingWindow => self.sliding_window.clone(),
        }
    }

    fn set(&mut self, kind: ScriptKind, sha: String) {
        match kind {
            ScriptKind::TokenBucket => self.token_bucket = Some(sha),
            ScriptKind::SlidingWindow => self.sliding_window = Some(sha),
        }
    }
}

/// Runs the two admission scripts with cached handles and a per-call timeout.
pub struct ScriptRuntime {
    store: Arc<dyn ScriptStore>,
    op_timeout: Duration,
    shas: RwLock<LoadedShas>,
}

impl std::fmt::Debug for ScriptRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRuntime")
            .field("op_timeout", &self.op_timeout)
            .finish_non_exhaustive()
    }
}

impl ScriptRuntime {
    pub fn new(store: Arc<dyn ScriptStore>, op_timeout: Duration) -> Self {
        Self {
            store,
            op_timeout,
            shas: RwLock::new(LoadedShas::default()),
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Load both scripts up front. Failures are logged; calls reload lazily.
    pub async fn preload(&self) -> Result<(), StoreError> {
        let mut first_err = None;
        for kind in [ScriptKind::TokenBucket, ScriptKind::SlidingWindow] {
            if let Err(err) = self.load(kind).await {
                warn!(script = kind.name(), error = %err, "failed to preload limiter script");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Token bucket admission. True when the request cost was taken.
    pub async fn allow(&self, key: &str, params: BucketParams) -> Result<bool, StoreError> {
        if params.capacity <= 0 || params.rate <= 0 {
            return Ok(true);
        }
        let keys = vec![key.to_string()];
        let args = vec![
            params.requested.to_string(),
            params.rate.to_string(),
            params.capacity.to_string(),
            params.expire_seconds.to_string(),
        ];
        let code = self.run(ScriptKind::TokenBucket, &keys, &args).await?;
        Ok(code == 1)
    }

    /// Sliding window admission. `entry` names a speculative record for later rollback.
    pub async fn sliding_window(
        &self,
        key: &str,
        params: WindowParams,
        mode: WindowMode,
        entry: Option<&str>,
    ) -> Result<bool, StoreError> {
        if mode != WindowMode::Rollback && (params.max_count <= 0 || params.window_seconds <= 0) {
            return Ok(true);
        }
        let keys = vec![key.to_string(), window_index_key(key)];
        let args = vec![
            params.max_count.to_string(),
            params.window_seconds.to_string(),
            params.expire_seconds.to_string(),
            mode.as_arg().to_string(),
            entry.unwrap_or_default().to_string(),
        ];
        let code = self.run(ScriptKind::SlidingWindow, &keys, &args).await?;
        Ok(code == 1)
    }

    async fn load(&self, kind: ScriptKind) -> Result<String, StoreError> {
        let sha = self
            .with_timeout(self.store.load_script(kind.source()))
            .await?;
        self.shas.write().await.set(kind, sha.clone());
        Ok(sha)
    }

    async fn run(
        &self,
        kind: ScriptKind,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let cached = self.shas.read().await.get(kind);
        if let Some(sha) = cached {
            match self.with_timeout(self.store.eval_sha(&sha, keys, args)).await {
                Err(StoreError::NoScript) => {
                    debug!(script = kind.name(), "script evicted from store, reloading");
                }
                other => return other,
            }
        }

        if let Ok(sha) = self.load(kind).await {
            match self.with_timeout(self.store.eval_sha(&sha, keys, args)).await {
                Err(StoreError::NoScript) => {}
                other => return other,
            }
        }

        self.with_timeout(self.store.eval(kind.source(), keys, args))
            .await
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                timeout_ms: self.op_timeout.as_millis() as u64,
            }),
        }
    }
}

pub fn window_index_key(key: &str) -> String {
    format!("{key}:idx")
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct FlakyStore {
        loads: AtomicUsize,
        eval_sha_calls: AtomicUsize,
        evals: AtomicUsize,
        always_noscript: bool,
        hang: bool,
    }

    #[async_trait]
    impl ScriptStore for FlakyStore {
        async fn load_script(&self, source: &str) -> Result<String, StoreError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(crate::utils::hash::sha256_hex(source.as_bytes()))
        }

        async fn eval_sha(
            &self,
            _sha: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<i64, StoreError> {
            let call = self.eval_sha_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.always_noscript || call == 0 {
                return Err(StoreError::NoScript);
            }
            Ok(1)
        }

        async fn eval(
            &self,
            _source: &str,
            _keys: &[String],
            _args: &[String],
        ) -> Result<i64, StoreError> {
            self.evals.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    fn params() -> WindowParams {
        WindowParams {
            max_count: 1,
            window_seconds: 60,
            expire_seconds: 120,
        }
    }

    #[tokio::test]
    async fn noscript_triggers_one_reload_and_retry() {
        let store = Arc::new(FlakyStore::default());
        let runtime = ScriptRuntime::new(store.clone(), Duration::from_millis(500));
        runtime.preload().await.expect("preload");
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);

        let allowed = runtime
            .sliding_window("k", params(), WindowMode::CheckAndRecord, None)
            .await
            .expect("call");
        assert!(allowed);
        assert_eq!(store.loads.load(Ordering::SeqCst), 3);
        assert_eq!(store.eval_sha_calls.load(Ordering::SeqCst), 2);

        runtime
            .sliding_window("k", params(), WindowMode::Check, None)
            .await
            .expect("call");
        assert_eq!(store.loads.load(Ordering::SeqCst), 3);
        assert_eq!(store.evals.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn persistent_noscript_falls_back_to_inline_eval() {
        let store = Arc::new(FlakyStore {
            always_noscript: true,
            ..Default::default()
        });
        let runtime = ScriptRuntime::new(store.clone(), Duration::from_millis(500));
        runtime.preload().await.expect("preload");

        let allowed = runtime
            .allow("bucket", BucketParams::per_window(5, 60, 120))
            .await
            .expect("call");
        assert!(allowed);
        assert_eq!(store.evals.load(Ordering::SeqCst), 1);
        assert_eq!(store.eval_sha_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_store_surfaces_as_timeout() {
        let store = Arc::new(FlakyStore {
            hang: true,
            ..Default::default()
        });
        let runtime = ScriptRuntime::new(store, Duration::from_millis(50));
        runtime.preload().await.expect("preload");

        let err = runtime
            .sliding_window("k", params(), WindowMode::Check, None)
            .await
            .expect_err("must time out");
        assert_eq!(err, StoreError::Timeout { timeout_ms: 50 });
    }

    #[tokio::test]
    async fn disabled_params_short_circuit_except_rollback() {
        let store = Arc::new(FlakyStore::default());
        let runtime = ScriptRuntime::new(store.clone(), Duration::from_millis(500));
        let off = WindowParams {
            max_count: 0,
            window_seconds: 60,
            expire_seconds: 0,
        };
        assert!(
            runtime
                .sliding_window("k", off, WindowMode::CheckAndRecord, None)
                .await
                .expect("call")
        );
        assert_eq!(store.loads.load(Ordering::SeqCst), 0);

        runtime
            .sliding_window("k", off, WindowMode::Rollback, Some("tok"))
            .await
            .expect("rollback");
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bucket_params_encode_n_per_window() {
        let params = BucketParams::per_window(10, 60, 120);
        assert_eq!(params.capacity, 600);
        assert_eq!(params.rate, 10);
        assert_eq!(params.requested, 60);
        assert_eq!(params.capacity / params.requested, 10);
    }
}
