use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::env::Env;
use crate::limiter::GroupRateLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config toml: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub fingerprint: FingerprintCacheConfig,
    pub rate_limit: RateLimitSettings,
    pub redis: RedisConfig,
}

impl AdmissionConfig {
    pub fn from_env(env: &Env) -> Self {
        Self::default().with_env(env)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_toml(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Overlay environment keys; values already in `self` act as the defaults.
    pub fn with_env(mut self, env: &Env) -> Self {
        self.fingerprint = self.fingerprint.with_env(env);
        self.rate_limit = self.rate_limit.with_env(env);
        self.redis = self.redis.with_env(env);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.fingerprint.warm_ttl_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "fingerprint.warm_ttl_multiplier must be >= 1".to_string(),
            ));
        }
        if self.rate_limit.shard_count == 0 {
            return Err(ConfigError::Invalid(
                "rate_limit.shard_count must be >= 1".to_string(),
            ));
        }
        self.rate_limit
            .model
            .groups
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("rate_limit.model.groups: {err}")))?;
        self.rate_limit
            .ip
            .groups
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("rate_limit.ip.groups: {err}")))?;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintCacheConfig {
    pub enabled: bool,
    pub ttl_seconds: u64,
    pub body_max_bytes: usize,
    pub max_query_bytes: usize,
    pub max_entries: usize,
    pub cleanup_interval_seconds: u64,
    pub warm_models: Vec<String>,
    pub warm_ttl_multiplier: u32,
}

impl Default for FingerprintCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_seconds: 8,
            body_max_bytes: 1 << 20,
            max_query_bytes: 2048,
            max_entries: 20_000,
            cleanup_interval_seconds: 15,
            warm_models: vec![
                "gpt-4o".to_string(),
                "gpt-4o-mini".to_string(),
                "gemini-2.0-flash".to_string(),
            ],
            warm_ttl_multiplier: 3,
        }
    }
}

impl FingerprintCacheConfig {
    pub fn with_env(self, env: &Env) -> Self {
        let warm_models = match env.get("ROUTING_PARSE_CACHE_WARMUP_MODELS") {
            Some(raw) => split_list(&raw),
            None => self.warm_models,
        };
        Self {
            enabled: env.bool_or("ROUTING_PARSE_CACHE_ENABLED", self.enabled),
            ttl_seconds: env.positive_or("ROUTING_PARSE_CACHE_TTL_SECONDS", self.ttl_seconds as i64)
                as u64,
            body_max_bytes: env.positive_or(
                "ROUTING_PARSE_CACHE_BODY_MAX_BYTES",
                self.body_max_bytes as i64,
            ) as usize,
            max_query_bytes: env.positive_or(
                "ROUTING_PARSE_CACHE_MAX_QUERY_BYTES",
                self.max_query_bytes as i64,
            ) as usize,
            max_entries: env.positive_or("ROUTING_PARSE_CACHE_MAX_ENTRIES", self.max_entries as i64)
                as usize,
            cleanup_interval_seconds: env.positive_or(
                "ROUTING_PARSE_CACHE_CLEANUP_INTERVAL_SECONDS",
                self.cleanup_interval_seconds as i64,
            ) as u64,
            warm_models,
            warm_ttl_multiplier: self.warm_ttl_multiplier,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.max(1))
    }

    pub fn warm_ttl(&self) -> Duration {
        self.ttl() * self.warm_ttl_multiplier.max(1)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRateLimitConfig {
    pub enabled: bool,
    pub duration_minutes: u64,
    pub total_count: i64,
    pub success_count: i64,
    pub groups: GroupRateLimits,
}

impl Default for ModelRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_minutes: 1,
            total_count: 0,
            success_count: 1000,
            groups: GroupRateLimits::default(),
        }
    }
}

/// Per-IP extensions applied on top of the model policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpRateLimitConfig {
    pub enabled: bool,
    pub duration_minutes: u64,
    pub user_count: i64,
    pub user_success_count: i64,
    pub groups: GroupRateLimits,
}

impl Default for IpRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_minutes: 1,
            user_count: 0,
            user_success_count: 0,
            groups: GroupRateLimits::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalApiRateLimitConfig {
    pub enabled: bool,
    pub max_requests: i64,
    pub duration_seconds: u64,
}

impl Default for GlobalApiRateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 180,
            duration_seconds: 180,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub model: ModelRateLimitConfig,
    pub ip: IpRateLimitConfig,
    pub global_api: GlobalApiRateLimitConfig,
    pub shard_count: u32,
    pub store_op_timeout_ms: u64,
    pub key_expiration_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            model: ModelRateLimitConfig::default(),
            ip: IpRateLimitConfig::default(),
            global_api: GlobalApiRateLimitConfig::default(),
            shard_count: 1,
            store_op_timeout_ms: 500,
            key_expiration_seconds: 180,
        }
    }
}

impl RateLimitSettings {
    pub fn with_env(self, env: &Env) -> Self {
        let model = ModelRateLimitConfig {
            enabled: env.bool_or("MODEL_REQUEST_RATE_LIMIT_ENABLED", self.model.enabled),
            duration_minutes: env.positive_or(
                "MODEL_REQUEST_RATE_LIMIT_DURATION_MINUTES",
                self.model.duration_minutes as i64,
            ) as u64,
            total_count: env.parse_or("MODEL_REQUEST_RATE_LIMIT_COUNT", self.model.total_count),
            success_count: env.parse_or(
                "MODEL_REQUEST_RATE_LIMIT_SUCCESS_COUNT",
                self.model.success_count,
            ),
            groups: group_table_from_env(env, "MODEL_REQUEST_RATE_LIMIT_GROUP", self.model.groups),
        };
        let ip = IpRateLimitConfig {
            enabled: env.bool_or("MODEL_REQUEST_IP_RATE_LIMIT_ENABLED", self.ip.enabled),
            duration_minutes: env.positive_or(
                "MODEL_REQUEST_IP_RATE_LIMIT_DURATION_MINUTES",
                self.ip.duration_minutes as i64,
            ) as u64,
            user_count: env.parse_or("MODEL_REQUEST_IP_RATE_LIMIT_USER_COUNT", self.ip.user_count),
            user_success_count: env.parse_or(
                "MODEL_REQUEST_IP_RATE_LIMIT_USER_SUCCESS_COUNT",
                self.ip.user_success_count,
            ),
            groups: group_table_from_env(env, "MODEL_REQUEST_IP_RATE_LIMIT_GROUP", self.ip.groups),
        };
        let global_api = GlobalApiRateLimitConfig {
            enabled: env.bool_or("GLOBAL_API_RATE_LIMIT_ENABLE", self.global_api.enabled),
            max_requests: env.parse_or("GLOBAL_API_RATE_LIMIT", self.global_api.max_requests),
            duration_seconds: env.positive_or(
                "GLOBAL_API_RATE_LIMIT_DURATION",
                self.global_api.duration_seconds as i64,
            ) as u64,
        };
        Self {
            model,
            ip,
            global_api,
            shard_count: env.positive_or("RATE_LIMIT_KEY_SHARD_COUNT", i64::from(self.shard_count))
                .min(i64::from(u32::MAX)) as u32,
            store_op_timeout_ms: env
                .duration_ms_or("RATE_LIMIT_REDIS_OP_TIMEOUT_MS", self.store_op_timeout_ms)
                .as_millis() as u64,
            key_expiration_seconds: env.positive_or(
                "RATE_LIMIT_KEY_EXPIRATION_SECONDS",
                self.key_expiration_seconds as i64,
            ) as u64,
        }
    }

    pub fn store_op_timeout(&self) -> Duration {
        Duration::from_millis(self.store_op_timeout_ms.max(1))
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: Option<String>,
    pub max_in_flight: usize,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_in_flight: 10,
            key_prefix: String::new(),
        }
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_in_flight", &self.max_in_flight)
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisConfig {
    pub fn with_env(self, env: &Env) -> Self {
        Self {
            url: env.get("REDIS_CONN_STRING").or(self.url),
            max_in_flight: env.positive_or("REDIS_MAX_IN_FLIGHT", self.max_in_flight as i64)
                as usize,
            key_prefix: env.get_or("REDIS_KEY_PREFIX", &self.key_prefix),
        }
    }

    pub fn enabled(&self) -> bool {
        self.url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
    }
}

fn group_table_from_env(env: &Env, key: &str, fallback: GroupRateLimits) -> GroupRateLimits {
    let Some(raw) = env.get(key) else {
        return fallback;
    };
    match GroupRateLimits::parse_validated(&raw) {
        Ok(table) => table,
        Err(err) => {
            warn!(key, %err, "invalid group rate limit table, keeping previous value");
            fallback
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
