use std::sync::OnceLock;

use bytes::Bytes;
use serde::Deserialize;

use super::normalize_warm_model;
use crate::config::FingerprintCacheConfig;
use crate::utils::hash::sha256_hex;

/// POST endpoints whose routing outcome depends only on the requested model.
pub const WARM_MODEL_PATHS: [&str; 5] = [
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/responses",
    "/v1/responses/compact",
];

pub fn is_warm_model_path(path: &str) -> bool {
    WARM_MODEL_PATHS.contains(&path)
}

/// Top-level routing fields of a JSON body. Everything else is skipped unparsed.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct JsonRoutingFields {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
}

/// The parts of an inbound request that fingerprinting and parsing look at.
#[derive(Debug)]
pub struct RequestView {
    pub method: String,
    pub path: String,
    pub query: String,
    pub content_type: String,
    pub body: Bytes,
    pub token_scope: Option<String>,
    json: OnceLock<Result<JsonRoutingFields, String>>,
}

impl RequestView {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        query: impl Into<String>,
        content_type: impl Into<String>,
        body: Bytes,
    ) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            query: query.into(),
            content_type: content_type.into(),
            body,
            token_scope: None,
            json: OnceLock::new(),
        }
    }

    /// `|` is the key separator, so it is replaced in the scope.
    pub fn with_token_scope(mut self, scope: impl Into<String>) -> Self {
        let scope = scope.into().replace('|', "_");
        self.token_scope = (!scope.is_empty()).then_some(scope);
        self
    }

    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }

    pub fn is_post(&self) -> bool {
        self.method == "POST"
    }

    /// Lowercased media type without parameters.
    pub fn media_type(&self) -> String {
        normalize_content_type(&self.content_type)
    }

    pub fn is_json(&self) -> bool {
        self.media_type().contains("json")
    }

    pub fn is_multipart(&self) -> bool {
        self.media_type().contains("multipart/form-data")
    }

    pub fn is_form_urlencoded(&self) -> bool {
        self.media_type() == "application/x-www-form-urlencoded"
    }

    /// Routing fields of the JSON body, deserialized at most once per request.
    pub fn json_fields(&self) -> Result<&JsonRoutingFields, String> {
        self.json
            .get_or_init(|| {
                if self.body.iter().all(u8::is_ascii_whitespace) {
                    return Ok(JsonRoutingFields::default());
                }
                serde_json::from_slice(&self.body).map_err(|err| err.to_string())
            })
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        super::multipart::urlencoded_field(self.query.as_bytes(), name)
            .filter(|value| !value.is_empty())
    }
}

pub fn normalize_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Keys under which a request's routing decision may be cached.
/// `scoped` is per token; `warm` is shared by all callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheKeys {
    pub scoped: Option<String>,
    pub warm: Option<String>,
}

impl CacheKeys {
    pub fn derive(view: &RequestView, config: &FingerprintCacheConfig) -> Self {
        if !config.enabled {
            return Self::default();
        }
        let warm = warm_key(view, "", config);
        let scoped = view
            .token_scope
            .as_deref()
            .and_then(|scope| scoped_key(view, scope, config));
        let warm = warm.filter(|warm| scoped.as_ref() != Some(warm));
        Self { scoped, warm }
    }

    pub fn is_cacheable(&self) -> bool {
        self.scoped.is_some()
    }
}

pub fn warm_model_key(method: &str, path: &str, scope: &str, model: &str) -> String {
    format!("t={scope}|m={method}|p={path}|wm={model}")
}

fn warm_key(view: &RequestView, scope: &str, config: &FingerprintCacheConfig) -> Option<String> {
    if !view.is_post() || !is_warm_model_path(&view.path) || !view.is_json() {
        return None;
    }
    if view.body.len() > config.body_max_bytes {
        return None;
    }
    let fields = view.json_fields().ok()?;
    let model = normalize_warm_model(fields.model.as_deref().unwrap_or_default());
    if model.is_empty() {
        return None;
    }
    Some(warm_model_key(&view.method, &view.path, scope, model))
}

fn scoped_key(view: &RequestView, scope: &str, config: &FingerprintCacheConfig) -> Option<String> {
    let method = &view.method;
    let path = &view.path;

    if view.is_get() {
        if view.query.len() > config.max_query_bytes {
            return None;
        }
        return Some(format!(
            "t={scope}|m={method}|p={path}|ql={}|qh={}",
            view.query.len(),
            sha256_hex(view.query.as_bytes())
        ));
    }

    let path_decides = path.contains("/suno/")
        || (path.contains("/v1/videos/") && path.ends_with("/remix"))
        || path.starts_with("/v1beta/models/")
        || path.starts_with("/v1/models/");
    if path_decides {
        return Some(format!("t={scope}|m={method}|p={path}"));
    }

    if let Some(key) = warm_key(view, scope, config) {
        return Some(key);
    }

    if view.is_multipart() || view.body.len() > config.body_max_bytes {
        return None;
    }
    Some(format!(
        "t={scope}|m={method}|p={path}|ct={}|l={}|h={}",
        view.media_type(),
        view.body.len(),
        sha256_hex(&view.body)
    ))
}
