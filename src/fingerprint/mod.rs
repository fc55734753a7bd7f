//! Request fingerprinting: memoized request-to-routing-decision parsing.

pub mod cache;
pub mod key;
pub(crate) mod multipart;
pub mod parse;

use serde::{Deserialize, Serialize};

pub use cache::FingerprintCache;
pub use key::{CacheKeys, RequestView, WARM_MODEL_PATHS};
pub use parse::parse_request;

/// Appended to model names served through `/v1/responses/compact`.
pub const COMPACT_MODEL_SUFFIX: &str = "-openai-compact";

pub fn with_compact_suffix(model: &str) -> String {
    if model.is_empty() || model.ends_with(COMPACT_MODEL_SUFFIX) {
        return model.to_string();
    }
    format!("{model}{COMPACT_MODEL_SUFFIX}")
}

/// Trimmed model name with any compact suffix removed; the identity used by the warm namespace.
pub fn normalize_warm_model(model: &str) -> &str {
    let model = model.trim();
    model.strip_suffix(COMPACT_MODEL_SUFFIX).unwrap_or(model)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    #[default]
    Unknown,
    ChatCompletions,
    Completions,
    Embeddings,
    Moderations,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranscription,
    AudioTranslation,
    Responses,
    ResponsesCompact,
    Realtime,
    Rerank,
    Gemini,
    MidjourneySubmit,
    MidjourneyTaskFetch,
    MidjourneyTaskFetchByCondition,
    MidjourneyNotify,
    MidjourneyTaskImageSeed,
    SunoSubmit,
    SunoFetch,
    SunoFetchById,
    VideoSubmit,
    VideoFetchById,
}

impl RelayMode {
    /// Relay mode implied by the path alone.
    pub fn from_path(method: &str, path: &str) -> Self {
        if path.contains("/mj/") {
            return Self::midjourney(path);
        }
        if path.contains("/suno/") {
            return Self::suno(method, path);
        }
        if path.contains("/v1/videos") || path.contains("/v1/video/generations") {
            if path.ends_with("/remix") || method.eq_ignore_ascii_case("POST") {
                return Self::VideoSubmit;
            }
            if method.eq_ignore_ascii_case("GET") {
                return Self::VideoFetchById;
            }
            return Self::Unknown;
        }
        if path.starts_with("/v1beta/models/") || path.starts_with("/v1/models/") {
            return Self::Gemini;
        }
        if path.starts_with("/v1/chat/completions") || path.starts_with("/pg/chat/completions") {
            return Self::ChatCompletions;
        }
        if path.starts_with("/v1/completions") {
            return Self::Completions;
        }
        if path.starts_with("/v1/responses/compact") {
            return Self::ResponsesCompact;
        }
        if path.starts_with("/v1/responses") {
            return Self::Responses;
        }
        if path.ends_with("embeddings") {
            return Self::Embeddings;
        }
        if path.starts_with("/v1/moderations") {
            return Self::Moderations;
        }
        if path.starts_with("/v1/images/generations") {
            return Self::ImagesGenerations;
        }
        if path.starts_with("/v1/images/edits") {
            return Self::ImagesEdits;
        }
        if path.starts_with("/v1/audio/transcriptions") {
            return Self::AudioTranscription;
        }
        if path.starts_with("/v1/audio/translations") {
            return Self::AudioTranslation;
        }
        if path.starts_with("/v1/audio") {
            return Self::AudioSpeech;
        }
        if path.starts_with("/v1/realtime") {
            return Self::Realtime;
        }
        if path.starts_with("/v1/rerank") {
            return Self::Rerank;
        }
        Self::Unknown
    }

    fn midjourney(path: &str) -> Self {
        if path.ends_with("/mj/task/list-by-condition") {
            Self::MidjourneyTaskFetchByCondition
        } else if path.contains("/mj/task/") && path.ends_with("/fetch") {
            Self::MidjourneyTaskFetch
        } else if path.contains("/mj/task/") && path.ends_with("/image-seed") {
            Self::MidjourneyTaskImageSeed
        } else if path.ends_with("/mj/notify") {
            Self::MidjourneyNotify
        } else {
            Self::MidjourneySubmit
        }
    }

    fn suno(method: &str, path: &str) -> Self {
        if path.ends_with("/suno/fetch") {
            Self::SunoFetch
        } else if path.contains("/suno/fetch/") && method.eq_ignore_ascii_case("GET") {
            Self::SunoFetchById
        } else {
            Self::SunoSubmit
        }
    }

    /// Status and fetch endpoints are served by the owning channel, not a freshly selected one.
    pub fn skips_channel_selection(self) -> bool {
        matches!(
            self,
            Self::MidjourneyTaskFetch
                | Self::MidjourneyTaskFetchByCondition
                | Self::MidjourneyNotify
                | Self::MidjourneyTaskImageSeed
                | Self::SunoFetch
                | Self::SunoFetchById
                | Self::VideoFetchById
        )
    }
}

/// Parsed routing outcome of one request. Replace-only once cached.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub model: String,
    pub relay_mode: RelayMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Group override carried by the request itself (playground `group`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_group: Option<String>,
    pub should_select_channel: bool,
}
