use thiserror::Error;

/// Failures talking to the shared key/value store.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("script not loaded on store")]
    NoScript,
    #[error("store call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("unexpected store response: {0}")]
    Response(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
    #[error("invalid channel id: {channel}")]
    InvalidChannel { channel: String },
    #[error("channel {channel_id} is disabled")]
    ChannelDisabled { channel_id: i64 },
    #[error("model {model} is not permitted for this token")]
    ModelNotPermitted { model: String },
    #[error("access to group {group} denied")]
    GroupAccessDenied { group: String },
    #[error("no available channel for model {model} under group {group}")]
    NoChannelAvailable {
        model: String,
        group: String,
        detail: Option<String>,
    },
    #[error("rate limit exceeded: {reason}")]
    RateLimited { reason: String },
    #[error("rate limit check failed: {0}")]
    Store(#[from] StoreError),
    #[error("request cancelled during admission")]
    Cancelled,
}

impl AdmissionError {
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } | Self::InvalidChannel { .. } => 400,
            Self::ChannelDisabled { .. }
            | Self::ModelNotPermitted { .. }
            | Self::GroupAccessDenied { .. } => 403,
            Self::NoChannelAvailable { .. } => 503,
            Self::RateLimited { .. } => 429,
            Self::Store(_) => 500,
            Self::Cancelled => 499,
        }
    }
}

pub type Result<T> = std::result::Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_boundary_status_codes() {
        assert_eq!(AdmissionError::invalid_request("bad json").status_code(), 400);
        assert_eq!(
            AdmissionError::ChannelDisabled { channel_id: 7 }.status_code(),
            403
        );
        assert_eq!(
            AdmissionError::RateLimited {
                reason: "x".to_string()
            }
            .status_code(),
            429
        );
        assert_eq!(
            AdmissionError::from(StoreError::Timeout { timeout_ms: 500 }).status_code(),
            500
        );
        assert_eq!(
            AdmissionError::NoChannelAvailable {
                model: "m".to_string(),
                group: "default".to_string(),
                detail: None,
            }
            .status_code(),
            503
        );
    }
}
