use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{error, info};

use crate::error::AdmissionError;

#[derive(Debug, Serialize)]
pub struct OpenAiErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct OpenAiErrorResponse {
    pub error: OpenAiErrorDetail,
}

fn openai_error(
    status: StatusCode,
    kind: &'static str,
    code: Option<&'static str>,
    message: impl std::fmt::Display,
) -> (StatusCode, Json<OpenAiErrorResponse>) {
    (
        status,
        Json(OpenAiErrorResponse {
            error: OpenAiErrorDetail {
                message: message.to_string(),
                kind,
                code,
            },
        }),
    )
}

pub fn map_admission_error(err: &AdmissionError) -> (StatusCode, Json<OpenAiErrorResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match err {
        AdmissionError::InvalidRequest { .. } => {
            openai_error(status, "invalid_request_error", Some("invalid_request"), err)
        }
        AdmissionError::InvalidChannel { .. } => {
            openai_error(status, "invalid_request_error", Some("invalid_channel"), err)
        }
        AdmissionError::ChannelDisabled { .. } => {
            openai_error(status, "permission_error", Some("channel_disabled"), err)
        }
        AdmissionError::ModelNotPermitted { .. } => {
            openai_error(status, "permission_error", Some("model_not_permitted"), err)
        }
        AdmissionError::GroupAccessDenied { .. } => {
            openai_error(status, "permission_error", Some("group_access_denied"), err)
        }
        AdmissionError::NoChannelAvailable { .. } => {
            openai_error(status, "api_error", Some("no_available_channel"), err)
        }
        AdmissionError::RateLimited { .. } => {
            openai_error(status, "rate_limit_error", Some("rate_limited"), err)
        }
        AdmissionError::Store(_) => {
            openai_error(status, "api_error", Some("rate_limit_check_failed"), err)
        }
        AdmissionError::Cancelled => {
            openai_error(status, "api_error", Some("client_closed_request"), err)
        }
    }
}

/// The single place a rejection is logged.
pub fn reject(err: AdmissionError, path: &str) -> Response {
    match &err {
        AdmissionError::Store(store_err) => {
            error!(path, error = %store_err, "admission failed on store error");
        }
        AdmissionError::NoChannelAvailable { detail, .. } => {
            info!(path, error = %err, detail = detail.as_deref().unwrap_or(""), "request rejected");
        }
        _ => info!(path, status = err.status_code(), error = %err, "request rejected"),
    }
    map_admission_error(&err).into_response()
}
