use super::key::RequestView;
use super::multipart::{multipart_field, urlencoded_field};
use super::{RelayMode, RoutingDecision, with_compact_suffix};
use crate::error::{AdmissionError, Result};

const DEFAULT_MODERATION_MODEL: &str = "text-moderation-stable";
const DEFAULT_IMAGE_MODEL: &str = "dall-e";
const DEFAULT_SPEECH_MODEL: &str = "tts-1";
const DEFAULT_WHISPER_MODEL: &str = "whisper-1";

/// Full parse of a request into a routing decision. Runs only on fingerprint misses.
pub fn parse_request(view: &RequestView) -> Result<RoutingDecision> {
    let path = view.path.as_str();
    let relay_mode = RelayMode::from_path(&view.method, path);
    let mut decision = RoutingDecision {
        relay_mode,
        should_select_channel: !relay_mode.skips_channel_selection(),
        ..Default::default()
    };

    if path.contains("/mj/") {
        if decision.should_select_channel {
            let action = path.rsplit('/').next().unwrap_or_default();
            if action.is_empty() {
                return Err(AdmissionError::invalid_request(
                    "unable to determine midjourney action",
                ));
            }
            json_model(view, "invalid midjourney request")?;
            decision.model = format!("mj_{}", action.to_ascii_lowercase());
        }
    } else if path.contains("/suno/") {
        decision.platform = Some("suno".to_string());
        if decision.should_select_channel {
            let action = path.rsplit('/').next().unwrap_or_default();
            decision.model = format!("suno_{}", action.to_ascii_lowercase());
        }
    } else if path.contains("/v1/videos/") && path.ends_with("/remix") {
        decision.should_select_channel = false;
    } else if path.contains("/v1/videos") || path.contains("/v1/video/generations") {
        if view.is_post() {
            decision.model = body_model(view)?.unwrap_or_default();
        } else if view.is_get() {
            decision.should_select_channel = false;
        }
    } else if path.starts_with("/v1beta/models/") || path.starts_with("/v1/models/") {
        decision.model = model_from_path(path).unwrap_or_default().to_string();
    } else if !path.starts_with("/v1/audio/transcriptions") && !view.is_multipart() {
        decision.model = json_model(view, "invalid request")?;
    }

    if path.starts_with("/v1/realtime") {
        decision.model = view.query_param("model").unwrap_or_default();
    }
    if path.starts_with("/v1/moderations") && decision.model.is_empty() {
        decision.model = DEFAULT_MODERATION_MODEL.to_string();
    }
    if path.starts_with("/v1/images/generations") && decision.model.is_empty() {
        decision.model = DEFAULT_IMAGE_MODEL.to_string();
    } else if path.starts_with("/v1/images/edits")
        && (view.is_multipart() || view.is_form_urlencoded())
    {
        if let Ok(Some(model)) = body_model(view) {
            decision.model = model;
        }
    }

    if path.starts_with("/v1/audio") {
        if path.starts_with("/v1/audio/speech") {
            fill_default(&mut decision.model, DEFAULT_SPEECH_MODEL);
        } else if path.starts_with("/v1/audio/translations")
            || path.starts_with("/v1/audio/transcriptions")
        {
            if let Ok(Some(model)) = body_model(view) {
                decision.model = model;
            }
            fill_default(&mut decision.model, DEFAULT_WHISPER_MODEL);
        }
    }

    if path.starts_with("/pg/chat/completions") {
        let fields = view
            .json_fields()
            .map_err(|err| AdmissionError::invalid_request(format!("invalid playground request: {err}")))?;
        decision.model = fields.model.clone().unwrap_or_default();
        decision.token_group = Some(fields.group.clone().unwrap_or_default());
    }

    if path.starts_with("/v1/responses/compact") && !decision.model.is_empty() {
        decision.model = with_compact_suffix(&decision.model);
    }

    Ok(decision)
}

fn fill_default(model: &mut String, default: &str) {
    if model.is_empty() {
        *model = default.to_string();
    }
}

fn json_model(view: &RequestView, context: &str) -> Result<String> {
    let fields = view
        .json_fields()
        .map_err(|err| AdmissionError::invalid_request(format!("{context}: {err}")))?;
    Ok(fields.model.clone().unwrap_or_default())
}

/// `model` from whatever body encoding the request uses.
fn body_model(view: &RequestView) -> Result<Option<String>> {
    if view.is_multipart() {
        return multipart_field(&view.content_type, &view.body, "model")
            .map(|model| model.filter(|model| !model.is_empty()))
            .map_err(|err| AdmissionError::invalid_request(format!("invalid form body: {err}")));
    }
    if view.is_form_urlencoded() {
        return Ok(urlencoded_field(&view.body, "model").filter(|model| !model.is_empty()));
    }
    json_model(view, "invalid request").map(|model| (!model.is_empty()).then_some(model))
}

/// `/v1beta/models/{model}:{action}` and `/v1/models/{model}`.
pub fn model_from_path(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/models/")?;
    let model = rest.split_once(':').map_or(rest, |(model, _)| model);
    (!model.is_empty()).then_some(model)
}
