use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::fingerprint::normalize_warm_model;

/// Per-token rate-limit override. Zero values mean "no opinion".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenRateLimit {
    pub enabled: bool,
    pub duration_minutes: u64,
    pub total_count: i64,
    pub success_count: i64,
}

/// Authenticated caller, as placed on the request by the auth layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub token_id: i64,
    pub user_id: i64,
    pub user_group: String,
    pub token_group: String,
    pub rate_limit: TokenRateLimit,
    /// `Some` restricts the token to these models; an empty set allows nothing.
    pub model_limits: Option<BTreeSet<String>>,
    /// Raw pinned channel id, validated at dispatch time.
    pub pinned_channel: Option<String>,
}

impl Identity {
    /// Group requests are routed under: the token group when set, else the user group.
    pub fn using_group(&self) -> &str {
        if self.token_group.is_empty() {
            &self.user_group
        } else {
            &self.token_group
        }
    }

    /// Rate-limit identifier: the token, or the user for token-less sessions.
    pub fn limiter_id(&self) -> String {
        if self.token_id != 0 {
            self.token_id.to_string()
        } else {
            self.user_id.to_string()
        }
    }

    /// Fingerprint scope; token-less callers share no scoped entries.
    pub fn cache_scope(&self) -> Option<String> {
        (self.token_id != 0).then(|| self.token_id.to_string())
    }

    pub fn permits_model(&self, model: &str) -> bool {
        match &self.model_limits {
            None => true,
            Some(allowed) => allowed.contains(&matching_model_name(model)),
        }
    }
}

/// Name used to match a model against allow-lists. Families with per-instance suffixes
/// collapse to a `*` pattern.
pub fn matching_model_name(model: &str) -> String {
    let model = normalize_warm_model(model);
    for family in ["gpt-4-gizmo", "gpt-4o-gizmo"] {
        if model.starts_with(family) {
            return format!("{family}-*");
        }
    }
    if let Some((base, _)) = model.split_once("-thinking-") {
        return format!("{base}-thinking");
    }
    model.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn using_group_prefers_token_group() {
        let mut identity = Identity {
            user_group: "default".to_string(),
            ..Default::default()
        };
        assert_eq!(identity.using_group(), "default");
        identity.token_group = "vip".to_string();
        assert_eq!(identity.using_group(), "vip");
    }

    #[test]
    fn limiter_id_falls_back_to_user() {
        let identity = Identity {
            user_id: 9,
            ..Default::default()
        };
        assert_eq!(identity.limiter_id(), "9");
        assert_eq!(identity.cache_scope(), None);
    }

    #[test]
    fn model_allow_list_matches_families() {
        let identity = Identity {
            model_limits: Some(BTreeSet::from([
                "gpt-4o".to_string(),
                "gpt-4-gizmo-*".to_string(),
            ])),
            ..Default::default()
        };
        assert!(identity.permits_model("gpt-4o"));
        assert!(identity.permits_model("gpt-4-gizmo-g-abc"));
        assert!(!identity.permits_model("gpt-4o-mini"));

        let locked = Identity {
            model_limits: Some(BTreeSet::new()),
            ..Default::default()
        };
        assert!(!locked.permits_model("gpt-4o"));
        assert!(Identity::default().permits_model("anything"));
    }
}
