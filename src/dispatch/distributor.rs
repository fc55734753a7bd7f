use std::sync::Arc;

use tracing::debug;

use super::channel::{AUTO_GROUP, AffinityStore, Channel, ChannelIndex};
use super::identity::Identity;
use crate::error::{AdmissionError, Result};
use crate::fingerprint::RoutingDecision;
use crate::observability::Observability;

/// Where a request is going. `channel` is `None` when the path needs no channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChannelDispatch {
    pub channel: Option<Channel>,
    /// Group the channel was selected under; the resolved sub-group for `auto`.
    pub group: String,
    /// Group requested by the caller; affinity is keyed on it.
    pub requested_group: String,
    pub pinned: bool,
    pub from_affinity: bool,
}

impl ChannelDispatch {
    pub fn channel_id(&self) -> Option<i64> {
        self.channel.as_ref().map(|channel| channel.id)
    }
}

pub struct Distributor {
    index: Arc<dyn ChannelIndex>,
    affinity: Arc<dyn AffinityStore>,
    observability: Arc<Observability>,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor").finish_non_exhaustive()
    }
}

impl Distributor {
    pub fn new(
        index: Arc<dyn ChannelIndex>,
        affinity: Arc<dyn AffinityStore>,
        observability: Arc<Observability>,
    ) -> Self {
        Self {
            index,
            affinity,
            observability,
        }
    }

    pub async fn dispatch(
        &self,
        identity: &Identity,
        decision: &RoutingDecision,
    ) -> Result<ChannelDispatch> {
        let result = self.dispatch_inner(identity, decision).await;
        if result.is_err() {
            self.observability.record_dispatch_rejection();
        }
        result
    }

    async fn dispatch_inner(
        &self,
        identity: &Identity,
        decision: &RoutingDecision,
    ) -> Result<ChannelDispatch> {
        let group = self.requested_group(identity, decision)?;

        if let Some(raw) = identity.pinned_channel.as_deref() {
            let channel = self.pinned_channel(raw).await?;
            return Ok(ChannelDispatch {
                channel: Some(channel),
                group: group.clone(),
                requested_group: group,
                pinned: true,
                from_affinity: false,
            });
        }

        let model = decision.model.as_str();
        if !identity.permits_model(model) {
            return Err(AdmissionError::ModelNotPermitted {
                model: model.to_string(),
            });
        }

        if !decision.should_select_channel {
            return Ok(ChannelDispatch {
                group: group.clone(),
                requested_group: group,
                ..Default::default()
            });
        }

        if model.is_empty() {
            return Err(AdmissionError::invalid_request("model name is required"));
        }

        if let Some(dispatch) = self.from_affinity(identity, model, &group).await {
            return Ok(dispatch);
        }

        let selected = self
            .index
            .select_random_capable_channel(model, &group, &identity.user_group)
            .await
            .map_err(|detail| AdmissionError::NoChannelAvailable {
                model: model.to_string(),
                group: group.clone(),
                detail: Some(detail),
            })?
            .ok_or_else(|| AdmissionError::NoChannelAvailable {
                model: model.to_string(),
                group: group.clone(),
                detail: None,
            })?;
        Ok(ChannelDispatch {
            channel: Some(selected.channel),
            group: selected.group,
            requested_group: group,
            pinned: false,
            from_affinity: false,
        })
    }

    /// Playground requests may name a group; it must be usable by the caller.
    fn requested_group(&self, identity: &Identity, decision: &RoutingDecision) -> Result<String> {
        match decision.token_group.as_deref().filter(|group| !group.is_empty()) {
            Some(group) => {
                if group != identity.user_group
                    && !self.index.group_usable(&identity.user_group, group)
                {
                    return Err(AdmissionError::GroupAccessDenied {
                        group: group.to_string(),
                    });
                }
                Ok(group.to_string())
            }
            None => Ok(identity.using_group().to_string()),
        }
    }

    async fn pinned_channel(&self, raw: &str) -> Result<Channel> {
        let invalid = || AdmissionError::InvalidChannel {
            channel: raw.to_string(),
        };
        let channel_id: i64 = raw.trim().parse().map_err(|_| invalid())?;
        let channel = self
            .index
            .get_channel(channel_id)
            .await
            .ok_or_else(invalid)?;
        if !channel.enabled {
            return Err(AdmissionError::ChannelDisabled { channel_id });
        }
        Ok(channel)
    }

    async fn from_affinity(
        &self,
        identity: &Identity,
        model: &str,
        group: &str,
    ) -> Option<ChannelDispatch> {
        let channel_id = self.affinity.preferred_channel(model, group).await?;
        let selected_group = if group == AUTO_GROUP {
            let mut matched = None;
            for sub_group in self.index.auto_groups(&identity.user_group) {
                if self
                    .index
                    .is_channel_capable(&sub_group, model, channel_id)
                    .await
                {
                    matched = Some(sub_group);
                    break;
                }
            }
            matched?
        } else {
            if !self.index.is_channel_capable(group, model, channel_id).await {
                debug!(model, group, channel_id, "preferred channel no longer capable");
                return None;
            }
            group.to_string()
        };

        let channel = self.index.get_channel(channel_id).await?;
        self.affinity.mark_used(&selected_group, channel_id).await;
        Some(ChannelDispatch {
            channel: Some(channel),
            group: selected_group,
            requested_group: group.to_string(),
            pinned: false,
            from_affinity: true,
        })
    }

    /// Remember the channel for `(model, group)` once the response is known to be good.
    pub async fn record_outcome(&self, model: &str, dispatch: &ChannelDispatch, status: u16) {
        if status >= 400 {
            return;
        }
        if let Some(channel_id) = dispatch.channel_id() {
            self.affinity
                .record_success(model, &dispatch.requested_group, channel_id)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::dispatch::static_index::{MemoryAffinityStore, StaticChannelIndex};
    use crate::fingerprint::RelayMode;

    fn channel(id: i64, groups: &[&str], enabled: bool) -> Channel {
        Channel {
            id,
            name: format!("ch-{id}"),
            enabled,
            weight: 1,
            priority: 0,
            groups: groups.iter().map(|g| g.to_string()).collect(),
            models: vec!["gpt-4o".to_string()],
        }
    }

    fn chat(model: &str) -> RoutingDecision {
        RoutingDecision {
            model: model.to_string(),
            relay_mode: RelayMode::ChatCompletions,
            should_select_channel: true,
            ..Default::default()
        }
    }

    fn caller() -> Identity {
        Identity {
            token_id: 1,
            user_id: 1,
            user_group: "default".to_string(),
            ..Default::default()
        }
    }

    fn distributor(index: StaticChannelIndex) -> (Arc<MemoryAffinityStore>, Distributor) {
        let affinity = Arc::new(MemoryAffinityStore::new());
        let distributor = Distributor::new(
            Arc::new(index),
            affinity.clone(),
            Arc::new(Observability::default()),
        );
        (affinity, distributor)
    }

    #[tokio::test]
    async fn disabled_pinned_channel_is_rejected_even_with_alternatives() {
        let (_, distributor) = distributor(StaticChannelIndex::new(vec![
            channel(7, &["default"], false),
            channel(8, &["default"], true),
        ]));
        let mut identity = caller();
        identity.pinned_channel = Some("7".to_string());
        let err = distributor
            .dispatch(&identity, &chat("gpt-4o"))
            .await
            .expect_err("disabled");
        assert!(matches!(err, AdmissionError::ChannelDisabled { channel_id: 7 }));

        identity.pinned_channel = Some("seven".to_string());
        let err = distributor
            .dispatch(&identity, &chat("gpt-4o"))
            .await
            .expect_err("not a number");
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn model_allow_list_is_enforced_before_lookup() {
        let (_, distributor) = distributor(StaticChannelIndex::new(vec![channel(
            1,
            &["default"],
            true,
        )]));
        let mut identity = caller();
        identity.model_limits = Some(BTreeSet::from(["gpt-4o-mini".to_string()]));
        let err = distributor
            .dispatch(&identity, &chat("gpt-4o"))
            .await
            .expect_err("not permitted");
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn missing_model_and_missing_channel_are_distinct() {
        let (_, distributor) = distributor(StaticChannelIndex::default());
        let err = distributor
            .dispatch(&caller(), &chat(""))
            .await
            .expect_err("no model");
        assert_eq!(err.status_code(), 400);
        let err = distributor
            .dispatch(&caller(), &chat("gpt-4o"))
            .await
            .expect_err("no channel");
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn affinity_is_used_only_after_success() {
        let (affinity, distributor) = distributor(StaticChannelIndex::new(vec![
            channel(1, &["default"], true),
            channel(2, &["default"], true),
        ]));
        let first = distributor
            .dispatch(&caller(), &chat("gpt-4o"))
            .await
            .expect("dispatch");
        assert!(!first.from_affinity);

        distributor.record_outcome("gpt-4o", &first, 502).await;
        assert_eq!(affinity.preferred_channel("gpt-4o", "default").await, None);

        distributor.record_outcome("gpt-4o", &first, 200).await;
        let second = distributor
            .dispatch(&caller(), &chat("gpt-4o"))
            .await
            .expect("dispatch");
        assert!(second.from_affinity);
        assert_eq!(second.channel_id(), first.channel_id());
    }

    #[tokio::test]
    async fn pinned_success_updates_affinity() {
        let (affinity, distributor) = distributor(StaticChannelIndex::new(vec![
            channel(1, &["default"], true),
            channel(2, &["default"], true),
        ]));
        let mut identity = caller();
        identity.pinned_channel = Some("2".to_string());
        let pinned = distributor
            .dispatch(&identity, &chat("gpt-4o"))
            .await
            .expect("dispatch");
        assert!(pinned.pinned);

        distributor.record_outcome("gpt-4o", &pinned, 429).await;
        assert_eq!(affinity.preferred_channel("gpt-4o", "default").await, None);

        distributor.record_outcome("gpt-4o", &pinned, 200).await;
        assert_eq!(
            affinity.preferred_channel("gpt-4o", "default").await,
            Some(2)
        );
        let next = distributor
            .dispatch(&caller(), &chat("gpt-4o"))
            .await
            .expect("dispatch");
        assert!(next.from_affinity);
        assert_eq!(next.channel_id(), Some(2));
    }

    #[tokio::test]
    async fn auto_affinity_resolves_the_sub_group() {
        let index = StaticChannelIndex::new(vec![channel(3, &["cheap"], true)])
            .with_auto_groups(["premium", "cheap"])
            .with_usable_groups("default", ["premium", "cheap"]);
        let (affinity, distributor) = distributor(index);
        affinity.record_success("gpt-4o", AUTO_GROUP, 3).await;

        let mut identity = caller();
        identity.token_group = AUTO_GROUP.to_string();
        let dispatch = distributor
            .dispatch(&identity, &chat("gpt-4o"))
            .await
            .expect("dispatch");
        assert!(dispatch.from_affinity);
        assert_eq!(dispatch.group, "cheap");
        assert_eq!(dispatch.requested_group, AUTO_GROUP);
        assert_eq!(affinity.use_count("cheap", 3), 1);
    }

    #[tokio::test]
    async fn playground_group_must_be_usable() {
        let (_, distributor) = distributor(StaticChannelIndex::new(vec![channel(
            1,
            &["vip"],
            true,
        )]));
        let mut decision = chat("gpt-4o");
        decision.token_group = Some("vip".to_string());
        let err = distributor
            .dispatch(&caller(), &decision)
            .await
            .expect_err("vip not usable");
        assert!(matches!(err, AdmissionError::GroupAccessDenied { .. }));
    }

    #[tokio::test]
    async fn allow_list_applies_to_fetch_paths_but_not_pinned_channels() {
        let (_, distributor) = distributor(StaticChannelIndex::new(vec![channel(
            1,
            &["default"],
            true,
        )]));
        let mut identity = caller();
        identity.model_limits = Some(BTreeSet::from(["gpt-4o".to_string()]));
        let fetch = RoutingDecision {
            model: "suno_fetch".to_string(),
            should_select_channel: false,
            ..Default::default()
        };
        let err = distributor
            .dispatch(&identity, &fetch)
            .await
            .expect_err("fetch model not permitted");
        assert!(matches!(err, AdmissionError::ModelNotPermitted { .. }));

        identity.pinned_channel = Some("1".to_string());
        let dispatch = distributor
            .dispatch(&identity, &chat("gpt-4o-mini"))
            .await
            .expect("pinned bypasses the allow-list");
        assert_eq!(dispatch.channel_id(), Some(1));
    }

    #[tokio::test]
    async fn fetch_paths_skip_selection() {
        let (_, distributor) = distributor(StaticChannelIndex::default());
        let decision = RoutingDecision {
            should_select_channel: false,
            ..Default::default()
        };
        let dispatch = distributor
            .dispatch(&caller(), &decision)
            .await
            .expect("no channel needed");
        assert_eq!(dispatch.channel, None);
    }
}
