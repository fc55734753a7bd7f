use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::channel::{AUTO_GROUP, AffinityStore, Channel, ChannelIndex, SelectedChannel};
use crate::utils::hash::{hash64_fnv1a, random_token};

/// Channel table loaded from config. Stands in for a database-backed index.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticChannelIndex {
    pub channels: Vec<Channel>,
    /// Auto sub-groups in priority order.
    pub auto_groups: Vec<String>,
    /// Extra groups each user group may route through.
    pub usable_groups: BTreeMap<String, Vec<String>>,
}

impl StaticChannelIndex {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self {
            channels,
            ..Default::default()
        }
    }

    pub fn with_auto_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.auto_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_usable_groups(
        mut self,
        user_group: impl Into<String>,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.usable_groups.insert(
            user_group.into(),
            groups.into_iter().map(Into::into).collect(),
        );
        self
    }

    fn select_in_group(&self, model: &str, group: &str, seed: &str) -> Option<Channel> {
        let capable: Vec<&Channel> = self
            .channels
            .iter()
            .filter(|channel| channel.serves(group, model))
            .collect();
        let top = capable.iter().map(|channel| channel.priority).max()?;
        let candidates: Vec<&Channel> = capable
            .into_iter()
            .filter(|channel| channel.priority == top)
            .collect();
        select_weighted(&candidates, seed).cloned()
    }
}

/// Weighted pick keyed by `seed`. Zero-weight channels only win when nothing else is left.
fn select_weighted<'a>(candidates: &[&'a Channel], seed: &str) -> Option<&'a Channel> {
    let total_weight: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total_weight == 0 {
        return candidates.first().copied();
    }
    let mut pick = hash64_fnv1a(seed.as_bytes()) % total_weight;
    for channel in candidates {
        let weight = u64::from(channel.weight);
        if pick < weight {
            return Some(channel);
        }
        pick -= weight;
    }
    candidates.last().copied()
}

#[async_trait]
impl ChannelIndex for StaticChannelIndex {
    async fn get_channel(&self, channel_id: i64) -> Option<Channel> {
        self.channels
            .iter()
            .find(|channel| channel.id == channel_id)
            .cloned()
    }

    async fn select_random_capable_channel(
        &self,
        model: &str,
        group: &str,
        user_group: &str,
    ) -> Result<Option<SelectedChannel>, String> {
        let seed = random_token();
        if group != AUTO_GROUP {
            return Ok(self
                .select_in_group(model, group, &seed)
                .map(|channel| SelectedChannel {
                    channel,
                    group: group.to_string(),
                }));
        }
        for sub_group in self.auto_groups(user_group) {
            if let Some(channel) = self.select_in_group(model, &sub_group, &seed) {
                return Ok(Some(SelectedChannel {
                    channel,
                    group: sub_group,
                }));
            }
        }
        Ok(None)
    }

    async fn is_channel_capable(&self, group: &str, model: &str, channel_id: i64) -> bool {
        self.channels
            .iter()
            .any(|channel| channel.id == channel_id && channel.serves(group, model))
    }

    fn auto_groups(&self, user_group: &str) -> Vec<String> {
        self.auto_groups
            .iter()
            .filter(|group| group.as_str() == user_group || self.group_usable(user_group, group))
            .cloned()
            .collect()
    }

    fn group_usable(&self, user_group: &str, group: &str) -> bool {
        group == user_group
            || self
                .usable_groups
                .get(user_group)
                .is_some_and(|groups| groups.iter().any(|g| g == group))
    }
}

/// Process-local affinity table keyed by `(model, group)`.
#[derive(Debug, Default)]
pub struct MemoryAffinityStore {
    preferred: DashMap<(String, String), i64>,
    used: DashMap<(String, i64), u64>,
}

impl MemoryAffinityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_count(&self, group: &str, channel_id: i64) -> u64 {
        self.used
            .get(&(group.to_string(), channel_id))
            .map(|count| *count)
            .unwrap_or(0)
    }
}

#[async_trait]
impl AffinityStore for MemoryAffinityStore {
    async fn preferred_channel(&self, model: &str, group: &str) -> Option<i64> {
        self.preferred
            .get(&(model.to_string(), group.to_string()))
            .map(|id| *id)
    }

    async fn mark_used(&self, group: &str, channel_id: i64) {
        *self.used.entry((group.to_string(), channel_id)).or_insert(0) += 1;
    }

    async fn record_success(&self, model: &str, group: &str, channel_id: i64) {
        self.preferred
            .insert((model.to_string(), group.to_string()), channel_id);
    }
}
