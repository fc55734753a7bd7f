use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Group name that fans out to the caller's auto sub-groups.
pub const AUTO_GROUP: &str = "auto";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

impl Channel {
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.enabled
            && self.groups.iter().any(|g| g == group)
            && self.models.iter().any(|m| m == model)
    }
}

/// A channel picked for a request, with the group it was picked under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedChannel {
    pub channel: Channel,
    pub group: String,
}

/// Upstream channel capability index.
#[async_trait]
pub trait ChannelIndex: Send + Sync {
    async fn get_channel(&self, channel_id: i64) -> Option<Channel>;

    /// Weighted-random capable channel. For the auto group, sub-groups of `user_group`
    /// are tried in priority order and the returned group is the one that matched.
    async fn select_random_capable_channel(
        &self,
        model: &str,
        group: &str,
        user_group: &str,
    ) -> Result<Option<SelectedChannel>, String>;

    async fn is_channel_capable(&self, group: &str, model: &str, channel_id: i64) -> bool;

    /// Auto sub-groups available to `user_group`, highest priority first.
    fn auto_groups(&self, user_group: &str) -> Vec<String>;

    fn group_usable(&self, user_group: &str, group: &str) -> bool;
}

/// Sticky (model, group) to channel preference.
#[async_trait]
pub trait AffinityStore: Send + Sync {
    async fn preferred_channel(&self, model: &str, group: &str) -> Option<i64>;

    async fn mark_used(&self, group: &str, channel_id: i64);

    async fn record_success(&self, model: &str, group: &str, channel_id: i64);
}
