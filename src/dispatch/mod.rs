//! Dispatch decision: channel resolution and rate-limit policy composition.

pub mod channel;
pub mod distributor;
pub mod identity;
pub mod rate_limit;
pub mod static_index;

pub use channel::{AUTO_GROUP, AffinityStore, Channel, ChannelIndex, SelectedChannel};
pub use distributor::{ChannelDispatch, Distributor};
pub use identity::{Identity, TokenRateLimit, matching_model_name};
pub use rate_limit::{
    GLOBAL_API_MARK, check_global_api, compose_policies, global_api_key, ip_policies,
    model_policy,
};
pub use static_index::{MemoryAffinityStore, StaticChannelIndex};
