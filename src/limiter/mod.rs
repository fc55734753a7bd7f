//! Atomic admission scripts and the distributed rate limiter built on them.

pub mod distributed;
pub mod memory;
pub mod policy;
#[cfg(feature = "store-redis")]
pub mod redis_store;
pub mod scripts;
pub mod shard;

pub use distributed::{
    Admission, DistributedRateLimiter, LimiterBackend, Reservation, Reserve, SUCCESS_COUNT_MARK,
    TOTAL_COUNT_MARK,
};
pub use memory::MemoryLimiter;
pub use policy::{GroupLimit, GroupRateLimits, PolicyScope, RateLimitPolicy, active_policies};
#[cfg(feature = "store-redis")]
pub use redis_store::RedisScriptStore;
pub use scripts::{BucketParams, ScriptRuntime, ScriptStore, WindowMode, WindowParams};
pub use shard::{hash_shard, shard_key};
