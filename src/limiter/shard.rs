use crate::utils::hash::hash64_fnv1a;

/// Shard suffix for `identifier` across `shard_count` counters. Pure; `k <= 1` always yields 0.
pub fn hash_shard(identifier: &str, shard_count: u32) -> u32 {
    if shard_count <= 1 {
        return 0;
    }
    (hash64_fnv1a(identifier.as_bytes()) % u64::from(shard_count)) as u32
}

/// Key layout: `rateLimit:<scope>:<mark>:id:<identifier>:<shard>`.
pub fn shard_key(scope: &str, mark: &str, identifier: &str, shard_count: u32) -> String {
    format!(
        "rateLimit:{scope}:{mark}:id:{identifier}:{}",
        hash_shard(identifier, shard_count)
    )
}
