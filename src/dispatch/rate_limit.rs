use std::time::Duration;

use super::identity::Identity;
use crate::config::RateLimitSettings;
use crate::error::AdmissionError;
use crate::limiter::{
    DistributedRateLimiter, GroupLimit, PolicyScope, RateLimitPolicy, WindowMode, WindowParams,
    active_policies,
};

/// Key namespace of the global per-IP API limit.
pub const GLOBAL_API_MARK: &str = "GA";

fn minutes(value: u64) -> Duration {
    Duration::from_secs(value.saturating_mul(60))
}

/// Positive values only; the smaller one wins.
fn stricter_count(system: i64, token: i64) -> i64 {
    match (system > 0, token > 0) {
        (true, true) => system.min(token),
        (true, false) => system,
        (false, true) => token,
        (false, false) => 0,
    }
}

/// A positive token window replaces the system window when it is shorter or the system has none.
fn stricter_window(system: Duration, token: Duration) -> Duration {
    if !token.is_zero() && (system.is_zero() || token < system) {
        token
    } else {
        system
    }
}

/// Model policy for `identity`: system settings, then the group table, then the token override.
pub fn model_policy(settings: &RateLimitSettings, identity: &Identity) -> Option<RateLimitPolicy> {
    let model = &settings.model;
    let token = &identity.rate_limit;
    let mut window = Duration::ZERO;
    let mut total = 0;
    let mut success = 0;

    if model.enabled {
        window = minutes(model.duration_minutes);
        total = model.total_count;
        success = model.success_count;
        if let Some(GroupLimit {
            total: group_total,
            success: group_success,
        }) = model
            .groups
            .resolve(&identity.user_group, &identity.token_group)
        {
            total = group_total;
            success = group_success;
        }
    }
    if token.enabled {
        window = stricter_window(window, minutes(token.duration_minutes));
        total = stricter_count(total, token.total_count);
        success = stricter_count(success, token.success_count);
    }

    let policy = RateLimitPolicy::new(
        PolicyScope::Model,
        identity.limiter_id(),
        window,
        total,
        success,
    );
    policy.is_active().then_some(policy)
}

/// Per-IP extensions: user by IP, group by IP and token by IP.
pub fn ip_policies(
    settings: &RateLimitSettings,
    identity: &Identity,
    client_ip: &str,
) -> Vec<RateLimitPolicy> {
    let ip = &settings.ip;
    if !ip.enabled || client_ip.is_empty() {
        return Vec::new();
    }
    let window = minutes(ip.duration_minutes);
    let mut policies = vec![RateLimitPolicy::new(
        PolicyScope::UserIp,
        format!("{client_ip}+user+{}", identity.user_id),
        window,
        ip.user_count,
        ip.user_success_count,
    )];

    if let Some(limit) = ip
        .groups
        .resolve(&identity.user_group, &identity.token_group)
    {
        policies.push(RateLimitPolicy::new(
            PolicyScope::GroupIp,
            format!("{client_ip}+group+{}", identity.using_group()),
            window,
            limit.total,
            limit.success,
        ));
    }

    let token = &identity.rate_limit;
    if token.enabled && identity.token_id != 0 {
        let token_window = if token.duration_minutes > 0 {
            minutes(token.duration_minutes)
        } else {
            window
        };
        policies.push(RateLimitPolicy::new(
            PolicyScope::TokenIp,
            format!("{client_ip}+token+{}", identity.token_id),
            token_window,
            token.total_count,
            token.success_count,
        ));
    }
    active_policies(policies)
}

/// Every policy a request from `identity` must pass, in evaluation order.
pub fn compose_policies(
    settings: &RateLimitSettings,
    identity: &Identity,
    client_ip: Option<&str>,
) -> Vec<RateLimitPolicy> {
    let mut policies: Vec<RateLimitPolicy> = model_policy(settings, identity).into_iter().collect();
    if let Some(client_ip) = client_ip {
        policies.extend(ip_policies(settings, identity, client_ip));
    }
    policies
}

pub fn global_api_key(client_ip: &str) -> String {
    format!("rateLimit:{GLOBAL_API_MARK}{client_ip}")
}

/// Check-and-record one request against the global per-IP limit. Store failures reject.
pub async fn check_global_api(
    limiter: &DistributedRateLimiter,
    settings: &RateLimitSettings,
    client_ip: &str,
) -> Result<(), AdmissionError> {
    let global = &settings.global_api;
    if !global.enabled || global.max_requests <= 0 || global.duration_seconds == 0 {
        return Ok(());
    }
    let params = WindowParams {
        max_count: global.max_requests,
        window_seconds: global.duration_seconds.min(i64::MAX as u64) as i64,
        expire_seconds: settings.key_expiration_seconds.min(i64::MAX as u64) as i64,
    };
    let admitted = limiter
        .window(
            &global_api_key(client_ip),
            params,
            WindowMode::CheckAndRecord,
            None,
        )
        .await?;
    if admitted {
        Ok(())
    } else {
        Err(AdmissionError::RateLimited {
            reason: format!(
                "at most {} API requests per {} second(s) from one address",
                global.max_requests, global.duration_seconds
            ),
        })
    }
}
