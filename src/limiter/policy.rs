use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which layer of the policy stack a policy came from. Also selects the key namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyScope {
    Model,
    UserIp,
    GroupIp,
    TokenIp,
    Global,
}

impl PolicyScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::UserIp => "model_ip_user",
            Self::GroupIp => "model_ip_group",
            Self::TokenIp => "model_ip_token",
            Self::Global => "global",
        }
    }
}

/// One admission rule. Counts `<= 0` disable the matching check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub scope: PolicyScope,
    pub identifier: String,
    pub window: Duration,
    pub max_total: i64,
    pub max_success: i64,
}

impl RateLimitPolicy {
    pub fn new(
        scope: PolicyScope,
        identifier: impl Into<String>,
        window: Duration,
        max_total: i64,
        max_success: i64,
    ) -> Self {
        Self {
            scope,
            identifier: identifier.into(),
            window,
            max_total,
            max_success,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.window.is_zero() && (self.max_total > 0 || self.max_success > 0)
    }

    pub fn window_seconds(&self) -> i64 {
        self.window.as_secs().max(1) as i64
    }

    pub fn window_minutes(&self) -> u64 {
        (self.window.as_secs() / 60).max(1)
    }

    pub fn total_exceeded_reason(&self) -> String {
        format!(
            "at most {} requests per {} minute(s), failed requests included",
            self.max_total,
            self.window_minutes()
        )
    }

    pub fn success_exceeded_reason(&self) -> String {
        format!(
            "at most {} successful requests per {} minute(s)",
            self.max_success,
            self.window_minutes()
        )
    }
}

/// Drops inactive policies; the rest are evaluated as an AND.
pub fn active_policies(policies: impl IntoIterator<Item = RateLimitPolicy>) -> Vec<RateLimitPolicy> {
    policies
        .into_iter()
        .filter(RateLimitPolicy::is_active)
        .collect()
}

/// `[total, success]` pair from a group table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupLimit {
    pub total: i64,
    pub success: i64,
}

/// Group override table. Accepts `{"group": [t, s]}` and `{"user_group": {"token_group": [t, s]}}`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GroupRateLimits {
    pub by_group: BTreeMap<String, GroupLimit>,
    pub by_user_token_group: BTreeMap<String, BTreeMap<String, GroupLimit>>,
}

impl GroupRateLimits {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        let value: Value =
            serde_json::from_str(raw).map_err(|err| format!("invalid group table json: {err}"))?;
        let Value::Object(groups) = value else {
            return Err("group table must be a json object".to_string());
        };

        let mut out = Self::default();
        for (group, group_value) in groups {
            if let Ok(limit) = parse_limit_pair(&group_value) {
                out.by_group.insert(group, limit);
                continue;
            }

            let Value::Object(token_groups) = group_value else {
                return Err(format!(
                    "group {group} format invalid, expected [total, success] or object"
                ));
            };
            let mut nested = BTreeMap::new();
            for (token_group, token_value) in token_groups {
                let limit = parse_limit_pair(&token_value).map_err(|err| {
                    format!("group {group} token-group {token_group} format invalid: {err}")
                })?;
                nested.insert(token_group, limit);
            }
            out.by_user_token_group.insert(group, nested);
        }
        Ok(out)
    }

    /// Parse and reject negative totals or success counts below one.
    pub fn parse_validated(raw: &str) -> Result<Self, String> {
        let parsed = Self::parse(raw)?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), String> {
        for (group, limit) in &self.by_group {
            check_limit(limit).map_err(|err| format!("group {group} {err}"))?;
        }
        for (group, nested) in &self.by_user_token_group {
            for (token_group, limit) in nested {
                check_limit(limit)
                    .map_err(|err| format!("group {group} token-group {token_group} {err}"))?;
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.by_group.is_empty() && self.by_user_token_group.is_empty()
    }

    pub fn group(&self, group: &str) -> Option<GroupLimit> {
        self.by_group.get(group).copied()
    }

    /// An empty token group means "same as the user group".
    pub fn user_token_group(&self, user_group: &str, token_group: &str) -> Option<GroupLimit> {
        if user_group.is_empty() {
            return None;
        }
        let nested = self.by_user_token_group.get(user_group)?;
        let token_group = if token_group.is_empty() {
            user_group
        } else {
            token_group
        };
        nested.get(token_group).copied()
    }

    /// Nested `(user_group, token_group)` entry first, then the flat entry for the effective group.
    pub fn resolve(&self, user_group: &str, token_group: &str) -> Option<GroupLimit> {
        if let Some(limit) = self.user_token_group(user_group, token_group) {
            return Some(limit);
        }
        let group = if token_group.is_empty() {
            user_group
        } else {
            token_group
        };
        self.group(group)
    }

    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (group, limit) in &self.by_group {
            out.insert(group.clone(), serde_json::json!([limit.total, limit.success]));
        }
        for (group, nested) in &self.by_user_token_group {
            let mut inner = serde_json::Map::new();
            for (token_group, limit) in nested {
                inner.insert(
                    token_group.clone(),
                    serde_json::json!([limit.total, limit.success]),
                );
            }
            out.insert(group.clone(), Value::Object(inner));
        }
        Value::Object(out)
    }
}

impl Serialize for GroupRateLimits {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for GroupRateLimits {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::parse(&value.to_string()).map_err(serde::de::Error::custom)
    }
}

fn parse_limit_pair(value: &Value) -> Result<GroupLimit, String> {
    let Value::Array(items) = value else {
        return Err("rate limit value must be [total, success]".to_string());
    };
    if items.len() != 2 {
        return Err(format!(
            "rate limit value must have exactly 2 items, got {}",
            items.len()
        ));
    }
    Ok(GroupLimit {
        total: parse_limit_value(&items[0])?,
        success: parse_limit_value(&items[1])?,
    })
}

fn parse_limit_value(value: &Value) -> Result<i64, String> {
    let Some(number) = value.as_f64() else {
        return Err(format!("invalid rate limit value {value}"));
    };
    if number.trunc() != number {
        return Err(format!("rate limit value {number} is not integer"));
    }
    if number < f64::from(i32::MIN) || number > f64::from(i32::MAX) {
        return Err(format!(
            "rate limit value {number} out of allowed range [{}, {}]",
            i32::MIN,
            i32::MAX
        ));
    }
    Ok(number as i64)
}

fn check_limit(limit: &GroupLimit) -> Result<(), String> {
    if limit.total < 0 || limit.success < 1 {
        return Err(format!(
            "has negative rate limit values: [{}, {}]",
            limit.total, limit.success
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_window_or_zero_counts_is_no_policy() {
        let minute = Duration::from_secs(60);
        assert!(!RateLimitPolicy::new(PolicyScope::Model, "1", Duration::ZERO, 10, 10).is_active());
        assert!(!RateLimitPolicy::new(PolicyScope::Model, "1", minute, 0, -1).is_active());
        assert!(RateLimitPolicy::new(PolicyScope::Model, "1", minute, 0, 5).is_active());

        let kept = active_policies([
            RateLimitPolicy::new(PolicyScope::Model, "a", minute, 1, 0),
            RateLimitPolicy::new(PolicyScope::UserIp, "b", minute, 0, 0),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].identifier, "a");
    }

    #[test]
    fn group_table_accepts_flat_and_nested_shapes() {
        let table = GroupRateLimits::parse(
            r#"{"default": [100, 1000], "vip": {"vip": [0, 50], "cheap": [10, 20]}}"#,
        )
        .expect("parse");

        assert_eq!(
            table.group("default"),
            Some(GroupLimit {
                total: 100,
                success: 1000
            })
        );
        assert_eq!(
            table.user_token_group("vip", ""),
            Some(GroupLimit {
                total: 0,
                success: 50
            })
        );
        assert_eq!(
            table.resolve("vip", "cheap"),
            Some(GroupLimit {
                total: 10,
                success: 20
            })
        );
        assert_eq!(
            table.resolve("default", ""),
            Some(GroupLimit {
                total: 100,
                success: 1000
            })
        );
        assert_eq!(table.resolve("unknown", ""), None);
    }

    #[test]
    fn group_table_rejects_bad_values() {
        assert!(GroupRateLimits::parse(r#"{"a": [1.5, 2]}"#).is_err());
        assert!(GroupRateLimits::parse(r#"{"a": [1, 2, 3]}"#).is_err());
        assert!(GroupRateLimits::parse(r#"{"a": "nope"}"#).is_err());
        assert!(GroupRateLimits::parse(r#"{"a": [3000000000, 1]}"#).is_err());
        assert!(GroupRateLimits::parse_validated(r#"{"a": [5, 0]}"#).is_err());
        assert!(GroupRateLimits::parse_validated(r#"{"a": {"b": [-1, 3]}}"#).is_err());
        assert!(GroupRateLimits::parse_validated(r#"{"a": [0, 1]}"#).is_ok());
    }

    #[test]
    fn group_table_json_round_trips_through_serde() {
        let table = GroupRateLimits::parse(r#"{"default": [1, 2], "vip": {"x": [3, 4]}}"#)
            .expect("parse");
        let raw = serde_json::to_string(&table).expect("serialize");
        let back: GroupRateLimits = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back, table);
    }
}
