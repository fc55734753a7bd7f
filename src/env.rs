use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Layered key/value source: dotenv entries win over the process environment.
#[derive(Clone)]
pub struct Env {
    pub dotenv: BTreeMap<String, String>,
    inherit_process: bool,
}

impl Default for Env {
    fn default() -> Self {
        Self {
            dotenv: BTreeMap::new(),
            inherit_process: true,
        }
    }
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.dotenv.keys().map(|key| key.as_str()).collect();
        f.debug_struct("Env")
            .field("dotenv_keys", &keys)
            .field("inherit_process", &self.inherit_process)
            .finish()
    }
}

impl Env {
    pub fn parse_dotenv(contents: &str) -> Self {
        Self {
            dotenv: parse_dotenv(contents),
            inherit_process: true,
        }
    }

    /// Env that never consults the process environment.
    pub fn isolated<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            dotenv: entries
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
            inherit_process: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.dotenv.get(key) {
            return Some(value.clone());
        }
        if !self.inherit_process {
            return None;
        }
        std::env::var(key)
            .ok()
            .filter(|value| !value.trim().is_empty())
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn parse_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Display + Copy,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(err) => {
                warn!(key, value = %raw, %err, %default, "failed to parse env value, using default");
                default
            }
        }
    }

    /// Integer setting where values `<= 0` also fall back to the default.
    pub fn positive_or(&self, key: &str, default: i64) -> i64 {
        let value = self.parse_or(key, default);
        if value <= 0 { default } else { value }
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.get(key) else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "t" | "true" | "yes" | "on" => true,
            "0" | "f" | "false" | "no" | "off" => false,
            _ => {
                warn!(key, value = %raw, default, "failed to parse env bool, using default");
                default
            }
        }
    }

    pub fn duration_ms_or(&self, key: &str, default_ms: u64) -> Duration {
        let ms = self.parse_or(key, default_ms as i64);
        let ms = if ms <= 0 { default_ms } else { ms as u64 };
        Duration::from_millis(ms)
    }

    pub fn duration_secs_or(&self, key: &str, default_secs: u64) -> Duration {
        let secs = self.positive_or(key, default_secs as i64);
        Duration::from_secs(secs as u64)
    }
}

pub fn parse_dotenv(contents: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();

    for raw_line in contents.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line).trim();
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            continue;
        };
        let key = raw_key.trim();
        if key.is_empty() {
            continue;
        }

        let mut value = raw_value.trim().to_string();
        if let Some(stripped) = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        {
            value = stripped.to_string();
        }

        if value.trim().is_empty() {
            continue;
        }

        out.insert(key.to_string(), value);
    }

    out
}
