//! Runtime configuration, read from the environment.

use std::time::Duration;
use tracing::warn;

const DEFAULT_API_URL: &str = "http://localhost:8000";
const DEFAULT_ENDPOINT: &str = "/get_all_user_history";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_PORT: u16 = 4860;

#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the analytics backend (`HISTORY_API_URL`)
    pub api_url: String,
    /// Path of the "all user history" endpoint (`HISTORY_ENDPOINT`)
    pub endpoint: String,
    /// User whose history is loaded (`HISTORY_USER_ID`)
    pub user_id: Option<String>,
    /// Bearer token for the backend (`HISTORY_API_TOKEN`)
    pub api_token: Option<String>,
    /// Upstream request timeout (`HISTORY_TIMEOUT_SECS`)
    pub timeout: Duration,
    /// Listen port (`PORT`)
    pub port: u16,
    /// Periodic refresh interval; `None` disables it (`REFRESH_INTERVAL_SECS`)
    pub refresh_interval: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            user_id: None,
            api_token: None,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            port: DEFAULT_PORT,
            refresh_interval: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup; unset or blank values use defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let timeout_secs = parse_or(get("HISTORY_TIMEOUT_SECS"), "HISTORY_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS);
        let refresh_secs = parse_or(get("REFRESH_INTERVAL_SECS"), "REFRESH_INTERVAL_SECS", 0u64);

        Self {
            api_url: get("HISTORY_API_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            endpoint: get("HISTORY_ENDPOINT")
                .map(|e| if e.starts_with('/') { e } else { format!("/{}", e) })
                .unwrap_or(defaults.endpoint),
            user_id: get("HISTORY_USER_ID"),
            api_token: get("HISTORY_API_TOKEN"),
            timeout: Duration::from_secs(timeout_secs),
            port: parse_or(get("PORT"), "PORT", DEFAULT_PORT),
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
        }
    }

    /// Full URL of the history endpoint
    pub fn history_url(&self) -> String {
        format!("{}{}", self.api_url, self.endpoint)
    }
}

fn parse_or<T: std::str::FromStr + Copy>(value: Option<String>, key: &str, default: T) -> T {
    match value {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Invalid {}={:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}
