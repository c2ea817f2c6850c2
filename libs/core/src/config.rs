use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_DIRECT_LINE_DOMAIN: &str = "https://directline.botframework.com/v3/directline";

const DOMAIN_ENV: &str = "DIRECTLINE_DOMAIN";
const TIMEOUT_ENV: &str = "DIRECTLINE_TIMEOUT_MS";
const POLLING_ENV: &str = "DIRECTLINE_POLLING_INTERVAL_MS";
const WEBSOCKET_ENV: &str = "DIRECTLINE_WEBSOCKET";
const MAX_RETRIES_ENV: &str = "DIRECTLINE_MAX_RETRIES";
const AUTO_REFRESH_ENV: &str = "DIRECTLINE_AUTO_TOKEN_REFRESH";
const DEBUG_ENV: &str = "DIRECTLINE_DEBUG";

/// Options recognised by `initialize`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionOptions {
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "pollingInterval")]
    pub polling_interval_ms: u64,
    pub domain: String,
    pub web_socket: bool,
    pub max_retries: u32,
    pub auto_token_refresh: bool,
    pub debug_mode: bool,
    pub user_id: Option<String>,
    pub locale: Option<String>,
    pub greeting: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 20_000,
            polling_interval_ms: 1_000,
            domain: DEFAULT_DIRECT_LINE_DOMAIN.to_string(),
            web_socket: true,
            max_retries: 5,
            auto_token_refresh: true,
            debug_mode: false,
            user_id: None,
            locale: None,
            greeting: true,
        }
    }
}

impl SessionOptions {
    /// Defaults overlaid with `DIRECTLINE_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup. Unparseable values are ignored.
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(domain) = lookup(DOMAIN_ENV) {
            self.domain = domain.trim().to_string();
        }
        if let Some(timeout) = lookup(TIMEOUT_ENV).and_then(|v| v.trim().parse().ok()) {
            self.timeout_ms = timeout;
        }
        if let Some(interval) = lookup(POLLING_ENV).and_then(|v| v.trim().parse().ok()) {
            self.polling_interval_ms = interval;
        }
        if let Some(flag) = lookup(WEBSOCKET_ENV) {
            self.web_socket = parse_flag(&flag);
        }
        if let Some(retries) = lookup(MAX_RETRIES_ENV).and_then(|v| v.trim().parse().ok()) {
            self.max_retries = retries;
        }
        if let Some(flag) = lookup(AUTO_REFRESH_ENV) {
            self.auto_token_refresh = parse_flag(&flag);
        }
        if let Some(flag) = lookup(DEBUG_ENV) {
            self.debug_mode = parse_flag(&flag);
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Local user id, generating one on first use.
    pub fn ensure_user_id(&mut self) -> &str {
        self.user_id
            .get_or_insert_with(|| format!("dl_{}", Uuid::new_v4().simple()))
            .as_str()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = SessionOptions::default();
        assert_eq!(options.timeout(), Duration::from_secs(20));
        assert_eq!(options.polling_interval(), Duration::from_secs(1));
        assert_eq!(options.domain, DEFAULT_DIRECT_LINE_DOMAIN);
        assert!(options.web_socket);
        assert_eq!(options.max_retries, 5);
        assert!(options.auto_token_refresh);
        assert!(!options.debug_mode);
    }

    #[test]
    fn deserializes_option_names() {
        let options: SessionOptions = serde_json::from_value(serde_json::json!({
            "timeout": 5000,
            "pollingInterval": 250,
            "webSocket": false,
            "maxRetries": 2,
            "debugMode": true
        }))
        .unwrap();
        assert_eq!(options.timeout_ms, 5000);
        assert_eq!(options.polling_interval_ms, 250);
        assert!(!options.web_socket);
        assert_eq!(options.max_retries, 2);
        assert!(options.debug_mode);
        assert!(options.auto_token_refresh);
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DIRECTLINE_DOMAIN", "https://europe.directline.botframework.com/v3/directline"),
            ("DIRECTLINE_MAX_RETRIES", "not-a-number"),
            ("DIRECTLINE_WEBSOCKET", "off"),
            ("DIRECTLINE_POLLING_INTERVAL_MS", "400"),
        ]);
        let options =
            SessionOptions::default().with_overrides(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(
            options.domain,
            "https://europe.directline.botframework.com/v3/directline"
        );
        assert_eq!(options.max_retries, 5);
        assert!(!options.web_socket);
        assert_eq!(options.polling_interval_ms, 400);
    }

    #[test]
    fn user_id_is_generated_once() {
        let mut options = SessionOptions::default();
        let first = options.ensure_user_id().to_string();
        assert!(first.starts_with("dl_"));
        assert_eq!(options.ensure_user_id(), first);
    }
}
