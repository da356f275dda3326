// Конфигурация приложения
// В debug-сборке логирование подробное, в release только предупреждения

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::peer::types::ServerConfig;

#[cfg(debug_assertions)]
pub const LOGGING_ENABLED: bool = true;

#[cfg(not(debug_assertions))]
pub const LOGGING_ENABLED: bool = false;

pub const DEFAULT_LOG_FILTER: &str = if LOGGING_ENABLED {
    "info,ssc_rendezvous=debug"
} else {
    "warn"
};

/// Интервал опроса ответа инициатором
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Интервал опроса таблицы кандидатов (REST relay)
pub const DEFAULT_FEED_INTERVAL_MS: u64 = 250;

pub static DEFAULT_ICE_SERVERS: Lazy<Vec<ServerConfig>> = Lazy::new(|| {
    vec![
        ServerConfig::stun("default-stun", "stun:stun.l.google.com:19302"),
        ServerConfig::stun("default-stun-1", "stun:stun1.l.google.com:19302"),
    ]
});

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Базовый URL проекта, без `/rest/v1`
    pub url: String,
    pub api_key: String,
    pub session_table: String,
    pub candidate_table: String,
    pub feed_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            session_table: "call_sessions".into(),
            candidate_table: "ice_candidates".into(),
            feed_interval_ms: DEFAULT_FEED_INTERVAL_MS,
        }
    }
}

impl RelayConfig {
    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub ice_servers: Vec<ServerConfig>,
    pub poll_interval_ms: u64,
    pub relay: RelayConfig,
    pub log_filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_ICE_SERVERS.clone(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            relay: RelayConfig::default(),
            log_filter: None,
        }
    }
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            server.validate()?;
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.relay.feed_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "relay.feed_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_call_page() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.relay.session_table, "call_sessions");
        assert_eq!(config.relay.candidate_table, "ice_candidates");
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = Config::from_json(r#"{"poll_interval_ms": 250, "relay": {"url": "https://x.supabase.co"}}"#)
            .unwrap();
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.relay.url, "https://x.supabase.co");
        assert_eq!(config.relay.candidate_table, "ice_candidates");
        assert_eq!(config.ice_servers, *DEFAULT_ICE_SERVERS);
    }

    #[test]
    fn rejects_turn_without_credentials() {
        let raw = r#"{"ice_servers": [{"id": "t", "type": "turn", "url": "turn.example.org", "username": null, "credential": null}]}"#;
        assert!(matches!(Config::from_json(raw), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_zero_poll_interval() {
        assert!(Config::from_json(r#"{"poll_interval_ms": 0}"#).is_err());
    }
}
