use crate::ws::{backoff::Backoff, connection::ConnectionConfig};
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub server_url: String,
    pub fallback_url: String,
    pub history_url: Option<String>,
    pub auth_token: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:4000/socket".to_string(),
            fallback_url: "http://127.0.0.1:4000/api/generate".to_string(),
            history_url: None,
            auth_token: None,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            max_missed_heartbeats: 3,
            reconnect_base_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            log_level: Level::INFO,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let server_url =
            std::env::var("GENERATION_WS_URL").unwrap_or(defaults.server_url);
        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "GENERATION_WS_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", server_url),
            ));
        }

        let fallback_url =
            std::env::var("GENERATION_HTTP_URL").unwrap_or(defaults.fallback_url);
        if !(fallback_url.starts_with("http://") || fallback_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue(
                "GENERATION_HTTP_URL".to_string(),
                format!("'{}' is not an http:// or https:// URL", fallback_url),
            ));
        }

        let history_url = std::env::var("HISTORY_URL").ok();
        let auth_token = std::env::var("GENERATION_TOKEN").ok();

        let request_timeout = millis_var("REQUEST_TIMEOUT_MS", defaults.request_timeout)?;
        let connect_timeout = millis_var("CONNECT_TIMEOUT_MS", defaults.connect_timeout)?;
        let heartbeat_interval = millis_var("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval)?;
        let reconnect_base_delay =
            millis_var("RECONNECT_BASE_DELAY_MS", defaults.reconnect_base_delay)?;
        let max_missed_heartbeats =
            parsed_var("MAX_MISSED_HEARTBEATS", defaults.max_missed_heartbeats)?;
        let max_reconnect_attempts =
            parsed_var("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts)?;

        if max_missed_heartbeats == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_MISSED_HEARTBEATS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            server_url,
            fallback_url,
            history_url,
            auth_token,
            request_timeout,
            connect_timeout,
            heartbeat_interval,
            max_missed_heartbeats,
            reconnect_base_delay,
            max_reconnect_attempts,
            log_level,
        })
    }

    /// The subset of settings owned by the connection manager.
    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.server_url.clone(),
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            max_missed_heartbeats: self.max_missed_heartbeats,
            backoff: Backoff::new(self.reconnect_base_delay, self.max_reconnect_attempts),
        }
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parsed_var(name, default_ms).map(Duration::from_millis)
}
