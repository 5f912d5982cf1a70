//! Client configuration.
//!
//! Defaults match the production room service: 500 ms reconnect floor,
//! 10 s ceiling, 30 s presence window. Every field can be overridden from
//! the environment with [`SyncConfig::from_env`].

use std::time::Duration;

/// Largest page the history endpoint serves.
pub const MAX_HISTORY_PAGE: u32 = 100;

/// Authentication material attached to every REST call and transport dial.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: String,
    pub user_id: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            user_id: user_id.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Sync client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Base URL of the REST API, e.g. `http://localhost:8080`
    pub api_base: String,
    /// Base URL of the room transport, e.g. `ws://localhost:8082`
    pub ws_base: String,
    pub credentials: Credentials,
    /// First reconnect delay
    pub backoff_floor: Duration,
    /// Largest reconnect delay
    pub backoff_ceiling: Duration,
    /// Members seen within this window are online
    pub presence_window: Duration,
    /// Page size requested from the history endpoint (server default if None)
    pub history_page_limit: Option<u32>,
    /// Per-request timeout for REST calls
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8080".to_string(),
            ws_base: "ws://127.0.0.1:8082".to_string(),
            credentials: Credentials::default(),
            backoff_floor: Duration::from_millis(500),
            backoff_ceiling: Duration::from_secs(10),
            presence_window: Duration::from_secs(30),
            history_page_limit: Some(50),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// Build a configuration from `AGORA_*` environment variables, falling
    /// back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("AGORA_API_BASE") {
            config.api_base = v;
        }
        if let Some(v) = lookup("AGORA_WS_BASE") {
            config.ws_base = v;
        }
        if let Some(v) = lookup("AGORA_ACCESS_TOKEN") {
            config.credentials.access_token = v;
        }
        if let Some(v) = lookup("AGORA_USER_ID") {
            config.credentials.user_id = v;
        }
        if let Some(ms) = number(&lookup, "AGORA_BACKOFF_FLOOR_MS")? {
            config.backoff_floor = Duration::from_millis(ms);
        }
        if let Some(ms) = number(&lookup, "AGORA_BACKOFF_CEILING_MS")? {
            config.backoff_ceiling = Duration::from_millis(ms);
        }
        if let Some(secs) = number(&lookup, "AGORA_PRESENCE_WINDOW_SECS")? {
            config.presence_window = Duration::from_secs(secs);
        }
        if let Some(limit) = number(&lookup, "AGORA_HISTORY_PAGE_LIMIT")? {
            let limit = u32::try_from(limit).map_err(|_| ConfigError::InvalidNumber {
                var: "AGORA_HISTORY_PAGE_LIMIT",
                value: limit.to_string(),
            })?;
            config.history_page_limit = Some(limit);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_floor.is_zero() {
            return Err(ConfigError::Invalid("backoff floor must be positive".into()));
        }
        if self.backoff_ceiling < self.backoff_floor {
            return Err(ConfigError::Invalid(format!(
                "backoff ceiling {:?} is below floor {:?}",
                self.backoff_ceiling, self.backoff_floor
            )));
        }
        if self.presence_window.is_zero() {
            return Err(ConfigError::Invalid("presence window must be positive".into()));
        }
        if let Some(limit) = self.history_page_limit {
            if limit == 0 || limit > MAX_HISTORY_PAGE {
                return Err(ConfigError::Invalid(format!(
                    "history page limit {limit} outside 1..={MAX_HISTORY_PAGE}"
                )));
            }
        }
        Ok(())
    }
}

fn number<F>(lookup: &F, var: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
    }
}
