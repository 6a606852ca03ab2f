//! Configuration management for the agent.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use stockroom_engine::RetryPolicy;

/// Runtime knobs of the sync machinery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
    /// How long `get_all` may serve a cached collection
    pub cache_ttl: Duration,
    /// Deadline for every remote call
    pub remote_timeout: Duration,
    /// Period of the background sync timer
    pub sync_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(5_000),
            remote_timeout: Duration::from_millis(3_000),
            sync_interval: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API host address
    pub host: String,
    /// Control API port
    pub port: u16,
    /// `sqlite://...` URL of the durable store, or `memory`
    pub storage_url: String,
    /// Bearer token required by the control API, if set
    pub auth_secret: Option<String>,
    /// Whether the remote store integration is on
    pub remote_enabled: bool,
    pub firestore_project_id: Option<String>,
    pub firestore_id_token: Option<String>,
    /// Signed-in user of this device
    pub owner_id: Option<String>,
    pub owner_email: Option<String>,
    pub sync: SyncSettings,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let storage_url =
            lookup("STORAGE_URL").unwrap_or_else(|| "sqlite://stockroom.db".to_string());

        let auth_secret = lookup("AUTH_SECRET").filter(|s| !s.is_empty());

        let firestore_project_id = lookup("FIRESTORE_PROJECT_ID").filter(|s| !s.is_empty());
        let firestore_id_token = lookup("FIRESTORE_ID_TOKEN").filter(|s| !s.is_empty());

        let remote_enabled = match lookup("REMOTE_ENABLED") {
            Some(raw) => parse_bool("REMOTE_ENABLED", &raw)?,
            None => firestore_project_id.is_some(),
        };
        if remote_enabled && firestore_project_id.is_none() {
            return Err(ConfigError::MissingFirestoreProject);
        }

        let defaults = SyncSettings::default();
        let sync = SyncSettings {
            cache_ttl: Duration::from_millis(number(&lookup, "CACHE_TTL_MS", 5_000)?),
            remote_timeout: Duration::from_millis(number(&lookup, "REMOTE_TIMEOUT_MS", 3_000)?),
            sync_interval: Duration::from_secs(number(&lookup, "SYNC_INTERVAL_SECS", 60)?),
            retry: RetryPolicy {
                base_delay_ms: number(&lookup, "RETRY_BASE_DELAY_MS", defaults.retry.base_delay_ms)?,
                max_delay_ms: number(&lookup, "RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms)?,
                max_retries: number(&lookup, "MAX_RETRIES", defaults.retry.max_retries)?,
            },
        };
        if sync.sync_interval.is_zero() {
            return Err(ConfigError::InvalidNumber("SYNC_INTERVAL_SECS"));
        }

        Ok(Self {
            host,
            port,
            storage_url,
            auth_secret,
            remote_enabled,
            firestore_project_id,
            firestore_id_token,
            owner_id: lookup("OWNER_ID").filter(|s| !s.is_empty()),
            owner_email: lookup("OWNER_EMAIL").filter(|s| !s.is_empty()),
            sync,
        })
    }
}

fn number<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidNumber(key)),
        None => Ok(default),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidBool(key)),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid numeric value for {0}")]
    InvalidNumber(&'static str),

    #[error("Invalid boolean value for {0}")]
    InvalidBool(&'static str),

    #[error("FIRESTORE_PROJECT_ID is required when the remote store is enabled")]
    MissingFirestoreProject,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_remote() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.storage_url, "sqlite://stockroom.db");
        assert!(!config.remote_enabled);
        assert_eq!(config.sync, SyncSettings::default());
        assert_eq!(config.sync.retry.max_retries, 5);
    }

    #[test]
    fn project_enables_remote() {
        let config = load(&[("FIRESTORE_PROJECT_ID", "shop-1"), ("OWNER_ID", "u1")]).unwrap();
        assert!(config.remote_enabled);
        assert_eq!(config.owner_id.as_deref(), Some("u1"));
    }

    #[test]
    fn remote_can_be_switched_off() {
        let config = load(&[("FIRESTORE_PROJECT_ID", "shop-1"), ("REMOTE_ENABLED", "false")]).unwrap();
        assert!(!config.remote_enabled);
    }

    #[test]
    fn enabled_remote_needs_a_project() {
        assert_eq!(
            load(&[("REMOTE_ENABLED", "true")]).unwrap_err(),
            ConfigError::MissingFirestoreProject
        );
    }

    #[test]
    fn sync_knobs_parse() {
        let config = load(&[
            ("CACHE_TTL_MS", "250"),
            ("REMOTE_TIMEOUT_MS", "1500"),
            ("SYNC_INTERVAL_SECS", "30"),
            ("MAX_RETRIES", "2"),
        ])
        .unwrap();
        assert_eq!(config.sync.cache_ttl, Duration::from_millis(250));
        assert_eq!(config.sync.remote_timeout, Duration::from_millis(1500));
        assert_eq!(config.sync.sync_interval, Duration::from_secs(30));
        assert_eq!(config.sync.retry.max_retries, 2);
    }

    #[test]
    fn bad_values_are_reported() {
        assert_eq!(load(&[("PORT", "http")]).unwrap_err(), ConfigError::InvalidPort);
        assert_eq!(
            load(&[("MAX_RETRIES", "-1")]).unwrap_err(),
            ConfigError::InvalidNumber("MAX_RETRIES")
        );
        assert_eq!(
            load(&[("REMOTE_ENABLED", "maybe")]).unwrap_err(),
            ConfigError::InvalidBool("REMOTE_ENABLED")
        );
        assert_eq!(
            load(&[("SYNC_INTERVAL_SECS", "0")]).unwrap_err(),
            ConfigError::InvalidNumber("SYNC_INTERVAL_SECS")
        );
    }
}
