//! Configuration management for the server.

use branchsync_engine::{SyncConfig, DEFAULT_COLLECTION};
use std::env;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// SQLite connection URL
    pub database_url: String,
    /// Name of the synced remote collection
    pub collection: String,
    /// Seconds between periodic sync attempts
    pub sync_interval_secs: u64,
    /// Initial device network signal
    pub network_online: bool,
}

pub const DEFAULT_DATABASE_URL: &str = "sqlite://branches.db?mode=rwc";

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's value
    /// if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

        let collection = lookup("COLLECTION").unwrap_or_else(|| DEFAULT_COLLECTION.to_string());
        if collection.trim().is_empty() {
            return Err(ConfigError::EmptyCollection);
        }

        let sync_interval_secs = match lookup("SYNC_INTERVAL_SECS") {
            Some(value) => value
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidSyncInterval)?,
            None => 120,
        };

        let network_online = match lookup("NETWORK_ONLINE") {
            Some(value) => parse_bool(&value).ok_or(ConfigError::InvalidNetworkOnline)?,
            None => true,
        };

        Ok(Self {
            host,
            port,
            database_url,
            collection,
            sync_interval_secs,
            network_online,
        })
    }

    /// The engine configuration this server runs with.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_collection(self.collection.clone())
            .with_sync_interval(Duration::from_secs(self.sync_interval_secs))
            .with_start_online(self.network_online)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("COLLECTION must not be empty")]
    EmptyCollection,

    #[error("SYNC_INTERVAL_SECS must be a positive number of seconds")]
    InvalidSyncInterval,

    #[error("NETWORK_ONLINE must be true or false")]
    InvalidNetworkOnline,
}
