//! Engine configuration.

use crate::{error::Result, CollectionName, Error, DEFAULT_RETRY_CEILING};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default collection synced by the branch manager.
pub const DEFAULT_COLLECTION: &str = "branches";

/// Default period between timer-driven drains.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(120);

/// Settings for a [`crate::SyncContext`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Remote collection the records live in
    pub collection: CollectionName,
    /// Period of the drain timer
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,
    /// Failed attempts after which an operation is abandoned
    pub retry_ceiling: u32,
    /// Whether the device network is assumed up at start
    pub start_online: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            collection: DEFAULT_COLLECTION.to_string(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            start_online: true,
        }
    }
}

impl SyncConfig {
    pub fn with_collection(mut self, collection: impl Into<CollectionName>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling;
        self
    }

    pub fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.collection.trim().is_empty() {
            return Err(Error::ConfigurationFault(
                "collection name must not be empty".into(),
            ));
        }
        if self.sync_interval.is_zero() {
            return Err(Error::ConfigurationFault(
                "sync interval must be positive".into(),
            ));
        }
        if self.retry_ceiling == 0 {
            return Err(Error::ConfigurationFault(
                "retry ceiling must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
