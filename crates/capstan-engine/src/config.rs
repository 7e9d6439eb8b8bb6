//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for run coordination and persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Take a snapshot every this many applied events; 0 disables
    /// snapshotting (recovery then replays the full log)
    pub snapshot_interval: u32,

    /// Flush the event buffer when this many events are pending
    pub event_batch_size: usize,

    /// Flush the event buffer at least this often while a run is parked
    #[serde(with = "duration_millis")]
    pub event_flush_interval: Duration,

    /// After a dispatch deadline expires and cancellation is signalled,
    /// how long to wait for the executor before synthesizing a timeout
    /// failure
    #[serde(with = "duration_millis")]
    pub dispatch_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 32,
            event_batch_size: 16,
            event_flush_interval: Duration::from_millis(200),
            dispatch_grace: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the snapshot interval (0 disables snapshotting)
    pub fn with_snapshot_interval(mut self, events: u32) -> Self {
        self.snapshot_interval = events;
        self
    }

    /// Set the event buffer batch size (minimum 1)
    pub fn with_event_batch_size(mut self, size: usize) -> Self {
        self.event_batch_size = size.max(1);
        self
    }

    /// Set the event buffer flush interval
    pub fn with_event_flush_interval(mut self, interval: Duration) -> Self {
        self.event_flush_interval = interval;
        self
    }

    /// Set the dispatch grace period
    pub fn with_dispatch_grace(mut self, grace: Duration) -> Self {
        self.dispatch_grace = grace;
        self
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
