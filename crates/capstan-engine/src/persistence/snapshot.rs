//! Snapshots: cached run state at a known event position

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::persistence::StoreError;
use crate::state::RunState;

/// Point-in-time capture of a run's reconstructed state
///
/// A snapshot is an optimization over full replay, never authoritative on
/// its own: recovery loads the latest snapshot and replays every event
/// after `after_sequence_number`. The invariant `after_sequence_number <=
/// highest persisted sequence` must hold at capture time, which is why the
/// coordinator flushes its event buffer before snapshotting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Run the snapshot belongs to
    pub run_id: Uuid,

    /// Workflow definition the run executes, needed to interpret replayed
    /// events
    pub workflow_id: String,
    pub workflow_version: u32,

    /// The reconstructed state as of `after_sequence_number`
    pub state: RunState,

    /// Highest event sequence number reflected in `state`
    pub after_sequence_number: u64,

    /// Wall-clock capture time
    pub taken_at: DateTime<Utc>,
}

/// Store for run snapshots
///
/// A newer snapshot supersedes older ones; implementations are free to
/// discard superseded snapshots and only ever need to serve the latest.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot, superseding any older one for the run
    async fn put(&self, snapshot: Snapshot) -> Result<(), StoreError>;

    /// Latest snapshot for a run, if any
    async fn get_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError>;
}
