//! In-memory persistence for tests and embedded use

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::event::{EventRecord, RunEvent};
use crate::persistence::log::{EventLog, StoreError};
use crate::persistence::snapshot::{Snapshot, SnapshotStore};

/// In-memory implementation of [`EventLog`]
///
/// Provides the same semantics a durable backend must: gapless per-run
/// sequences, atomic batch appends, optimistic concurrency on the append
/// position.
#[derive(Default)]
pub struct InMemoryEventLog {
    runs: RwLock<HashMap<Uuid, Vec<EventRecord>>>,
}

impl InMemoryEventLog {
    /// Create a new empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with at least one event
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Total number of events for a run
    pub fn event_count(&self, run_id: Uuid) -> usize {
        self.runs.read().get(&run_id).map_or(0, Vec::len)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<RunEvent>,
    ) -> Result<u64, StoreError> {
        let mut runs = self.runs.write();
        let log = runs.entry(run_id).or_default();

        let current = log.len() as u64;
        if current != expected_sequence {
            return Err(StoreError::SequenceConflict {
                expected: expected_sequence,
                actual: current,
            });
        }

        let now = Utc::now();
        for (offset, event) in events.into_iter().enumerate() {
            log.push(EventRecord {
                run_id,
                sequence_number: current + offset as u64 + 1,
                timestamp: now,
                event,
            });
        }
        Ok(log.len() as u64)
    }

    async fn read(
        &self,
        run_id: Uuid,
        after_sequence: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let runs = self.runs.read();
        let log = runs.get(&run_id).ok_or(StoreError::RunNotFound(run_id))?;

        Ok(log
            .iter()
            .filter(|r| r.sequence_number > after_sequence)
            .cloned()
            .collect())
    }

    async fn latest_sequence(&self, run_id: Uuid) -> Result<u64, StoreError> {
        Ok(self.runs.read().get(&run_id).map_or(0, |log| log.len() as u64))
    }
}

/// In-memory implementation of [`SnapshotStore`]
///
/// Keeps only the newest snapshot per run; an older `put` than the stored
/// one is discarded.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
}

impl InMemorySnapshotStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of runs with a snapshot
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.snapshots.write().clear();
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn put(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write();
        match snapshots.get(&snapshot.run_id) {
            Some(existing) if existing.after_sequence_number >= snapshot.after_sequence_number => {}
            _ => {
                snapshots.insert(snapshot.run_id, snapshot);
            }
        }
        Ok(())
    }

    async fn get_latest(&self, run_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        Ok(self.snapshots.read().get(&run_id).cloned())
    }
}
