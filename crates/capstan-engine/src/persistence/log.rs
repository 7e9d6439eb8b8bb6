//! EventLog trait definition

use async_trait::async_trait;
use uuid::Uuid;

use crate::event::{EventRecord, RunEvent};

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Run not found
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Append position did not match the log (optimistic concurrency)
    #[error("sequence conflict: expected {expected}, log is at {actual}")]
    SequenceConflict { expected: u64, actual: u64 },

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Append-only, strictly ordered event log for runs
///
/// The log is the durable source of truth. Implementations must guarantee:
/// sequence numbers per run are strictly increasing and gapless starting
/// at 1; an appended batch is atomic (all events or none); written events
/// are immutable.
///
/// Each run has exactly one writer (its coordinator), so `expected_sequence`
/// conflicts indicate an ownership bug rather than a race to be retried.
#[async_trait]
pub trait EventLog: Send + Sync + 'static {
    /// Append a batch of events atomically
    ///
    /// `expected_sequence` must equal the run's current highest sequence
    /// number (0 for a new run). Returns the new highest sequence number.
    async fn append(
        &self,
        run_id: Uuid,
        expected_sequence: u64,
        events: Vec<RunEvent>,
    ) -> Result<u64, StoreError>;

    /// Read events with `sequence_number > after_sequence`, in order
    async fn read(&self, run_id: Uuid, after_sequence: u64)
        -> Result<Vec<EventRecord>, StoreError>;

    /// The run's highest persisted sequence number (0 if none)
    async fn latest_sequence(&self, run_id: Uuid) -> Result<u64, StoreError>;
}
