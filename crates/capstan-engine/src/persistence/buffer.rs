//! Write-behind event buffering
//!
//! A coordinator appends events far more often than a durable backend
//! wants to be written. [`BufferedEventLog`] batches a single run's events
//! and flushes them in bounded groups, trading a bounded replay gap on
//! crash (at most one unflushed batch) for write throughput. The flush of
//! a batch is atomic because the underlying [`EventLog`] append is.
//!
//! Sequence numbers are assigned at buffer time: the coordinator is the
//! sole writer for its run, so the numbers the backend will assign are
//! known in advance and the gapless invariant is preserved.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use uuid::Uuid;

use crate::event::RunEvent;
use crate::persistence::log::{EventLog, StoreError};

/// Buffering configuration
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Flush when this many events are pending
    pub max_batch: usize,

    /// Flush at least this often while the run is parked
    pub linger: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch: 16,
            linger: Duration::from_millis(200),
        }
    }
}

/// Per-run write-behind buffer over an [`EventLog`]
///
/// Owned by exactly one coordinator; not shared, not locked.
pub struct BufferedEventLog {
    inner: Arc<dyn EventLog>,
    run_id: Uuid,
    config: BufferConfig,
    pending: Vec<RunEvent>,

    /// Highest sequence number assigned (flushed or pending)
    assigned: u64,

    /// Highest sequence number known persisted
    flushed: u64,
}

impl BufferedEventLog {
    /// Create a buffer for a new run (no events persisted yet)
    pub fn new(inner: Arc<dyn EventLog>, run_id: Uuid, config: BufferConfig) -> Self {
        Self::resume(inner, run_id, config, 0)
    }

    /// Create a buffer for a run whose log already holds `persisted` events
    pub fn resume(
        inner: Arc<dyn EventLog>,
        run_id: Uuid,
        config: BufferConfig,
        persisted: u64,
    ) -> Self {
        Self {
            inner,
            run_id,
            config,
            pending: Vec::new(),
            assigned: persisted,
            flushed: persisted,
        }
    }

    /// Buffer one event, returning its assigned sequence number
    ///
    /// Flushes inline when the pending batch reaches `max_batch`.
    pub async fn append(&mut self, event: RunEvent) -> Result<u64, StoreError> {
        self.pending.push(event);
        self.assigned += 1;
        let sequence = self.assigned;

        if self.pending.len() >= self.config.max_batch {
            self.flush().await?;
        }
        Ok(sequence)
    }

    /// Flush all pending events to the backend
    ///
    /// Returns the persisted watermark. The batch lands atomically at the
    /// expected position; a conflict means the run has a second writer and
    /// is not retried.
    pub async fn flush(&mut self) -> Result<u64, StoreError> {
        if self.pending.is_empty() {
            return Ok(self.flushed);
        }

        let batch = std::mem::take(&mut self.pending);
        let count = batch.len();
        self.flushed = self.inner.append(self.run_id, self.flushed, batch).await?;
        debug!(run_id = %self.run_id, count, watermark = self.flushed, "flushed event batch");
        Ok(self.flushed)
    }

    /// Highest sequence number known persisted
    pub fn flushed_sequence(&self) -> u64 {
        self.flushed
    }

    /// Highest sequence number assigned, including unflushed events
    pub fn assigned_sequence(&self) -> u64 {
        self.assigned
    }

    /// Number of buffered, not yet persisted events
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The linger interval for the owning coordinator's flush timer
    pub fn linger(&self) -> Duration {
        self.config.linger
    }
}
