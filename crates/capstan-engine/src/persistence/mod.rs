//! Persistence layer: event log, snapshots, and write-behind buffering

mod buffer;
mod log;
mod memory;
mod snapshot;

pub use buffer::{BufferConfig, BufferedEventLog};
pub use log::{EventLog, StoreError};
pub use memory::{InMemoryEventLog, InMemorySnapshotStore};
pub use snapshot::{Snapshot, SnapshotStore};
