//! Run events for persistence
//!
//! Events form the append-only log for a run. They are the durable source
//! of truth: run state is never persisted directly, it is reconstructed by
//! replaying events in sequence order (optionally on top of a snapshot).
//! Events are immutable once written and never reordered.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RunError;

/// A state-changing occurrence in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run was started with the given input
    RunStarted {
        /// Workflow definition the run executes
        workflow_id: String,

        /// Definition version, pinned for the run's lifetime
        workflow_version: u32,

        /// Validated input document
        input: Value,
    },

    /// A node's task was dispatched to the executor
    TaskDispatched {
        /// Node the token moved to
        node_id: String,

        /// Task definition reference
        task_id: String,
        task_version: u32,

        /// Projected task input
        input: Value,

        /// Dispatch identity; reused verbatim when recovery re-dispatches,
        /// so invokers can deduplicate at-least-once delivery
        dispatch_id: Uuid,
    },

    /// The dispatched task completed successfully
    TaskCompleted {
        /// Node whose task completed
        node_id: String,

        /// Raw task output, before output projection
        output: Value,
    },

    /// The dispatched task failed
    TaskFailed {
        /// Node whose task failed
        node_id: String,

        /// Failure details
        error: RunError,
    },

    /// The run reached a terminal node
    RunCompleted {
        /// The run's output document
        output: Value,
    },

    /// The run failed
    RunFailed {
        /// Failure details
        error: RunError,
    },

    /// The run was cancelled
    RunCancelled {
        /// Reason for cancellation
        reason: String,
    },
}

impl RunEvent {
    /// Get the node id if this is a task-related event
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::TaskDispatched { node_id, .. }
            | Self::TaskCompleted { node_id, .. }
            | Self::TaskFailed { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    /// Check if this event puts the run in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

/// One persisted event with its position in the run's log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Run the event belongs to
    pub run_id: Uuid,

    /// Strictly increasing, gapless per run; the first event is 1
    pub sequence_number: u64,

    /// Wall-clock time the event was persisted
    pub timestamp: DateTime<Utc>,

    /// The event itself
    pub event: RunEvent,
}
