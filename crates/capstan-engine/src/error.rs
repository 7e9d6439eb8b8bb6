//! Run-level error values
//!
//! A [`RunError`] is the serializable failure record a run carries into its
//! terminal `failed` state and into `task_failed`/`run_failed` events. It
//! always names the error kind and, where known, the node and step it
//! originated at.

use serde::{Deserialize, Serialize};

/// Classification of a run failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunErrorKind {
    /// Malformed definition surfaced at run time; indicates a loader that
    /// skipped validation
    Definition,

    /// A declared mapping path was absent from its source document
    Mapping,

    /// An invoked action failed and policy did not absorb it
    Action,

    /// A task exhausted its retry attempts
    RetryExhausted,

    /// A task or dispatch exceeded its time bound
    Timeout,

    /// No outgoing transition was eligible from a non-terminal node
    NoEligibleTransition,

    /// The run could not be reconstructed from its snapshot and events
    Recovery,
}

impl std::fmt::Display for RunErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Definition => "definition",
            Self::Mapping => "mapping",
            Self::Action => "action",
            Self::RetryExhausted => "retry_exhausted",
            Self::Timeout => "timeout",
            Self::NoEligibleTransition => "no_eligible_transition",
            Self::Recovery => "recovery",
        };
        f.write_str(name)
    }
}

/// The failure record carried by a failed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    /// What went wrong
    pub kind: RunErrorKind,

    /// Node at which the failure occurred, when known
    pub node_id: Option<String>,

    /// Step ordinal at which the failure occurred, when known
    pub step: Option<u32>,

    /// Human-readable description
    pub message: String,
}

impl RunError {
    /// Create a new error with no location
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            node_id: None,
            step: None,
            message: message.into(),
        }
    }

    /// Attach the node the failure occurred at
    pub fn at_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Attach the step ordinal the failure occurred at
    pub fn at_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(node) = &self.node_id {
            write!(f, " (node {node}")?;
            if let Some(step) = self.step {
                write!(f, ", step {step}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunError {}
