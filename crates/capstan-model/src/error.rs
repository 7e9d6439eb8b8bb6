//! Definition-time and projection errors

use thiserror::Error;

/// Errors detected while validating a workflow or task definition
///
/// These are rejected when a definition is loaded or deployed, never at
/// run time. A definition that passes `validate()` cannot produce a
/// `DefinitionError` during execution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    /// A node id appears more than once in the definition
    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    /// The declared start node does not exist
    #[error("start node not found: {0}")]
    StartNodeNotFound(String),

    /// A transition references a node that does not exist
    #[error("transition {from} -> {to} references unknown node {missing}")]
    DanglingTransition {
        from: String,
        to: String,
        missing: String,
    },

    /// A cycle exists in which no edge carries a condition
    ///
    /// Such a cycle can never terminate: every traversal of it is
    /// unconditional. The cycle is reported by the ids of its nodes in
    /// traversal order.
    #[error("unguarded cycle through nodes: {}", .0.join(" -> "))]
    UnguardedCycle(Vec<String>),

    /// A task's step ordinals are not unique and dense from 0
    #[error("task {task}: step ordinals must be dense 0..n-1, found {found}")]
    InvalidStepOrdinals { task: String, found: u32 },

    /// A task has no steps
    #[error("task {0} has no steps")]
    EmptyTask(String),

    /// A condition expression could not be parsed
    #[error("invalid condition expression {expr:?}: {reason}")]
    InvalidCondition { expr: String, reason: String },
}

/// A declared path was absent from the source document during projection
///
/// Mapping errors indicate a malformed definition or an upstream step that
/// did not produce the value a mapping depends on. They abort the run
/// immediately and are never retried, regardless of any `on_failure`
/// configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("mapping source path not found: {path}")]
pub struct MappingError {
    /// The dotted source path that could not be resolved
    pub path: String,
}

impl MappingError {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}
