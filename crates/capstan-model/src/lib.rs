//! Data model for the capstan workflow engine
//!
//! This crate holds everything the engine evaluates but never mutates at
//! run time: workflow graphs ([`WorkflowDefinition`]), task step lists
//! ([`TaskDefinition`]), the `{input, state, output}` context documents
//! runs and tasks carry, and the declarative path mappings and conditions
//! that route data between them.
//!
//! Everything here is pure and synchronous. Definitions are immutable per
//! (id, version) pair and validated once, at definition time; the engine
//! assumes a validated definition and never re-checks structural
//! invariants while a run is in flight.

pub mod condition;
pub mod context;
pub mod definition;
pub mod error;
pub mod graph;
pub mod mapping;
pub mod retry;
pub mod task;

pub use condition::{CompareOp, Condition};
pub use context::ContextDocument;
pub use definition::{InputSchema, Node, TaskRef, Transition, WorkflowDefinition};
pub use error::{DefinitionError, MappingError};
pub use graph::TransitionIndex;
pub use mapping::{merge, project, FieldMapping};
pub use retry::{Backoff, RetryPolicy};
pub use task::{OnFailure, Step, StepBranch, StepCondition, TaskDefinition};
