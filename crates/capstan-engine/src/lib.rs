//! # Capstan Engine
//!
//! A durable workflow-execution engine: given a declarative graph of nodes
//! and transitions, it runs instances of that graph to completion, routing
//! data between steps and surviving process restarts without losing
//! progress.
//!
//! ## Features
//!
//! - **Event-sourced runs**: every state change is an event in an
//!   append-only, gapless log; run state is reconstructed by replay
//! - **Snapshot recovery**: periodic snapshots bound replay cost; a
//!   snapshot plus the event tail reconstructs the exact live state
//! - **Sequential task execution**: ordered steps with per-step failure
//!   policy, whole-task retry with backoff, and a whole-task time bound
//! - **Isolation per run**: one coordinator task per run, sole writer of
//!   its context; runs share nothing
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (control surface: start / status / cancel / wait /        │
//! │    recover, one RunCoordinator task per run)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                │                               │
//!                ▼                               ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │        RunCoordinator        │  │       TaskExecutor       │
//! │  (transition selection,      │──│  (ordered steps, retry,  │
//! │   event writing, snapshots,  │  │   timeout, ActionInvoker │
//! │   recovery, timeouts)        │  │   boundary)              │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               EventLog  +  SnapshotStore                     │
//! │   (append-only source of truth; snapshots as an              │
//! │    optimization, never authoritative on their own)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use capstan_engine::prelude::*;
//! use serde_json::json;
//!
//! let loader = Arc::new(InMemoryDefinitionLoader::new());
//! let actions = Arc::new(ActionRegistry::new());
//! actions.register("http_get", |_ctx, input| async move {
//!     Ok(json!({"body": "..."}))
//! });
//!
//! let engine = Engine::new(
//!     loader,
//!     actions,
//!     Arc::new(InMemoryEventLog::new()),
//!     Arc::new(InMemorySnapshotStore::new()),
//! );
//!
//! let run_id = engine.start("crawl", 1, json!({"url": "http://x"})).await?;
//! let output = engine.wait(run_id).await?;
//! ```

pub mod config;
pub mod control;
mod coordinator;
pub mod error;
pub mod event;
pub mod executor;
pub mod loader;
pub mod persistence;
pub mod state;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::control::{Engine, EngineError};
    pub use crate::coordinator::RunStatusView;
    pub use crate::error::{RunError, RunErrorKind};
    pub use crate::event::{EventRecord, RunEvent};
    pub use crate::executor::{
        ActionError, ActionInvoker, ActionRegistry, InvocationContext, TaskExecutor, TaskFailure,
        TaskFailureKind,
    };
    pub use crate::loader::{
        ActionSpec, DefinitionLoader, InMemoryDefinitionLoader, LoaderError, RunDefinitions,
    };
    pub use crate::persistence::{
        BufferConfig, BufferedEventLog, EventLog, InMemoryEventLog, InMemorySnapshotStore,
        Snapshot, SnapshotStore, StoreError,
    };
    pub use crate::state::{RunState, RunStatus};
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use control::{Engine, EngineError};
pub use coordinator::RunStatusView;
pub use error::{RunError, RunErrorKind};
pub use event::{EventRecord, RunEvent};
pub use executor::{ActionError, ActionInvoker, ActionRegistry, TaskExecutor};
pub use loader::{ActionSpec, DefinitionLoader, InMemoryDefinitionLoader, LoaderError};
pub use persistence::{EventLog, InMemoryEventLog, InMemorySnapshotStore, Snapshot, SnapshotStore};
pub use state::{RunState, RunStatus};
