//! Run control surface
//!
//! [`Engine`] is the in-process boundary through which runs are started,
//! observed, cancelled, awaited, and recovered. Transports (HTTP, queues)
//! are the embedder's concern; everything here is plain async calls over
//! per-run channels. Each started run gets its own coordinator task; the
//! engine only keeps the channel handles.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{info, instrument};
use uuid::Uuid;

use capstan_model::DefinitionError;

use crate::config::EngineConfig;
use crate::coordinator::{ControlMsg, RunCoordinator, RunStatusView};
use crate::error::{RunError, RunErrorKind};
use crate::event::{EventRecord, RunEvent};
use crate::executor::{ActionInvoker, TaskExecutor};
use crate::loader::{DefinitionLoader, LoaderError, RunDefinitions};
use crate::persistence::{
    BufferConfig, BufferedEventLog, EventLog, SnapshotStore, StoreError,
};
use crate::state::{RunState, RunStatus};

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition validation error
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// Definition loading error
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),

    /// Persistence error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Run not known to this engine instance
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Operation requires a live run but the run already finished
    #[error("run {0} is already in a terminal state")]
    RunFinished(Uuid),

    /// Recovery requested for a run that is still being driven
    #[error("run {0} is still active")]
    RunActive(Uuid),

    /// Run input failed schema validation
    #[error("input missing required paths: {}", .0.join(", "))]
    InvalidInput(Vec<String>),

    /// Awaited run failed
    #[error("run failed: {0}")]
    RunFailed(RunError),

    /// Awaited run was cancelled
    #[error("run cancelled: {0}")]
    RunCancelled(String),

    /// The run could not be reconstructed; operator intervention required
    #[error("recovery failed: {0}")]
    Recovery(String),
}

/// Channel handles for one run
struct RunHandle {
    control_tx: mpsc::Sender<ControlMsg>,
    status_rx: watch::Receiver<RunStatusView>,
}

/// The workflow engine: starts, observes, and recovers runs
///
/// # Example
///
/// ```ignore
/// use capstan_engine::prelude::*;
///
/// let engine = Engine::new(loader, invoker, log, snapshots);
/// let run_id = engine.start("crawl", 1, json!({"url": "http://x"})).await?;
/// let output = engine.wait(run_id).await?;
/// ```
pub struct Engine {
    loader: Arc<dyn DefinitionLoader>,
    invoker: Arc<dyn ActionInvoker>,
    log: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    config: EngineConfig,
    runs: DashMap<Uuid, RunHandle>,
}

impl Engine {
    /// Create an engine with the default configuration
    pub fn new(
        loader: Arc<dyn DefinitionLoader>,
        invoker: Arc<dyn ActionInvoker>,
        log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
    ) -> Self {
        Self::with_config(loader, invoker, log, snapshots, EngineConfig::default())
    }

    /// Create an engine with a custom configuration
    pub fn with_config(
        loader: Arc<dyn DefinitionLoader>,
        invoker: Arc<dyn ActionInvoker>,
        log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            loader,
            invoker,
            log,
            snapshots,
            config,
            runs: DashMap::new(),
        }
    }

    /// Start a run of a workflow definition
    ///
    /// Resolves and pins the definition bundle, validates the input
    /// against the definition's input schema, and spawns the coordinator.
    /// Returns as soon as the run is accepted; use [`Engine::wait`] for
    /// the outcome.
    #[instrument(skip(self, input))]
    pub async fn start(
        &self,
        workflow_id: &str,
        version: u32,
        input: Value,
    ) -> Result<Uuid, EngineError> {
        let defs = RunDefinitions::load(self.loader.as_ref(), workflow_id, version).await?;

        if let Some(schema) = &defs.workflow.input_schema {
            let missing = schema.missing_paths(&input);
            if !missing.is_empty() {
                return Err(EngineError::InvalidInput(missing));
            }
        }

        let run_id = Uuid::now_v7();
        let (handle, coordinator) = self.build_coordinator(run_id, defs, RunState::default(), 0);
        self.runs.insert(run_id, handle);
        tokio::spawn(coordinator.run_new(input));

        info!(%run_id, workflow_id, version, "run accepted");
        Ok(run_id)
    }

    /// Current status summary of a run
    pub fn status(&self, run_id: Uuid) -> Result<RunStatusView, EngineError> {
        let handle = self
            .runs
            .get(&run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        let view = handle.status_rx.borrow().clone();
        Ok(view)
    }

    /// Request cancellation of a live run
    ///
    /// Returns once the request is delivered; the run transitions to
    /// `cancelled` asynchronously. Any outstanding task receives a
    /// best-effort cancellation signal.
    pub async fn cancel(&self, run_id: Uuid, reason: impl Into<String>) -> Result<(), EngineError> {
        let (control_tx, terminal) = {
            let handle = self
                .runs
                .get(&run_id)
                .ok_or(EngineError::RunNotFound(run_id))?;
            let control_tx = handle.control_tx.clone();
            let is_terminal = handle.status_rx.borrow().status.is_terminal();
            (control_tx, is_terminal)
        };
        if terminal {
            return Err(EngineError::RunFinished(run_id));
        }

        control_tx
            .send(ControlMsg::Cancel {
                reason: reason.into(),
            })
            .await
            .map_err(|_| EngineError::RunFinished(run_id))
    }

    /// Wait for a run's terminal state: output on completion, error on
    /// failure or cancellation
    ///
    /// Driven by the run's status channel, not by polling the run itself;
    /// the underlying progression stays event-applied.
    pub async fn wait(&self, run_id: Uuid) -> Result<Value, EngineError> {
        let mut status_rx = {
            let handle = self
                .runs
                .get(&run_id)
                .ok_or(EngineError::RunNotFound(run_id))?;
            handle.status_rx.clone()
        };

        loop {
            let view = status_rx.borrow_and_update().clone();
            match view.status {
                RunStatus::Completed => {
                    return Ok(view.output.unwrap_or(Value::Null));
                }
                RunStatus::Failed => {
                    let error = view.error.unwrap_or_else(|| {
                        RunError::new(RunErrorKind::Recovery, "run failed without error detail")
                    });
                    return Err(EngineError::RunFailed(error));
                }
                RunStatus::Cancelled => {
                    return Err(EngineError::RunCancelled(
                        view.cancel_reason.unwrap_or_else(|| "cancelled".to_string()),
                    ));
                }
                _ => {
                    if status_rx.changed().await.is_err() {
                        return Err(EngineError::Recovery(
                            "coordinator stopped before reaching a terminal state".to_string(),
                        ));
                    }
                }
            }
        }
    }

    /// The run's full event history, oldest first
    pub async fn events(&self, run_id: Uuid) -> Result<Vec<EventRecord>, EngineError> {
        Ok(self.log.read(run_id, 0).await?)
    }

    /// Reconstruct an interrupted run and resume driving it
    ///
    /// Loads the latest snapshot (or starts from nothing), replays every
    /// event past it in order, and resumes. A gap in the event sequence or
    /// an event that fails to apply is fatal: the run is surfaced as
    /// unrecoverable rather than resumed into a wrong state.
    #[instrument(skip(self))]
    pub async fn recover(&self, run_id: Uuid) -> Result<RunStatus, EngineError> {
        if let Some(handle) = self.runs.get(&run_id) {
            if !handle.status_rx.borrow().status.is_terminal() {
                return Err(EngineError::RunActive(run_id));
            }
        }

        let snapshot = self.snapshots.get_latest(run_id).await?;
        let (mut state, after, workflow_ref) = match snapshot {
            Some(s) => (
                s.state,
                s.after_sequence_number,
                Some((s.workflow_id, s.workflow_version)),
            ),
            None => (RunState::default(), 0, None),
        };

        let records = match self.log.read(run_id, after).await {
            Ok(records) => records,
            // A missing log with a snapshot present means events up to the
            // snapshot were trimmed by retention; the snapshot stands alone.
            Err(StoreError::RunNotFound(_)) if workflow_ref.is_some() => Vec::new(),
            Err(StoreError::RunNotFound(_)) => return Err(EngineError::RunNotFound(run_id)),
            Err(e) => return Err(e.into()),
        };

        if workflow_ref.is_none() && records.is_empty() {
            return Err(EngineError::RunNotFound(run_id));
        }

        let (workflow_id, workflow_version) = match workflow_ref {
            Some(found) => found,
            None => match &records[0].event {
                RunEvent::RunStarted {
                    workflow_id,
                    workflow_version,
                    ..
                } => (workflow_id.clone(), *workflow_version),
                other => {
                    return Err(EngineError::Recovery(format!(
                        "first event is {other:?}, expected run_started"
                    )))
                }
            },
        };

        let defs = RunDefinitions::load(self.loader.as_ref(), &workflow_id, workflow_version)
            .await?;

        let mut expected = after;
        for record in &records {
            expected += 1;
            if record.sequence_number != expected {
                return Err(EngineError::Recovery(format!(
                    "gap in event sequence: expected {expected}, found {}",
                    record.sequence_number
                )));
            }
            state.apply(&record.event, &defs.workflow).map_err(|e| {
                EngineError::Recovery(format!(
                    "replay failed at sequence {}: {e}",
                    record.sequence_number
                ))
            })?;
        }
        let persisted = expected;

        let status = state.status;
        info!(%run_id, %status, replayed = records.len(), "run reconstructed");

        let (handle, coordinator) = self.build_coordinator(run_id, defs, state, persisted);
        self.runs.insert(run_id, handle);
        if !status.is_terminal() {
            tokio::spawn(coordinator.resume());
        }
        Ok(status)
    }

    fn build_coordinator(
        &self,
        run_id: Uuid,
        defs: RunDefinitions,
        state: RunState,
        persisted: u64,
    ) -> (RunHandle, RunCoordinator) {
        let (control_tx, control_rx) = mpsc::channel(8);
        let (status_tx, status_rx) = watch::channel(RunStatusView::from_state(run_id, &state));

        let buffer = BufferedEventLog::resume(
            self.log.clone(),
            run_id,
            BufferConfig {
                max_batch: self.config.event_batch_size,
                linger: self.config.event_flush_interval,
            },
            persisted,
        );
        let executor = Arc::new(TaskExecutor::new(self.invoker.clone()));

        let coordinator = RunCoordinator::new(
            run_id,
            defs,
            executor,
            buffer,
            self.snapshots.clone(),
            self.config.clone(),
            state,
            status_tx,
            control_rx,
        );
        (
            RunHandle {
                control_tx,
                status_rx,
            },
            coordinator,
        )
    }
}
