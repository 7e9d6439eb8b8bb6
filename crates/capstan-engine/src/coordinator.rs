//! Run coordination
//!
//! One [`RunCoordinator`] owns one running workflow instance: it holds the
//! authoritative in-memory state, selects and fires transitions, dispatches
//! tasks to the executor, writes events through the buffered log, triggers
//! snapshots, and services cancellation. It is the sole writer of its run's
//! context; coordinators for different runs share nothing and execute fully
//! independently.
//!
//! The dispatch boundary is message-passing: the executor runs as a spawned
//! task, the coordinator parks in `waiting_task` and resumes on the result,
//! a cancel request, the dispatch deadline, or a flush tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use capstan_model::project;

use crate::config::EngineConfig;
use crate::error::{RunError, RunErrorKind};
use crate::event::RunEvent;
use crate::executor::{TaskExecutor, TaskFailure, TaskFailureKind, TaskResult};
use crate::loader::RunDefinitions;
use crate::persistence::{BufferedEventLog, Snapshot, SnapshotStore, StoreError};
use crate::state::{RunState, RunStatus};

/// Requests the control surface sends a live coordinator
#[derive(Debug)]
pub(crate) enum ControlMsg {
    /// Stop the run; outstanding work receives a best-effort cancellation
    /// signal
    Cancel { reason: String },
}

/// Published summary of a run, updated on every state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusView {
    pub run_id: Uuid,
    pub status: RunStatus,

    /// Current node, while the run is live
    pub node: Option<String>,

    /// Terminal error, once failed
    pub error: Option<RunError>,

    /// Terminal output, once completed
    pub output: Option<Value>,

    /// Cancellation reason, once cancelled
    pub cancel_reason: Option<String>,
}

impl RunStatusView {
    pub(crate) fn from_state(run_id: Uuid, state: &RunState) -> Self {
        Self {
            run_id,
            status: state.status,
            node: state.token.clone(),
            error: state.error.clone(),
            output: state.output.clone(),
            cancel_reason: state.cancel_reason.clone(),
        }
    }
}

/// A dispatch the coordinator is parked on
struct OutstandingTask {
    node_id: String,
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
    handle: JoinHandle<TaskResult>,
}

/// Drives one run to a terminal state
pub(crate) struct RunCoordinator {
    run_id: Uuid,
    defs: RunDefinitions,
    executor: Arc<TaskExecutor>,
    log: BufferedEventLog,
    snapshots: Arc<dyn SnapshotStore>,
    config: EngineConfig,
    state: RunState,
    outstanding: Option<OutstandingTask>,
    events_since_snapshot: u32,
    status_tx: watch::Sender<RunStatusView>,
    control_rx: mpsc::Receiver<ControlMsg>,
}

impl RunCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        run_id: Uuid,
        defs: RunDefinitions,
        executor: Arc<TaskExecutor>,
        log: BufferedEventLog,
        snapshots: Arc<dyn SnapshotStore>,
        config: EngineConfig,
        state: RunState,
        status_tx: watch::Sender<RunStatusView>,
        control_rx: mpsc::Receiver<ControlMsg>,
    ) -> Self {
        Self {
            run_id,
            defs,
            executor,
            log,
            snapshots,
            config,
            state,
            outstanding: None,
            events_since_snapshot: 0,
            status_tx,
            control_rx,
        }
    }

    /// Start a fresh run with validated input and drive it to completion
    pub(crate) async fn run_new(mut self, input: Value) {
        info!(run_id = %self.run_id, workflow = %self.defs.workflow.id, "starting run");

        let started = RunEvent::RunStarted {
            workflow_id: self.defs.workflow.id.clone(),
            workflow_version: self.defs.workflow.version,
            input,
        };
        if let Err(e) = self.apply_and_append(started).await {
            self.fail_locally(&e);
            self.publish_status();
            return;
        }

        self.drive().await;
    }

    /// Resume a recovered run from its reconstructed state
    ///
    /// If the run was interrupted in `waiting_task`, the recorded dispatch
    /// is re-issued with the same dispatch id and input. The action
    /// boundary tolerates at-least-once invocation, so a task that had
    /// already run to completion without its result being persisted simply
    /// runs again.
    pub(crate) async fn resume(mut self) {
        info!(run_id = %self.run_id, status = %self.state.status, "resuming run");

        if self.state.status == RunStatus::WaitingTask {
            match self.state.pending_dispatch.clone() {
                Some(pending) => {
                    debug!(
                        run_id = %self.run_id,
                        node_id = %pending.node_id,
                        dispatch_id = %pending.dispatch_id,
                        "re-dispatching in-flight task"
                    );
                    if let Err(error) =
                        self.spawn_dispatch(pending.node_id, pending.dispatch_id, pending.input)
                    {
                        let event = RunEvent::RunFailed { error };
                        if let Err(e) = self.apply_and_append(event).await {
                            self.fail_locally(&e);
                        }
                    }
                }
                None => {
                    let error = RunError::new(
                        RunErrorKind::Recovery,
                        "waiting for a task but no dispatch was recorded",
                    );
                    let event = RunEvent::RunFailed { error };
                    if let Err(e) = self.apply_and_append(event).await {
                        self.fail_locally(&e);
                    }
                }
            }
        }

        self.drive().await;
    }

    /// The drive loop: alternate between advancing and waiting until the
    /// run reaches a terminal state
    async fn drive(mut self) {
        loop {
            self.publish_status();
            let result = match self.state.status {
                RunStatus::Running => self.step().await,
                RunStatus::WaitingTask => self.await_task().await,
                RunStatus::Pending
                | RunStatus::Completed
                | RunStatus::Failed
                | RunStatus::Cancelled => break,
            };
            if let Err(e) = result {
                self.fail_locally(&e);
                break;
            }
        }

        if let Err(e) = self.log.flush().await {
            error!(run_id = %self.run_id, error = %e, "final event flush failed");
        }
        self.publish_status();
        info!(run_id = %self.run_id, status = %self.state.status, "run finished");
    }

    /// One advance while `running`
    async fn step(&mut self) -> Result<(), StoreError> {
        // Service cancel requests before dispatching more work.
        if let Ok(ControlMsg::Cancel { reason }) = self.control_rx.try_recv() {
            return self.apply_and_append(RunEvent::RunCancelled { reason }).await;
        }

        if let Some(error) = self.state.last_failure.clone() {
            return self.apply_and_append(RunEvent::RunFailed { error }).await;
        }

        let Some(node_id) = self.state.token.clone() else {
            let error = RunError::new(RunErrorKind::Recovery, "running without a token");
            return self.apply_and_append(RunEvent::RunFailed { error }).await;
        };

        if !self.state.node_task_done {
            return self.enter_node(&node_id).await;
        }

        if self.defs.index.is_terminal(&node_id) {
            let output = self.state.context.output.clone();
            info!(run_id = %self.run_id, node_id = %node_id, "run reached terminal node");
            return self.apply_and_append(RunEvent::RunCompleted { output }).await;
        }

        let target = self
            .defs
            .index
            .select(&node_id, &self.state.context)
            .map(|t| t.to_node.clone());
        match target {
            Some(target) => {
                debug!(run_id = %self.run_id, from = %node_id, to = %target, "transition selected");
                self.enter_node(&target).await
            }
            None => {
                let error = RunError::new(
                    RunErrorKind::NoEligibleTransition,
                    format!("no eligible transition from node {node_id}"),
                )
                .at_node(node_id);
                self.apply_and_append(RunEvent::RunFailed { error }).await
            }
        }
    }

    /// Move the token onto a node and dispatch its task
    async fn enter_node(&mut self, node_id: &str) -> Result<(), StoreError> {
        let Some((task_ref, input_mapping)) = self
            .defs
            .workflow
            .node(node_id)
            .map(|n| (n.task.clone(), n.input_mapping.clone()))
        else {
            let error = RunError::new(
                RunErrorKind::Definition,
                format!("node {node_id} not in definition"),
            )
            .at_node(node_id);
            return self.apply_and_append(RunEvent::RunFailed { error }).await;
        };

        let input = match project(&input_mapping, &self.state.context) {
            Ok(input) => input,
            Err(e) => {
                let error = RunError::new(RunErrorKind::Mapping, e.to_string()).at_node(node_id);
                return self.apply_and_append(RunEvent::RunFailed { error }).await;
            }
        };

        let dispatch_id = Uuid::now_v7();
        let event = RunEvent::TaskDispatched {
            node_id: node_id.to_string(),
            task_id: task_ref.id.clone(),
            task_version: task_ref.version,
            input: input.clone(),
            dispatch_id,
        };
        self.apply_and_append(event).await?;

        if let Err(error) = self.spawn_dispatch(node_id.to_string(), dispatch_id, input) {
            return self.apply_and_append(RunEvent::RunFailed { error }).await;
        }
        Ok(())
    }

    /// Spawn the executor for a dispatch and record it as outstanding
    fn spawn_dispatch(
        &mut self,
        node_id: String,
        dispatch_id: Uuid,
        input: Value,
    ) -> Result<(), RunError> {
        let task_ref = self
            .defs
            .workflow
            .node(&node_id)
            .map(|n| n.task.clone())
            .ok_or_else(|| {
                RunError::new(
                    RunErrorKind::Definition,
                    format!("node {node_id} not in definition"),
                )
                .at_node(node_id.clone())
            })?;
        let task = self.defs.task(&task_ref).ok_or_else(|| {
            RunError::new(
                RunErrorKind::Definition,
                format!("task {task_ref} was not resolved at run start"),
            )
            .at_node(node_id.clone())
        })?;

        let cancelled = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + Duration::from_millis(task.timeout_ms);

        let executor = self.executor.clone();
        let run_id = self.run_id;
        let flag = cancelled.clone();
        let task_node = node_id.clone();
        let handle = tokio::spawn(async move {
            executor
                .execute(run_id, &task_node, dispatch_id, &task, input, flag)
                .await
        });

        self.outstanding = Some(OutstandingTask {
            node_id,
            cancelled,
            deadline,
            handle,
        });
        Ok(())
    }

    /// Park in `waiting_task` until the dispatch resolves
    ///
    /// While parked the coordinator still services cancellation, the
    /// dispatch deadline, and periodic event-buffer flushes.
    async fn await_task(&mut self) -> Result<(), StoreError> {
        let Some(mut outstanding) = self.outstanding.take() else {
            let error = RunError::new(
                RunErrorKind::Recovery,
                "waiting for a task but nothing is dispatched",
            );
            return self.apply_and_append(RunEvent::RunFailed { error }).await;
        };

        let linger = self.log.linger();
        let mut flush_timer = tokio::time::interval_at(Instant::now() + linger, linger);
        let mut control_open = true;

        loop {
            tokio::select! {
                join_result = &mut outstanding.handle => {
                    return self.on_task_result(outstanding.node_id, join_result, false).await;
                }

                msg = self.control_rx.recv(), if control_open => {
                    match msg {
                        Some(ControlMsg::Cancel { reason }) => {
                            return self.cancel_waiting(outstanding, reason).await;
                        }
                        None => control_open = false,
                    }
                }

                _ = tokio::time::sleep_until(outstanding.deadline) => {
                    return self.expire_dispatch(outstanding).await;
                }

                _ = flush_timer.tick() => {
                    self.log.flush().await?;
                }
            }
        }
    }

    /// Handle the executor's result for the outstanding dispatch
    async fn on_task_result(
        &mut self,
        node_id: String,
        join_result: Result<TaskResult, tokio::task::JoinError>,
        after_deadline: bool,
    ) -> Result<(), StoreError> {
        let result = match join_result {
            Ok(result) => result,
            Err(join_error) => Err(TaskFailure {
                kind: TaskFailureKind::Action,
                step: None,
                message: format!("executor task did not complete: {join_error}"),
                attempts: 0,
            }),
        };

        match result {
            Ok(output) => {
                debug!(run_id = %self.run_id, node_id = %node_id, "task completed");
                self.apply_and_append(RunEvent::TaskCompleted { node_id, output })
                    .await
            }
            Err(failure) => {
                let error = if after_deadline
                    && matches!(
                        failure.kind,
                        TaskFailureKind::Cancelled | TaskFailureKind::Timeout
                    ) {
                    RunError::new(
                        RunErrorKind::Timeout,
                        format!("dispatch deadline expired: {failure}"),
                    )
                    .at_node(node_id.clone())
                } else {
                    failure.into_run_error(&node_id)
                };
                warn!(run_id = %self.run_id, node_id = %node_id, %error, "task failed");
                self.apply_and_append(RunEvent::TaskFailed { node_id, error })
                    .await
            }
        }
    }

    /// Dispatch deadline passed: signal cancellation, wait out the grace
    /// period, then synthesize a timeout failure so the run is never stuck
    async fn expire_dispatch(&mut self, mut outstanding: OutstandingTask) -> Result<(), StoreError> {
        warn!(
            run_id = %self.run_id,
            node_id = %outstanding.node_id,
            "dispatch deadline expired, signalling cancellation"
        );
        outstanding.cancelled.store(true, Ordering::Relaxed);

        match tokio::time::timeout(self.config.dispatch_grace, &mut outstanding.handle).await {
            Ok(join_result) => {
                self.on_task_result(outstanding.node_id, join_result, true)
                    .await
            }
            Err(_) => {
                outstanding.handle.abort();
                let error = RunError::new(
                    RunErrorKind::Timeout,
                    format!(
                        "executor did not stop within the {:?} grace period",
                        self.config.dispatch_grace
                    ),
                )
                .at_node(outstanding.node_id.clone());
                self.apply_and_append(RunEvent::TaskFailed {
                    node_id: outstanding.node_id,
                    error,
                })
                .await
            }
        }
    }

    /// Cancel while a task is outstanding
    async fn cancel_waiting(
        &mut self,
        outstanding: OutstandingTask,
        reason: String,
    ) -> Result<(), StoreError> {
        info!(run_id = %self.run_id, node_id = %outstanding.node_id, "cancelling run");
        outstanding.cancelled.store(true, Ordering::Relaxed);

        // Give the executor the grace period to observe the signal, then
        // stop it outright. The run itself does not wait for this.
        let grace = self.config.dispatch_grace;
        let mut handle = outstanding.handle;
        tokio::spawn(async move {
            if tokio::time::timeout(grace, &mut handle).await.is_err() {
                handle.abort();
            }
        });

        self.apply_and_append(RunEvent::RunCancelled { reason }).await
    }

    /// Apply an event to the in-memory state, then append it to the log
    ///
    /// State application happens first: an event whose effect cannot be
    /// applied (an output projection onto a missing path) must not be
    /// persisted. The failed projection is recorded as a `task_failed`
    /// instead, which always applies.
    async fn apply_and_append(&mut self, event: RunEvent) -> Result<(), StoreError> {
        let mut next = self.state.clone();
        match next.apply(&event, &self.defs.workflow) {
            Ok(()) => {
                let terminal = event.is_terminal();
                self.state = next;
                self.log.append(event).await?;
                // The log must be complete before anyone can observe a
                // terminal status.
                if terminal {
                    self.log.flush().await?;
                }
                self.events_since_snapshot += 1;
                self.maybe_snapshot().await?;
                self.publish_status();
                Ok(())
            }
            Err(error) => {
                let node_id = event.node_id().unwrap_or_default().to_string();
                warn!(run_id = %self.run_id, node_id = %node_id, %error, "event not applicable");
                let failed = RunEvent::TaskFailed { node_id, error };
                Box::pin(self.apply_and_append(failed)).await
            }
        }
    }

    /// Write a snapshot if enough events accumulated since the last one
    ///
    /// The buffer is flushed first so the snapshot's position never
    /// exceeds the highest persisted sequence number. The write itself is
    /// spawned and never blocks the drive loop.
    async fn maybe_snapshot(&mut self) -> Result<(), StoreError> {
        if self.config.snapshot_interval == 0
            || self.events_since_snapshot < self.config.snapshot_interval
        {
            return Ok(());
        }

        self.log.flush().await?;
        let snapshot = Snapshot {
            run_id: self.run_id,
            workflow_id: self.defs.workflow.id.clone(),
            workflow_version: self.defs.workflow.version,
            state: self.state.clone(),
            after_sequence_number: self.log.flushed_sequence(),
            taken_at: Utc::now(),
        };
        debug!(
            run_id = %self.run_id,
            after_sequence = snapshot.after_sequence_number,
            "writing snapshot"
        );

        let store = self.snapshots.clone();
        tokio::spawn(async move {
            if let Err(error) = store.put(snapshot).await {
                warn!(%error, "snapshot write failed");
            }
        });
        self.events_since_snapshot = 0;
        Ok(())
    }

    /// Persistence failed: the run cannot make durable progress
    ///
    /// The failure is reflected in the in-memory status so `wait` callers
    /// unblock; the log keeps whatever was flushed, and the run can be
    /// re-driven with `recover` once the backend is healthy.
    fn fail_locally(&mut self, error: &StoreError) {
        error!(run_id = %self.run_id, %error, "persistence failure, abandoning run");
        self.state.status = RunStatus::Failed;
        self.state.error = Some(RunError::new(
            RunErrorKind::Recovery,
            format!("persistence failure: {error}"),
        ));
    }

    fn publish_status(&self) {
        self.status_tx
            .send_replace(RunStatusView::from_state(self.run_id, &self.state));
    }
}
