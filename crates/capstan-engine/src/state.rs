//! Reconstructible per-run state
//!
//! [`RunState`] is everything a coordinator knows about its run: status,
//! context, token, and the outstanding dispatch if one is in flight. The
//! single mutation path is [`RunState::apply`], a deterministic function of
//! (state, event, definition) used identically by the live drive loop and
//! by replay; that is what makes replay reconstruct the exact live state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use capstan_model::{merge, ContextDocument, WorkflowDefinition};

use crate::error::{RunError, RunErrorKind};
use crate::event::RunEvent;

/// Lifecycle status of a run
///
/// `pending -> running -> waiting_task -> running -> {completed | failed |
/// cancelled}`. `waiting_task` is entered on dispatch and left when the
/// task's result event is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run created but no event applied yet
    #[default]
    Pending,

    /// Token is on a node whose task has finished; ready to advance
    Running,

    /// A task is dispatched and its result is awaited
    WaitingTask,

    /// Run reached a terminal node
    Completed,

    /// Run failed
    Failed,

    /// Run was cancelled
    Cancelled,
}

impl RunStatus {
    /// Whether the run can make no further progress
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingTask => "waiting_task",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The dispatch a run is parked on while in `waiting_task`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDispatch {
    /// Node the token is on
    pub node_id: String,

    /// Task definition reference
    pub task_id: String,
    pub task_version: u32,

    /// Projected task input, kept for recovery re-dispatch
    pub input: Value,

    /// Dispatch identity, reused verbatim on re-dispatch
    pub dispatch_id: Uuid,
}

/// Full reconstructible state of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Lifecycle status
    pub status: RunStatus,

    /// The authoritative `{input, state, output}` document
    pub context: ContextDocument,

    /// Current-node pointer; single active node in this engine
    pub token: Option<String>,

    /// Outstanding dispatch while in `waiting_task`
    pub pending_dispatch: Option<PendingDispatch>,

    /// Whether the token node's task has completed
    ///
    /// `false` while `running` means the token node was entered but its
    /// task has not been dispatched yet (only the start node, right after
    /// `run_started`); `true` means the node is done and the run is ready
    /// to advance along a transition.
    #[serde(default)]
    pub node_task_done: bool,

    /// Task failure recorded but not yet turned into a terminal event
    pub last_failure: Option<RunError>,

    /// Terminal output once completed
    pub output: Option<Value>,

    /// Terminal error once failed
    pub error: Option<RunError>,

    /// Cancellation reason once cancelled
    pub cancel_reason: Option<String>,
}

impl RunState {
    /// Apply one event's effect
    ///
    /// Deterministic: the same state, event, and definition always produce
    /// the same next state. The only fallible effect is the output
    /// projection of `task_completed`; a projection failure is reported as
    /// a mapping [`RunError`] and leaves the state untouched, exactly as
    /// the live path would have recorded a `task_failed` instead.
    pub fn apply(&mut self, event: &RunEvent, def: &WorkflowDefinition) -> Result<(), RunError> {
        match event {
            RunEvent::RunStarted { input, .. } => {
                self.context = ContextDocument::new(input.clone());
                self.token = Some(def.start_node.clone());
                self.node_task_done = false;
                self.status = RunStatus::Running;
            }

            RunEvent::TaskDispatched {
                node_id,
                task_id,
                task_version,
                input,
                dispatch_id,
            } => {
                self.token = Some(node_id.clone());
                self.pending_dispatch = Some(PendingDispatch {
                    node_id: node_id.clone(),
                    task_id: task_id.clone(),
                    task_version: *task_version,
                    input: input.clone(),
                    dispatch_id: *dispatch_id,
                });
                self.node_task_done = false;
                self.status = RunStatus::WaitingTask;
            }

            RunEvent::TaskCompleted { node_id, output } => {
                let node = def.node(node_id).ok_or_else(|| {
                    RunError::new(
                        RunErrorKind::Definition,
                        format!("node {node_id} not in definition {}@v{}", def.id, def.version),
                    )
                })?;
                merge(&node.output_mapping, output, &mut self.context).map_err(|e| {
                    RunError::new(RunErrorKind::Mapping, e.to_string()).at_node(node_id.clone())
                })?;
                self.pending_dispatch = None;
                self.node_task_done = true;
                self.status = RunStatus::Running;
            }

            RunEvent::TaskFailed { error, .. } => {
                self.pending_dispatch = None;
                self.last_failure = Some(error.clone());
                self.status = RunStatus::Running;
            }

            RunEvent::RunCompleted { output } => {
                self.output = Some(output.clone());
                self.pending_dispatch = None;
                self.status = RunStatus::Completed;
            }

            RunEvent::RunFailed { error } => {
                self.error = Some(error.clone());
                self.last_failure = None;
                self.pending_dispatch = None;
                self.status = RunStatus::Failed;
            }

            RunEvent::RunCancelled { reason } => {
                self.cancel_reason = Some(reason.clone());
                self.pending_dispatch = None;
                self.status = RunStatus::Cancelled;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_model::{FieldMapping, Node, TaskRef, Transition};
    use serde_json::json;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition::new("wf", 1, "a")
            .with_nodes(vec![
                Node::new("a", TaskRef::new("fetch", 1)).with_output_mapping(vec![
                    FieldMapping::new("raw", "state.raw_content"),
                ]),
                Node::new("b", TaskRef::new("store", 1)),
            ])
            .with_transitions(vec![Transition::new("a", "b")])
    }

    fn started(def: &WorkflowDefinition) -> RunState {
        let mut state = RunState::default();
        state
            .apply(
                &RunEvent::RunStarted {
                    workflow_id: def.id.clone(),
                    workflow_version: def.version,
                    input: json!({"url": "http://x"}),
                },
                def,
            )
            .unwrap();
        state
    }

    #[test]
    fn test_run_started_initializes() {
        let def = definition();
        let state = started(&def);

        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.token.as_deref(), Some("a"));
        assert!(!state.node_task_done);
        assert_eq!(state.context.get("input.url"), Some(&json!("http://x")));
    }

    #[test]
    fn test_dispatch_and_completion() {
        let def = definition();
        let mut state = started(&def);
        let dispatch_id = Uuid::now_v7();

        state
            .apply(
                &RunEvent::TaskDispatched {
                    node_id: "a".to_string(),
                    task_id: "fetch".to_string(),
                    task_version: 1,
                    input: json!({}),
                    dispatch_id,
                },
                &def,
            )
            .unwrap();
        assert_eq!(state.status, RunStatus::WaitingTask);
        assert_eq!(
            state.pending_dispatch.as_ref().unwrap().dispatch_id,
            dispatch_id
        );

        state
            .apply(
                &RunEvent::TaskCompleted {
                    node_id: "a".to_string(),
                    output: json!({"raw": "hi"}),
                },
                &def,
            )
            .unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(state.pending_dispatch.is_none());
        assert!(state.node_task_done);
        assert_eq!(state.context.get("state.raw_content"), Some(&json!("hi")));
    }

    #[test]
    fn test_completion_with_missing_output_path_is_mapping_error() {
        let def = definition();
        let mut state = started(&def);
        let before = state.clone();

        let err = state
            .apply(
                &RunEvent::TaskCompleted {
                    node_id: "a".to_string(),
                    output: json!({"unexpected": 1}),
                },
                &def,
            )
            .unwrap_err();

        assert_eq!(err.kind, RunErrorKind::Mapping);
        assert_eq!(err.node_id.as_deref(), Some("a"));
        assert_eq!(state, before);
    }

    #[test]
    fn test_task_failure_records_and_returns_to_running() {
        let def = definition();
        let mut state = started(&def);

        state
            .apply(
                &RunEvent::TaskFailed {
                    node_id: "a".to_string(),
                    error: RunError::new(RunErrorKind::Action, "boom").at_node("a"),
                },
                &def,
            )
            .unwrap();

        assert_eq!(state.status, RunStatus::Running);
        assert!(state.last_failure.is_some());
    }

    #[test]
    fn test_terminal_events() {
        let def = definition();

        let mut state = started(&def);
        state
            .apply(&RunEvent::RunCompleted { output: json!({"n": 1}) }, &def)
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.output, Some(json!({"n": 1})));

        let mut state = started(&def);
        state
            .apply(
                &RunEvent::RunCancelled {
                    reason: "operator".to_string(),
                },
                &def,
            )
            .unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(state.status.is_terminal());
    }

    #[test]
    fn test_replay_is_deterministic() {
        let def = definition();
        let events = vec![
            RunEvent::RunStarted {
                workflow_id: "wf".to_string(),
                workflow_version: 1,
                input: json!({"url": "http://x"}),
            },
            RunEvent::TaskDispatched {
                node_id: "a".to_string(),
                task_id: "fetch".to_string(),
                task_version: 1,
                input: json!({}),
                dispatch_id: Uuid::now_v7(),
            },
            RunEvent::TaskCompleted {
                node_id: "a".to_string(),
                output: json!({"raw": "hi"}),
            },
        ];

        let mut first = RunState::default();
        let mut second = RunState::default();
        for event in &events {
            first.apply(event, &def).unwrap();
            second.apply(event, &def).unwrap();
        }

        assert_eq!(first, second);
        assert_eq!(first.context.get("state.raw_content"), Some(&json!("hi")));
    }
}
