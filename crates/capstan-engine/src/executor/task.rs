//! Sequential task execution
//!
//! The executor runs one task definition's ordered steps against an
//! ephemeral `{input, state, output}` context. It owns per-step failure
//! policy and whole-task retry; it persists nothing. Durability is the
//! coordinator's job, via the returned result.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use capstan_model::{
    merge, project, ContextDocument, MappingError, OnFailure, Step, StepBranch, TaskDefinition,
};

use crate::error::{RunError, RunErrorKind};
use crate::executor::invoker::{ActionError, ActionInvoker, InvocationContext};

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFailureKind {
    /// An action failed and the step policy aborted the task
    Action,

    /// A step mapping path was absent; aborts regardless of policy
    Mapping,

    /// The retry policy's attempts were exhausted
    RetryExhausted,

    /// The whole-task time bound was exceeded
    Timeout,

    /// The cancellation flag was observed
    Cancelled,
}

/// Failure result of a task execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// What ended the task
    pub kind: TaskFailureKind,

    /// Step ordinal the failure surfaced at, when applicable
    pub step: Option<u32>,

    /// Human-readable description
    pub message: String,

    /// Number of attempts that ran
    pub attempts: u32,
}

impl TaskFailure {
    /// Convert into the run-level error record, attaching the node
    pub fn into_run_error(self, node_id: &str) -> RunError {
        let kind = match self.kind {
            TaskFailureKind::Action | TaskFailureKind::Cancelled => RunErrorKind::Action,
            TaskFailureKind::Mapping => RunErrorKind::Mapping,
            TaskFailureKind::RetryExhausted => RunErrorKind::RetryExhausted,
            TaskFailureKind::Timeout => RunErrorKind::Timeout,
        };
        let mut error = RunError::new(kind, self.message).at_node(node_id);
        if let Some(step) = self.step {
            error = error.at_step(step);
        }
        error
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} after {} attempt(s)", self.message, self.attempts)
    }
}

/// Result of one task dispatch: raw output document or failure
pub type TaskResult = Result<Value, TaskFailure>;

/// How one attempt ended
enum AttemptEnd {
    /// Ran to the end of the step list, or a `succeed` branch fired
    Completed(Value),

    /// Terminal failure; no further attempts regardless of policy
    Failed { step: u32, error: ActionError },

    /// Retryable failure under `on_failure = retry`
    Retry { step: u32, error: ActionError },

    /// Projection failure; aborts regardless of policy
    Mapping { step: u32, error: MappingError },

    /// Cancellation flag observed between steps
    Cancelled,

    /// The whole-task deadline passed
    TimedOut,
}

/// Executes one task definition per dispatch
///
/// Stateless apart from the invoker handle: every `execute` call carries
/// its own context, attempt counter, and deadline.
pub struct TaskExecutor {
    invoker: Arc<dyn ActionInvoker>,
}

impl TaskExecutor {
    pub fn new(invoker: Arc<dyn ActionInvoker>) -> Self {
        Self { invoker }
    }

    /// Execute a task to output or failure
    ///
    /// The attempt counter lives here, outside the per-attempt context: a
    /// retry resets the context to the original input but not the counter.
    /// `timeout_ms` bounds the sum of all attempts including backoff
    /// delays.
    #[instrument(skip(self, task, input, cancelled), fields(task_id = %task.id))]
    pub async fn execute(
        &self,
        run_id: Uuid,
        node_id: &str,
        dispatch_id: Uuid,
        task: &TaskDefinition,
        input: Value,
        cancelled: Arc<AtomicBool>,
    ) -> TaskResult {
        let deadline = Instant::now() + Duration::from_millis(task.timeout_ms);
        let steps = task.ordered_steps();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let mut ctx = ContextDocument::new(input.clone());
            debug!(%run_id, node_id, attempt = attempts, "starting task attempt");

            let end = self
                .run_attempt(
                    run_id, node_id, dispatch_id, &steps, &mut ctx, attempts, deadline, &cancelled,
                )
                .await;

            match end {
                AttemptEnd::Completed(output) => return Ok(output),

                AttemptEnd::Failed { step, error } => {
                    return Err(TaskFailure {
                        kind: TaskFailureKind::Action,
                        step: Some(step),
                        message: error.message,
                        attempts,
                    });
                }

                AttemptEnd::Mapping { step, error } => {
                    return Err(TaskFailure {
                        kind: TaskFailureKind::Mapping,
                        step: Some(step),
                        message: error.to_string(),
                        attempts,
                    });
                }

                AttemptEnd::Cancelled => {
                    return Err(TaskFailure {
                        kind: TaskFailureKind::Cancelled,
                        step: None,
                        message: "task cancelled".to_string(),
                        attempts,
                    });
                }

                AttemptEnd::TimedOut => {
                    return Err(TaskFailure {
                        kind: TaskFailureKind::Timeout,
                        step: None,
                        message: format!("task exceeded {}ms", task.timeout_ms),
                        attempts,
                    });
                }

                AttemptEnd::Retry { step, error } => {
                    if !task.retry.has_attempts_remaining(attempts) {
                        return Err(TaskFailure {
                            kind: TaskFailureKind::RetryExhausted,
                            step: Some(step),
                            message: format!(
                                "{} of {} attempts failed; last error: {}",
                                attempts, task.retry.max_attempts, error.message
                            ),
                            attempts,
                        });
                    }

                    let delay = task.retry.delay_for_attempt(attempts + 1);
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(TaskFailure {
                            kind: TaskFailureKind::Timeout,
                            step: None,
                            message: format!("task exceeded {}ms", task.timeout_ms),
                            attempts,
                        });
                    };
                    if delay >= remaining {
                        return Err(TaskFailure {
                            kind: TaskFailureKind::Timeout,
                            step: None,
                            message: format!(
                                "retry delay would exceed the {}ms task bound",
                                task.timeout_ms
                            ),
                            attempts,
                        });
                    }
                    warn!(%run_id, node_id, step, attempt = attempts, ?delay, "retrying task");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        run_id: Uuid,
        node_id: &str,
        dispatch_id: Uuid,
        steps: &[&Step],
        ctx: &mut ContextDocument,
        attempt: u32,
        deadline: Instant,
        cancelled: &Arc<AtomicBool>,
    ) -> AttemptEnd {
        for step in steps {
            if cancelled.load(std::sync::atomic::Ordering::Relaxed) {
                return AttemptEnd::Cancelled;
            }

            if let Some(condition) = &step.condition {
                let branch = if condition.if_.evaluate(ctx) {
                    condition.then
                } else {
                    condition.else_
                };
                match branch {
                    StepBranch::Continue => {}
                    StepBranch::Skip => {
                        debug!(node_id, step = step.ordinal, "step skipped by condition");
                        continue;
                    }
                    StepBranch::Succeed => {
                        debug!(node_id, step = step.ordinal, "task succeeded by condition");
                        return AttemptEnd::Completed(ctx.output.clone());
                    }
                    StepBranch::Fail => {
                        return AttemptEnd::Failed {
                            step: step.ordinal,
                            error: ActionError::non_retryable(
                                "step condition selected the fail branch",
                            ),
                        };
                    }
                }
            }

            let action_input = match project(&step.input_mapping, ctx) {
                Ok(input) => input,
                Err(error) => {
                    return AttemptEnd::Mapping {
                        step: step.ordinal,
                        error,
                    }
                }
            };

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return AttemptEnd::TimedOut;
            };

            let invocation = InvocationContext::new(
                run_id,
                node_id,
                dispatch_id,
                step.ordinal,
                attempt,
                cancelled.clone(),
            );

            let result = match tokio::time::timeout(
                remaining,
                self.invoker.invoke(&invocation, &step.action, action_input),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => return AttemptEnd::TimedOut,
            };

            match result {
                Ok(output) => {
                    if let Err(error) = merge(&step.output_mapping, &output, ctx) {
                        return AttemptEnd::Mapping {
                            step: step.ordinal,
                            error,
                        };
                    }
                }
                Err(error) => match step.on_failure {
                    OnFailure::Continue => {
                        warn!(
                            node_id,
                            step = step.ordinal,
                            %error,
                            "step failed, continuing per policy"
                        );
                    }
                    OnFailure::Abort => {
                        return AttemptEnd::Failed {
                            step: step.ordinal,
                            error,
                        }
                    }
                    OnFailure::Retry => {
                        if error.retryable {
                            return AttemptEnd::Retry {
                                step: step.ordinal,
                                error,
                            };
                        }
                        // The invoker classified this as permanent; more
                        // attempts cannot change the outcome.
                        return AttemptEnd::Failed {
                            step: step.ordinal,
                            error,
                        };
                    }
                },
            }
        }

        AttemptEnd::Completed(ctx.output.clone())
    }
}
