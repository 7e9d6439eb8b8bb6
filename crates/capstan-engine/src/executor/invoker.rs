//! Action invocation boundary
//!
//! Actions are the atomic external capabilities steps invoke: a network
//! call, a model inference, a storage write. The engine never executes
//! them itself; it hands them to an [`ActionInvoker`] and classifies the
//! outcome. [`ActionRegistry`] is the in-process implementation used by
//! tests and embedders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Error returned by an invoked action
///
/// The invoker classifies failures: retryable errors are transient and may
/// be retried under a step's `retry` policy; non-retryable errors fail the
/// task regardless of remaining attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionError {
    /// Error message
    pub message: String,

    /// Whether the failure is transient
    pub retryable: bool,

    /// Additional details for debugging
    pub details: Option<Value>,
}

impl ActionError {
    /// Create a retryable (transient) error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    /// Add error details
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ActionError {}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Context provided to an action invocation
///
/// Carries the identity of the invocation and a cancellation flag. The
/// `(run_id, node_id, attempt)` triple, together with `dispatch_id`, is
/// stable across a recovery re-dispatch, so invokers that need
/// at-most-once effects can deduplicate on [`InvocationContext::idempotency_key`].
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Run that owns the dispatch
    pub run_id: Uuid,

    /// Node whose task is executing
    pub node_id: String,

    /// Dispatch identity, reused verbatim on recovery re-dispatch
    pub dispatch_id: Uuid,

    /// Step ordinal being executed
    pub step: u32,

    /// Task attempt number (1-based); survives context resets
    pub attempt: u32,

    cancelled: Arc<AtomicBool>,
}

impl InvocationContext {
    pub fn new(
        run_id: Uuid,
        node_id: impl Into<String>,
        dispatch_id: Uuid,
        step: u32,
        attempt: u32,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            dispatch_id,
            step,
            attempt,
            cancelled,
        }
    }

    /// Deduplication key for at-least-once dispatch
    pub fn idempotency_key(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.run_id, self.node_id, self.dispatch_id, self.step, self.attempt
        )
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Executes external actions on behalf of the task executor
///
/// Implementations must tolerate at-least-once invocation: after a crash
/// the coordinator re-dispatches an in-flight task, and every invocation
/// of that re-dispatch carries the same idempotency key as the original.
#[async_trait]
pub trait ActionInvoker: Send + Sync + 'static {
    /// Invoke an action with the given input
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        action: &str,
        input: Value,
    ) -> Result<Value, ActionError>;
}

/// Result type returned by registered action handlers
pub type ActionResult = Result<Value, ActionError>;

type ActionHandler =
    Arc<dyn Fn(InvocationContext, Value) -> BoxFuture<'static, ActionResult> + Send + Sync>;

/// In-process [`ActionInvoker`] with closure-registered handlers
///
/// # Example
///
/// ```
/// use capstan_engine::executor::ActionRegistry;
/// use serde_json::json;
///
/// let registry = ActionRegistry::new();
/// registry.register("echo", |_ctx, input| async move { Ok(input) });
/// ```
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, ActionHandler>>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an action name
    pub fn register<F, Fut>(&self, action: &str, handler: F)
    where
        F: Fn(InvocationContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |ctx, input| Box::pin(handler(ctx, input)));
        self.handlers.write().insert(action.to_string(), handler);
    }

    /// Whether a handler is registered for the action
    pub fn contains(&self, action: &str) -> bool {
        self.handlers.read().contains_key(action)
    }
}

#[async_trait]
impl ActionInvoker for ActionRegistry {
    async fn invoke(
        &self,
        ctx: &InvocationContext,
        action: &str,
        input: Value,
    ) -> Result<Value, ActionError> {
        let handler = self
            .handlers
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| ActionError::non_retryable(format!("no handler for action {action}")))?;

        handler(ctx.clone(), input).await
    }
}
