//! Task execution: the sequential step runner and the action boundary

mod invoker;
mod task;

pub use invoker::{
    ActionError, ActionInvoker, ActionRegistry, ActionResult, InvocationContext,
};
pub use task::{TaskExecutor, TaskFailure, TaskFailureKind, TaskResult};
