//! Task definitions: ordered, retryable step lists
//!
//! A task is the unit a run coordinator dispatches. Its steps execute
//! strictly in ordinal order against an ephemeral task context; there is no
//! parallelism and no nesting inside a task, by construction.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::DefinitionError;
use crate::mapping::FieldMapping;
use crate::retry::RetryPolicy;

/// How a step reacts when its action fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// The whole task attempt fails
    #[default]
    Abort,

    /// The task restarts from ordinal 0 with a fresh context, up to
    /// the retry policy's `max_attempts`
    Retry,

    /// The failure is ignored and the next ordinal runs
    Continue,
}

/// Outcome of a step condition branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepBranch {
    /// Run the step normally
    Continue,

    /// Advance to the next ordinal without invoking the action
    Skip,

    /// End the task immediately with the current output
    Succeed,

    /// End the task immediately as a failure
    Fail,
}

/// Conditional gate in front of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    /// Predicate evaluated against the task context
    #[serde(rename = "if")]
    pub if_: Condition,

    /// Branch taken when the predicate is true
    #[serde(default = "StepCondition::default_then")]
    pub then: StepBranch,

    /// Branch taken when the predicate is false
    #[serde(rename = "else", default = "StepCondition::default_else")]
    pub else_: StepBranch,
}

impl StepCondition {
    pub fn new(if_: Condition, then: StepBranch, else_: StepBranch) -> Self {
        Self { if_, then, else_ }
    }

    fn default_then() -> StepBranch {
        StepBranch::Continue
    }

    fn default_else() -> StepBranch {
        StepBranch::Skip
    }
}

/// One conditional, mapped invocation of an atomic action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the task; unique and dense from 0
    pub ordinal: u32,

    /// Reference to the action the invoker executes
    pub action: String,

    /// Task context -> action input projection
    #[serde(default)]
    pub input_mapping: Vec<FieldMapping>,

    /// Action result -> task context projection
    #[serde(default)]
    pub output_mapping: Vec<FieldMapping>,

    /// Failure policy for this step
    #[serde(default)]
    pub on_failure: OnFailure,

    /// Optional gate evaluated before the action is invoked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StepCondition>,
}

impl Step {
    pub fn new(ordinal: u32, action: impl Into<String>) -> Self {
        Self {
            ordinal,
            action: action.into(),
            input_mapping: Vec::new(),
            output_mapping: Vec::new(),
            on_failure: OnFailure::default(),
            condition: None,
        }
    }

    pub fn with_input_mapping(mut self, mappings: Vec<FieldMapping>) -> Self {
        self.input_mapping = mappings;
        self
    }

    pub fn with_output_mapping(mut self, mappings: Vec<FieldMapping>) -> Self {
        self.output_mapping = mappings;
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// An immutable, versioned, ordered sequence of steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task identifier
    pub id: String,

    /// Definition version; a (id, version) pair is immutable
    pub version: u32,

    /// Steps in ordinal order
    pub steps: Vec<Step>,

    /// Whole-task retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Bound on the sum of all attempts, in milliseconds
    pub timeout_ms: u64,
}

impl TaskDefinition {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
            steps: Vec::new(),
            retry: RetryPolicy::default(),
            timeout_ms: 60_000,
        }
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Validate structural invariants
    ///
    /// Steps must exist and carry unique, dense ordinals `0..n-1`. Steps
    /// may be declared in any order; validation does not sort them.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyTask(self.id.clone()));
        }

        let mut seen = vec![false; self.steps.len()];
        for step in &self.steps {
            let ordinal = step.ordinal as usize;
            if ordinal >= seen.len() || seen[ordinal] {
                return Err(DefinitionError::InvalidStepOrdinals {
                    task: self.id.clone(),
                    found: step.ordinal,
                });
            }
            seen[ordinal] = true;
        }
        Ok(())
    }

    /// Steps sorted by ordinal
    pub fn ordered_steps(&self) -> Vec<&Step> {
        let mut steps: Vec<&Step> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.ordinal);
        steps
    }
}
