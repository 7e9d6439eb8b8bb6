//! Definition loading and per-run caching
//!
//! Definitions are authored, versioned, and stored outside the engine; the
//! [`DefinitionLoader`] trait is the narrow read-only interface the engine
//! consumes them through. A run resolves everything it needs once, at
//! start, into a [`RunDefinitions`] bundle that lives exactly as long as
//! the run. There is no process-wide definition cache.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use capstan_model::{DefinitionError, TaskDefinition, TaskRef, TransitionIndex, WorkflowDefinition};

/// Error type for definition loading
#[derive(Debug, thiserror::Error)]
pub enum LoaderError {
    /// The requested definition or action does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(String),
}

/// Descriptor of an invokable action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionSpec {
    /// Action reference as steps name it
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Read-only source of workflow definitions, task definitions, and actions
#[async_trait]
pub trait DefinitionLoader: Send + Sync + 'static {
    /// Fetch a workflow definition by id and version
    async fn get_workflow_def(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Arc<WorkflowDefinition>, LoaderError>;

    /// Fetch a task definition by id and version
    async fn get_task_def(&self, id: &str, version: u32)
        -> Result<Arc<TaskDefinition>, LoaderError>;

    /// Fetch the descriptor of an action reference
    async fn get_action(&self, action: &str) -> Result<ActionSpec, LoaderError>;
}

/// In-memory [`DefinitionLoader`] for tests and embedded deployments
///
/// Definitions are validated when registered, which is this loader's
/// "deploy time": a definition that fails validation is never visible to
/// the engine.
#[derive(Default)]
pub struct InMemoryDefinitionLoader {
    workflows: RwLock<HashMap<(String, u32), Arc<WorkflowDefinition>>>,
    tasks: RwLock<HashMap<(String, u32), Arc<TaskDefinition>>>,
    actions: RwLock<HashMap<String, ActionSpec>>,
}

impl InMemoryDefinitionLoader {
    /// Create an empty loader
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a workflow definition
    pub fn register_workflow(&self, def: WorkflowDefinition) -> Result<(), DefinitionError> {
        def.validate()?;
        self.workflows
            .write()
            .insert((def.id.clone(), def.version), Arc::new(def));
        Ok(())
    }

    /// Validate and register a task definition
    pub fn register_task(&self, def: TaskDefinition) -> Result<(), DefinitionError> {
        def.validate()?;
        self.tasks
            .write()
            .insert((def.id.clone(), def.version), Arc::new(def));
        Ok(())
    }

    /// Register an action descriptor
    pub fn register_action(&self, spec: ActionSpec) {
        self.actions.write().insert(spec.name.clone(), spec);
    }
}

#[async_trait]
impl DefinitionLoader for InMemoryDefinitionLoader {
    async fn get_workflow_def(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Arc<WorkflowDefinition>, LoaderError> {
        self.workflows
            .read()
            .get(&(id.to_string(), version))
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(format!("workflow {id}@v{version}")))
    }

    async fn get_task_def(
        &self,
        id: &str,
        version: u32,
    ) -> Result<Arc<TaskDefinition>, LoaderError> {
        self.tasks
            .read()
            .get(&(id.to_string(), version))
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(format!("task {id}@v{version}")))
    }

    async fn get_action(&self, action: &str) -> Result<ActionSpec, LoaderError> {
        self.actions
            .read()
            .get(action)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(format!("action {action}")))
    }
}

/// Everything one run needs from the loader, resolved once at start
///
/// Populated when the run starts, dropped when the run reaches a terminal
/// state. The bundle pins the definition versions a run executes against;
/// a redeploy mid-run never changes a running instance.
#[derive(Debug)]
pub struct RunDefinitions {
    /// The workflow graph
    pub workflow: Arc<WorkflowDefinition>,

    /// Adjacency index over the workflow's transitions
    pub index: TransitionIndex,

    tasks: HashMap<TaskRef, Arc<TaskDefinition>>,
}

impl RunDefinitions {
    /// Resolve a workflow and every task and action it references
    ///
    /// Fails fast: a dangling task or action reference surfaces here, at
    /// run start, not in the middle of a run.
    pub async fn load(
        loader: &dyn DefinitionLoader,
        workflow_id: &str,
        version: u32,
    ) -> Result<Self, LoaderError> {
        let workflow = loader.get_workflow_def(workflow_id, version).await?;
        let index = TransitionIndex::new(&workflow);

        let mut tasks = HashMap::new();
        for node in &workflow.nodes {
            if tasks.contains_key(&node.task) {
                continue;
            }
            let task = loader.get_task_def(&node.task.id, node.task.version).await?;
            for step in &task.steps {
                loader.get_action(&step.action).await?;
            }
            tasks.insert(node.task.clone(), task);
        }

        Ok(Self {
            workflow,
            index,
            tasks,
        })
    }

    /// The resolved task for a reference; present for every node's task
    pub fn task(&self, task_ref: &TaskRef) -> Option<Arc<TaskDefinition>> {
        self.tasks.get(task_ref).cloned()
    }
}
