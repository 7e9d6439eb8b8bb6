//! Workflow definitions: nodes, transitions, and validation

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::context::ContextDocument;
use crate::error::DefinitionError;
use crate::graph::TransitionIndex;
use crate::mapping::FieldMapping;

/// Reference to a task definition by id and version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub id: String,
    pub version: u32,
}

impl TaskRef {
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@v{}", self.id, self.version)
    }
}

/// A graph vertex bound to one task definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within the definition
    pub id: String,

    /// The task this node executes
    pub task: TaskRef,

    /// Workflow context -> task input projection
    #[serde(default)]
    pub input_mapping: Vec<FieldMapping>,

    /// Task output -> workflow context projection
    #[serde(default)]
    pub output_mapping: Vec<FieldMapping>,
}

impl Node {
    pub fn new(id: impl Into<String>, task: TaskRef) -> Self {
        Self {
            id: id.into(),
            task,
            input_mapping: Vec::new(),
            output_mapping: Vec::new(),
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
}

/// A prioritized, optionally conditional edge between nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_node: String,
    pub to_node: String,

    /// Higher priority wins among eligible transitions; ties break by
    /// declaration order
    #[serde(default)]
    pub priority: i32,

    /// Eligibility guard; an absent condition is always eligible
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
}

impl Transition {
    pub fn new(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            priority: 0,
            condition: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Whether this transition may be taken given the current context
    pub fn is_eligible(&self, ctx: &ContextDocument) -> bool {
        self.condition.as_ref().map_or(true, |c| c.evaluate(ctx))
    }
}

/// Structural expectations on a run's input document
///
/// A deliberately small schema: the paths that must resolve in the input
/// for the definition's mappings to make sense. Full schema languages are
/// an authoring-surface concern, outside this engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    /// Dotted paths (relative to the input document) that must be present
    #[serde(default)]
    pub required: Vec<String>,
}

impl InputSchema {
    pub fn required(paths: &[&str]) -> Self {
        Self {
            required: paths.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Paths from `required` that are absent in the given input
    pub fn missing_paths(&self, input: &serde_json::Value) -> Vec<String> {
        self.required
            .iter()
            .filter(|path| crate::context::get_path(input, path).is_none())
            .cloned()
            .collect()
    }
}

/// An immutable, versioned graph of nodes and transitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier
    pub id: String,

    /// Definition version; a (id, version) pair is immutable
    pub version: u32,

    /// Node the run's token starts on
    pub start_node: String,

    pub nodes: Vec<Node>,

    /// Declaration order is significant: it breaks priority ties
    #[serde(default)]
    pub transitions: Vec<Transition>,

    /// Structural expectations on run input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<InputSchema>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, version: u32, start_node: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version,
            start_node: start_node.into(),
            nodes: Vec::new(),
            transitions: Vec::new(),
            input_schema: None,
        }
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_transitions(mut self, transitions: Vec<Transition>) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn with_input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Validate the graph's structural invariants
    ///
    /// Checks node id uniqueness, start node existence, transition
    /// endpoint references, and the absence of unguarded cycles. Runs at
    /// definition time; a validated definition cannot fail these checks
    /// during execution.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut ids = std::collections::HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(DefinitionError::DuplicateNode(node.id.clone()));
            }
        }

        if !ids.contains(self.start_node.as_str()) {
            return Err(DefinitionError::StartNodeNotFound(self.start_node.clone()));
        }

        for transition in &self.transitions {
            for endpoint in [&transition.from_node, &transition.to_node] {
                if !ids.contains(endpoint.as_str()) {
                    return Err(DefinitionError::DanglingTransition {
                        from: transition.from_node.clone(),
                        to: transition.to_node.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
        }

        TransitionIndex::new(self).check_unguarded_cycles()
    }
}
