//! Context documents and dotted-path access
//!
//! A context is the tree-shaped `{input, state, output}` document carried by
//! a run or a task attempt. Values are addressed by dotted paths
//! (`state.order.total`); numeric segments index into arrays on reads.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Read a value at a dotted path within a JSON document
///
/// Returns `None` if any segment is missing or traverses a non-container.
/// Numeric segments index arrays.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path within a JSON document
///
/// Intermediate objects are created as needed. Writing through a
/// non-object value replaces it with an object.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut current = root;
    let segments: Vec<&str> = path.split('.').collect();

    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .expect("just ensured object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .expect("just ensured object")
        .insert(segments[segments.len() - 1].to_string(), value);
}

/// The hierarchical `{input, state, output}` document for a run or task
///
/// A run's context is owned exclusively by its coordinator and mutated only
/// through output projections. A task's context is ephemeral: it exists for
/// the duration of one `execute` call and is reset to its seed input on
/// every retry attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextDocument {
    /// Immutable input the run or task was started with
    pub input: Value,

    /// Scratch space written by output projections
    pub state: Value,

    /// The value surfaced when the run or task finishes
    pub output: Value,
}

impl ContextDocument {
    /// Create a context seeded with the given input and empty state/output
    pub fn new(input: Value) -> Self {
        Self {
            input,
            state: Value::Object(Map::new()),
            output: Value::Object(Map::new()),
        }
    }

    /// Create an entirely empty context
    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    /// Read the value at a dotted path rooted at `input`, `state`, or `output`
    pub fn get(&self, path: &str) -> Option<&Value> {
        let (root, rest) = split_root(path)?;
        let root = match root {
            "input" => &self.input,
            "state" => &self.state,
            "output" => &self.output,
            _ => return None,
        };
        match rest {
            Some(rest) => get_path(root, rest),
            None => Some(root),
        }
    }

    /// Write the value at a dotted path rooted at `input`, `state`, or `output`
    ///
    /// Paths outside the three known roots are ignored: a definition that
    /// passed validation never produces them.
    pub fn set(&mut self, path: &str, value: Value) {
        let Some((root, rest)) = split_root(path) else {
            return;
        };
        let root = match root {
            "input" => &mut self.input,
            "state" => &mut self.state,
            "output" => &mut self.output,
            _ => return,
        };
        match rest {
            Some(rest) => set_path(root, rest, value),
            None => *root = value,
        }
    }
}

impl Default for ContextDocument {
    fn default() -> Self {
        Self::empty()
    }
}

fn split_root(path: &str) -> Option<(&str, Option<&str>)> {
    if path.is_empty() {
        return None;
    }
    match path.split_once('.') {
        Some((root, rest)) => Some((root, Some(rest))),
        None => Some((path, None)),
    }
}
