//! Declarative path-pair projections between context documents
//!
//! Mappings route data at the two engine seams: workflow context to task
//! input (and back), and task context to action input (and back). They are
//! plain `(source, target)` path pairs resolved by the generic get/set
//! utilities in [`crate::context`], which keeps projection pure and
//! independently testable.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::{get_path, set_path, ContextDocument};
use crate::error::MappingError;

/// One `(source_path, target_path)` projection pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dotted path resolved against the source document
    pub source: String,

    /// Dotted path written in the target document
    pub target: String,
}

impl FieldMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Build a fresh document by projecting mappings out of a context
///
/// Used for input projection: each `source` is read from the context, each
/// `target` is written into a new JSON object. An empty mapping list
/// produces an empty document; inputs are always explicit.
///
/// # Errors
///
/// Returns [`MappingError`] for the first source path absent from the
/// context.
pub fn project(mappings: &[FieldMapping], ctx: &ContextDocument) -> Result<Value, MappingError> {
    let mut doc = Value::Object(Map::new());
    for mapping in mappings {
        let value = ctx
            .get(&mapping.source)
            .ok_or_else(|| MappingError::new(&mapping.source))?
            .clone();
        set_path(&mut doc, &mapping.target, value);
    }
    Ok(doc)
}

/// Merge a result document into a context through mappings
///
/// Used for output projection: each `source` is read from the result
/// document, each `target` is written into the context (`state.*`,
/// `output.*`, ...). An empty mapping list discards the result.
///
/// # Errors
///
/// Returns [`MappingError`] for the first source path absent from the
/// result document.
pub fn merge(
    mappings: &[FieldMapping],
    result: &Value,
    ctx: &mut ContextDocument,
) -> Result<(), MappingError> {
    // Resolve every source before mutating so a failed merge leaves the
    // context untouched.
    let mut resolved = Vec::with_capacity(mappings.len());
    for mapping in mappings {
        let value = get_path(result, &mapping.source)
            .ok_or_else(|| MappingError::new(&mapping.source))?
            .clone();
        resolved.push((mapping.target.as_str(), value));
    }
    for (target, value) in resolved {
        ctx.set(target, value);
    }
    Ok(())
}
