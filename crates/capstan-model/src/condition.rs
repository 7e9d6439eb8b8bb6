//! Boolean conditions over context documents
//!
//! Conditions guard transitions and step branches. A condition compares the
//! value at one context path against a literal. Definitions may spell a
//! condition either as a structured object or as the compact expression form
//! `"input.x == true"`; both deserialize to the same [`Condition`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextDocument;
use crate::error::DefinitionError;

/// Comparison operator of a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// True when the path resolves to any value, including `null`
    Exists,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Gte => ">=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Exists => "exists",
        }
    }
}

/// A boolean predicate over a context document
///
/// Evaluation is total: a path absent from the context makes the condition
/// `false` (guard semantics), never an error. Ordering comparisons between
/// values of different JSON types are `false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ConditionRepr", into = "String")]
pub struct Condition {
    /// Dotted context path of the left-hand side
    pub path: String,

    /// Comparison operator
    pub op: CompareOp,

    /// Right-hand literal; ignored for `exists`
    pub value: Value,
}

impl Condition {
    pub fn new(path: impl Into<String>, op: CompareOp, value: Value) -> Self {
        Self {
            path: path.into(),
            op,
            value,
        }
    }

    /// Parse the compact expression form, e.g. `state.count >= 3`
    ///
    /// The literal is parsed as JSON; bare words are treated as strings, so
    /// `input.mode == fast` and `input.mode == "fast"` are equivalent. A
    /// bare path with no operator is shorthand for `path == true`.
    pub fn parse(expr: &str) -> Result<Self, DefinitionError> {
        let invalid = |reason: &str| DefinitionError::InvalidCondition {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty expression"));
        }

        // Longest operators first so ">=" is not read as ">".
        const OPS: [(&str, CompareOp); 6] = [
            ("==", CompareOp::Eq),
            ("!=", CompareOp::Ne),
            (">=", CompareOp::Gte),
            ("<=", CompareOp::Lte),
            (">", CompareOp::Gt),
            ("<", CompareOp::Lt),
        ];

        for (symbol, op) in OPS {
            if let Some((lhs, rhs)) = trimmed.split_once(symbol) {
                let path = lhs.trim();
                let literal = rhs.trim();
                if path.is_empty() {
                    return Err(invalid("missing path before operator"));
                }
                if literal.is_empty() {
                    return Err(invalid("missing literal after operator"));
                }
                let value = serde_json::from_str(literal)
                    .unwrap_or_else(|_| Value::String(literal.to_string()));
                return Ok(Self::new(path, op, value));
            }
        }

        if let Some(path) = trimmed.strip_suffix(" exists") {
            return Ok(Self::new(path.trim(), CompareOp::Exists, Value::Null));
        }

        // Bare path shorthand.
        if trimmed.contains(char::is_whitespace) {
            return Err(invalid("unrecognized operator"));
        }
        Ok(Self::new(trimmed, CompareOp::Eq, Value::Bool(true)))
    }

    /// Evaluate against a context document
    pub fn evaluate(&self, ctx: &ContextDocument) -> bool {
        let actual = ctx.get(&self.path);

        match self.op {
            CompareOp::Exists => actual.is_some(),
            CompareOp::Eq => actual == Some(&self.value),
            CompareOp::Ne => actual.is_some() && actual != Some(&self.value),
            CompareOp::Gt | CompareOp::Gte | CompareOp::Lt | CompareOp::Lte => {
                let Some(actual) = actual else {
                    return false;
                };
                let Some(ordering) = compare_values(actual, &self.value) else {
                    return false;
                };
                match self.op {
                    CompareOp::Gt => ordering.is_gt(),
                    CompareOp::Gte => ordering.is_ge(),
                    CompareOp::Lt => ordering.is_lt(),
                    CompareOp::Lte => ordering.is_le(),
                    _ => unreachable!(),
                }
            }
        }
    }
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.op {
            CompareOp::Exists => write!(f, "{} exists", self.path),
            _ => write!(f, "{} {} {}", self.path, self.op.symbol(), self.value),
        }
    }
}

impl From<Condition> for String {
    fn from(condition: Condition) -> Self {
        condition.to_string()
    }
}

impl std::str::FromStr for Condition {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Accepts either the expression string or the structured object form
#[derive(Deserialize)]
#[serde(untagged)]
enum ConditionRepr {
    Expr(String),
    Parts {
        path: String,
        op: CompareOp,
        #[serde(default)]
        value: Value,
    },
}

impl TryFrom<ConditionRepr> for Condition {
    type Error = DefinitionError;

    fn try_from(repr: ConditionRepr) -> Result<Self, Self::Error> {
        match repr {
            ConditionRepr::Expr(expr) => Condition::parse(&expr),
            ConditionRepr::Parts { path, op, value } => Ok(Condition::new(path, op, value)),
        }
    }
}

fn compare_values(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => l.as_f64()?.partial_cmp(&r.as_f64()?),
        (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
        _ => None,
    }
}
