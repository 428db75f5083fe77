//! Incompleteness predicate: which records still need enrichment.
//!
//! A record matches when **any** condition holds. Stores translate the same
//! conditions into their native query language; [`Predicate::matches`] is the
//! in-memory reference evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{is_blank, lookup};

/// One required-field condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCondition {
    /// The field is absent, null, or empty (`""`, `[]`, `{}`).
    Missing(String),

    /// The field is an array and at least one element lacks `field`
    /// (absent, null, or empty).
    ArrayElementMissing { array: String, field: String },
}

impl FieldCondition {
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            FieldCondition::Missing(path) => lookup(document, path).is_none_or(is_blank),
            FieldCondition::ArrayElementMissing { array, field } => match lookup(document, array)
            {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| lookup(item, field).is_none_or(is_blank)),
                _ => false,
            },
        }
    }

    /// Every path referenced by the condition.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            FieldCondition::Missing(path) => vec![path.as_str()],
            FieldCondition::ArrayElementMissing { array, field } => {
                vec![array.as_str(), field.as_str()]
            }
        }
    }
}

/// Disjunction of [`FieldCondition`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Predicate {
    conditions: Vec<FieldCondition>,
}

impl Predicate {
    pub fn new(conditions: Vec<FieldCondition>) -> Self {
        Self { conditions }
    }

    pub fn missing(path: impl Into<String>) -> Self {
        Self::new(vec![FieldCondition::Missing(path.into())])
    }

    pub fn or(mut self, condition: FieldCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn conditions(&self) -> &[FieldCondition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.conditions.iter().any(|c| c.matches(document))
    }
}
