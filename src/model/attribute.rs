//! Host attributes and the constraints tasks declare against them.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A host-level `name -> set of string values` tag, e.g. `rack -> {a}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: BTreeSet<String>,
}

/// A constraint a task's placement must satisfy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Matches iff `negated XOR (an attribute value intersects `values`)`.
    Value { attribute_name: String, values: BTreeSet<String>, negated: bool },
    /// Matches iff fewer than `limit` active tasks of the same job already
    /// sit on a host sharing any attribute value with the candidate host.
    Limit { attribute_name: String, limit: u32 },
}
