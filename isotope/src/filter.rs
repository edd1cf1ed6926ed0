//! Flat equality filters for selecting documents.
//!
//! A filter is an ordered set of field-to-literal conditions combined with
//! implicit AND. The key `id` addresses the document id; every other key
//! addresses a payload field. This is deliberately the portable subset every
//! backend can evaluate with identical semantics; richer operators belong to
//! the per-backend raw escape hatches.
//!
//! # Creating Filters
//!
//! Filters are created using the fluent API:
//! - `field("name").eq("Alice")` - equality on a payload field
//! - `Filter::by_id(id)` - match by document id
//! - `Filter::empty()` - match all documents
//! - `field("name").eq("Alice").and(field("age").eq(30))` - conjunction
//!
//! # Examples
//!
//! ```rust,ignore
//! use isotope::filter::{field, Filter};
//!
//! let filter = field("status").eq("active").and(field("age").eq(30));
//! let everyone = Filter::empty();
//! let by_id = Filter::by_id("user-1");
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::common::constants::FIELD_ID;
use crate::common::Value;

/// A flat conjunction of field-to-literal equality conditions.
///
/// An empty filter matches every document. `UpdateMany` and `DeleteMany`
/// reject empty filters to keep collection-wide mutations deliberate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    conditions: IndexMap<String, Value>,
}

impl Filter {
    /// Creates a filter that matches every document.
    pub fn empty() -> Filter {
        Filter {
            conditions: IndexMap::new(),
        }
    }

    /// Creates a filter matching the document with the given id.
    pub fn by_id(id: &str) -> Filter {
        let mut conditions = IndexMap::new();
        conditions.insert(FIELD_ID.to_string(), Value::from(id));
        Filter { conditions }
    }

    /// Adds an equality condition, replacing any prior condition on the same
    /// field.
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Filter {
        self.conditions.insert(field.to_string(), value.into());
        self
    }

    /// Merges another filter into this one; on a shared field the other
    /// filter's condition wins.
    pub fn and(mut self, other: Filter) -> Filter {
        for (field, value) in other.conditions {
            self.conditions.insert(field, value);
        }
        self
    }

    /// Returns `true` when the filter carries no conditions.
    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Returns the conditions in insertion order.
    pub fn conditions(&self) -> &IndexMap<String, Value> {
        &self.conditions
    }

    /// Returns the id this filter pins, when it has an `id` condition with a
    /// string value.
    pub fn id_condition(&self) -> Option<&str> {
        self.conditions.get(FIELD_ID).and_then(|v| v.as_str())
    }

    /// Returns the payload conditions, excluding any `id` condition.
    pub fn payload_conditions(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.conditions.iter().filter(|(field, _)| *field != FIELD_ID)
    }
}

/// Starts a fluent filter on the given field.
///
/// # Arguments
///
/// * `name` - The payload field to condition on, or `id` for the document id
///
/// # Returns
///
/// A [FilterField] that finishes into a [Filter] with `eq`.
pub fn field(name: &str) -> FilterField {
    FilterField {
        name: name.to_string(),
    }
}

/// A partially built condition produced by [field].
pub struct FilterField {
    name: String,
}

impl FilterField {
    /// Finishes the condition with an equality check against a literal.
    pub fn eq(self, value: impl Into<Value>) -> Filter {
        Filter::empty().with(&self.name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_has_no_conditions() {
        let filter = Filter::empty();
        assert!(filter.is_empty());
        assert!(filter.id_condition().is_none());
    }

    #[test]
    fn test_field_eq_builds_single_condition() {
        let filter = field("name").eq("Alice");
        assert!(!filter.is_empty());
        assert_eq!(filter.conditions().get("name"), Some(&Value::from("Alice")));
    }

    #[test]
    fn test_and_merges_conditions_in_order() {
        let filter = field("name").eq("Alice").and(field("age").eq(30));
        let fields: Vec<&String> = filter.conditions().keys().collect();
        assert_eq!(fields, vec!["name", "age"]);
    }

    #[test]
    fn test_and_last_condition_wins_on_same_field() {
        let filter = field("age").eq(30).and(field("age").eq(31));
        assert_eq!(filter.conditions().get("age"), Some(&Value::I64(31)));
        assert_eq!(filter.conditions().len(), 1);
    }

    #[test]
    fn test_by_id_sets_id_condition() {
        let filter = Filter::by_id("user-1");
        assert_eq!(filter.id_condition(), Some("user-1"));
    }

    #[test]
    fn test_payload_conditions_skip_id() {
        let filter = Filter::by_id("user-1").and(field("age").eq(30));
        let payload: Vec<&String> = filter.payload_conditions().map(|(f, _)| f).collect();
        assert_eq!(payload, vec!["age"]);
    }

    #[test]
    fn test_non_string_id_condition_is_not_an_id_pin() {
        let filter = field("id").eq(7);
        assert!(filter.id_condition().is_none());
    }
}
