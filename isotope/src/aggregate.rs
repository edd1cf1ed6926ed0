//! The portable aggregation pipeline model.
//!
//! The pipeline is the subset every backend family can either translate
//! natively (document store pipelines, search-index query DSL) or render
//! into a single statement (relational) or evaluate client-side over a
//! partition scan (wide-column). An adapter that cannot express a stage, or
//! a stage ordering, answers with an explicit `Unsupported` error naming the
//! stage; no stage is ever silently dropped.
//!
//! # Examples
//!
//! ```rust,ignore
//! use isotope::aggregate::{Accumulator, GroupSpec, PipelineStage};
//! use isotope::filter::field;
//!
//! // Top 10 customers by total order amount
//! let pipeline = vec![
//!     PipelineStage::Match(field("status").eq("completed")),
//!     PipelineStage::Group(
//!         GroupSpec::by_field("customer_id")
//!             .accumulate("total", Accumulator::Sum("amount".into()))
//!             .accumulate("orders", Accumulator::Count),
//!     ),
//!     PipelineStage::Limit(10),
//! ];
//! let rows = repo.aggregate("orders", &pipeline).await?;
//! ```

use indexmap::IndexMap;

use crate::common::SortOrder;
use crate::filter::Filter;

/// One stage of the portable pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineStage {
    /// Keep rows matching the filter.
    Match(Filter),
    /// Order rows by the given fields.
    Sort(Vec<(String, SortOrder)>),
    /// Drop the first N rows.
    Skip(u64),
    /// Keep at most N rows.
    Limit(u64),
    /// Fold rows into groups keyed by a single field.
    Group(GroupSpec),
    /// Keep only the named fields of each row.
    Project(Vec<String>),
}

impl PipelineStage {
    /// Returns the stage name used in `Unsupported` error messages.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineStage::Match(_) => "Match",
            PipelineStage::Sort(_) => "Sort",
            PipelineStage::Skip(_) => "Skip",
            PipelineStage::Limit(_) => "Limit",
            PipelineStage::Group(_) => "Group",
            PipelineStage::Project(_) => "Project",
        }
    }
}

/// An accumulator applied to each group.
///
/// `Count` counts rows and yields an integer. The field-bound accumulators
/// fold the named payload field's numeric values and yield floats;
/// non-numeric values do not participate.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl Accumulator {
    /// Returns the payload field this accumulator folds, if any.
    pub fn field(&self) -> Option<&str> {
        match self {
            Accumulator::Count => None,
            Accumulator::Sum(field)
            | Accumulator::Avg(field)
            | Accumulator::Min(field)
            | Accumulator::Max(field) => Some(field),
        }
    }
}

/// A grouping stage: a single group key plus named accumulators.
///
/// Output rows carry the group key under the grouping field's name followed
/// by one entry per accumulator. With no group field the whole input folds
/// into a single row of accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupSpec {
    by: Option<String>,
    accumulators: IndexMap<String, Accumulator>,
}

impl GroupSpec {
    /// Groups by a single payload field (or `id`).
    pub fn by_field(field: &str) -> GroupSpec {
        GroupSpec {
            by: Some(field.to_string()),
            accumulators: IndexMap::new(),
        }
    }

    /// Folds the whole input into one group.
    pub fn whole_collection() -> GroupSpec {
        GroupSpec {
            by: None,
            accumulators: IndexMap::new(),
        }
    }

    /// Adds a named accumulator to the group output.
    pub fn accumulate(mut self, name: &str, accumulator: Accumulator) -> GroupSpec {
        self.accumulators.insert(name.to_string(), accumulator);
        self
    }

    pub fn by(&self) -> Option<&str> {
        self.by.as_deref()
    }

    pub fn accumulators(&self) -> &IndexMap<String, Accumulator> {
        &self.accumulators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::field;

    #[test]
    fn test_stage_names() {
        assert_eq!(PipelineStage::Match(field("a").eq(1)).name(), "Match");
        assert_eq!(PipelineStage::Skip(1).name(), "Skip");
        assert_eq!(
            PipelineStage::Group(GroupSpec::whole_collection()).name(),
            "Group"
        );
        assert_eq!(PipelineStage::Project(vec![]).name(), "Project");
    }

    #[test]
    fn test_group_spec_builders() {
        let spec = GroupSpec::by_field("customer_id")
            .accumulate("orders", Accumulator::Count)
            .accumulate("total", Accumulator::Sum("amount".into()));

        assert_eq!(spec.by(), Some("customer_id"));
        assert_eq!(spec.accumulators().len(), 2);
        assert_eq!(
            spec.accumulators().get("total"),
            Some(&Accumulator::Sum("amount".into()))
        );
    }

    #[test]
    fn test_accumulator_field() {
        assert_eq!(Accumulator::Count.field(), None);
        assert_eq!(Accumulator::Avg("score".into()).field(), Some("score"));
    }

    #[test]
    fn test_whole_collection_group_has_no_key() {
        let spec = GroupSpec::whole_collection().accumulate("n", Accumulator::Count);
        assert!(spec.by().is_none());
    }
}
