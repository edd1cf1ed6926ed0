//! Shared client-side filter, sort, and pipeline evaluation.
//!
//! These helpers define the contract semantics once, in one place. The
//! in-memory backend runs on them directly, the wide-column adapter uses
//! them to evaluate filters and the aggregation subset over partition scans,
//! and the unit tests of every translator compare native results against
//! them.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::aggregate::{Accumulator, GroupSpec, PipelineStage};
use crate::common::constants::FIELD_ID;
use crate::common::{compare_values, DocumentData, SortOrder, Value};
use crate::document::Document;
use crate::errors::{IsotopeError, IsotopeResult};
use crate::filter::Filter;
use crate::repository::FindOptions;

/// Evaluates a filter against a document.
///
/// The `id` key matches the document id; every other key matches a payload
/// field by literal equality. A missing payload field matches nothing, not
/// even `Null`.
pub fn matches_filter(document: &Document, filter: &Filter) -> bool {
    filter.conditions().iter().all(|(field, expected)| {
        if field == FIELD_ID {
            matches!(expected, Value::String(id) if id == document.id())
        } else {
            document.get(field).map(|v| v == expected).unwrap_or(false)
        }
    })
}

/// Evaluates a filter against a bare row, where `id` is an ordinary key.
pub fn matches_row(row: &DocumentData, filter: &Filter) -> bool {
    filter
        .conditions()
        .iter()
        .all(|(field, expected)| row.get(field).map(|v| v == expected).unwrap_or(false))
}

/// Renders a document as a pipeline row: its payload with the document id
/// injected under `id`.
pub fn document_row(document: &Document) -> DocumentData {
    let mut row = DocumentData::new();
    row.insert(FIELD_ID.to_string(), Value::from(document.id()));
    for (field, value) in document.data() {
        row.insert(field.clone(), value.clone());
    }
    row
}

fn sort_value<'a>(row: &'a DocumentData, field: &str) -> &'a Value {
    row.get(field).unwrap_or(&Value::Null)
}

/// Compares two documents under a sort specification; missing fields sort as
/// `Null`.
pub fn compare_documents(a: &Document, b: &Document, sort_by: &[(String, SortOrder)]) -> Ordering {
    for (field, order) in sort_by {
        let ord = if field == FIELD_ID {
            a.id().cmp(b.id())
        } else {
            let left = a.get(field).unwrap_or(&Value::Null);
            let right = b.get(field).unwrap_or(&Value::Null);
            compare_values(left, right)
        };
        let ord = apply_order(ord, *order);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn apply_order(ord: Ordering, order: SortOrder) -> Ordering {
    match order {
        SortOrder::Ascending => ord,
        SortOrder::Descending => ord.reverse(),
    }
}

/// Sorts documents in place under a sort specification.
pub fn sort_documents(documents: &mut [Document], sort_by: &[(String, SortOrder)]) {
    if !sort_by.is_empty() {
        documents.sort_by(|a, b| compare_documents(a, b, sort_by));
    }
}

fn sort_rows(rows: &mut [DocumentData], sort_by: &[(String, SortOrder)]) {
    rows.sort_by(|a, b| {
        for (field, order) in sort_by {
            let ord = apply_order(compare_values(sort_value(a, field), sort_value(b, field)), *order);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}

/// Applies skip and limit to an already sorted sequence.
pub fn apply_skip_limit<T>(items: Vec<T>, skip: Option<u64>, limit: Option<u64>) -> Vec<T> {
    let skip = skip.unwrap_or(0) as usize;
    let limit = limit.map(|l| l as usize).unwrap_or(usize::MAX);
    items.into_iter().skip(skip).take(limit).collect()
}

/// Trims a payload to the projected fields, preserving their stored order.
pub fn apply_projection(data: &DocumentData, fields: &[String]) -> DocumentData {
    data.iter()
        .filter(|(field, _)| fields.iter().any(|f| f == *field))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Applies the full find-options pipeline (sort, skip, limit, projection) to
/// documents already narrowed by a filter.
pub fn apply_find_options(mut documents: Vec<Document>, options: &FindOptions) -> Vec<Document> {
    sort_documents(&mut documents, &options.sort_by);
    let documents = apply_skip_limit(documents, options.skip, options.limit);
    match &options.projection {
        Some(fields) => documents
            .into_iter()
            .map(|doc| {
                let projected = apply_projection(doc.data(), fields);
                doc.with_data(projected)
            })
            .collect(),
        None => documents,
    }
}

/// Applies a field-set update to a payload: each entry overwrites or adds
/// its field, untouched fields survive.
pub fn apply_update(data: &mut DocumentData, update: &DocumentData) {
    for (field, value) in update {
        data.insert(field.clone(), value.clone());
    }
}

/// Builds the payload an upsert inserts when nothing matched: the filter's
/// payload conditions overlaid with the update map.
pub fn upsert_payload(filter: &Filter, update: &DocumentData) -> DocumentData {
    let mut data = DocumentData::new();
    for (field, value) in filter.payload_conditions() {
        data.insert(field.clone(), value.clone());
    }
    apply_update(&mut data, update);
    data
}

/// Builds the unsaved document an upsert inserts when nothing matched.
///
/// A string `id` condition in the filter seeds the document id, so every
/// backend reports the same upserted id the caller can predict.
pub fn upsert_document(collection: &str, filter: &Filter, update: &DocumentData) -> Document {
    let data = upsert_payload(filter, update);
    match filter.id_condition() {
        Some(id) => Document::with_id(collection, id, data),
        None => Document::new(collection, data),
    }
}

/// Returns the distinct values of a payload field across matching documents.
///
/// Values keep first-seen order. Documents missing the field contribute
/// nothing; explicit nulls count as a value.
pub fn distinct_values(documents: &[Document], field: &str, filter: &Filter) -> Vec<Value> {
    let mut seen: Vec<Value> = Vec::new();
    for document in documents {
        if !matches_filter(document, filter) {
            continue;
        }
        let value = if field == FIELD_ID {
            Some(Value::from(document.id()))
        } else {
            document.get(field).cloned()
        };
        if let Some(value) = value {
            if !seen.iter().any(|v| v == &value) {
                seen.push(value);
            }
        }
    }
    seen
}

enum AccumulatorState {
    Count(i64),
    Sum(f64),
    Avg { total: f64, count: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
}

impl AccumulatorState {
    fn new(accumulator: &Accumulator) -> AccumulatorState {
        match accumulator {
            Accumulator::Count => AccumulatorState::Count(0),
            Accumulator::Sum(_) => AccumulatorState::Sum(0.0),
            Accumulator::Avg(_) => AccumulatorState::Avg { total: 0.0, count: 0 },
            Accumulator::Min(_) => AccumulatorState::Min(None),
            Accumulator::Max(_) => AccumulatorState::Max(None),
        }
    }

    fn fold(&mut self, row: &DocumentData, accumulator: &Accumulator) {
        let numeric = accumulator
            .field()
            .and_then(|field| row.get(field))
            .and_then(|value| value.as_f64());
        match self {
            AccumulatorState::Count(count) => *count += 1,
            AccumulatorState::Sum(total) => {
                if let Some(n) = numeric {
                    *total += n;
                }
            }
            AccumulatorState::Avg { total, count } => {
                if let Some(n) = numeric {
                    *total += n;
                    *count += 1;
                }
            }
            AccumulatorState::Min(current) => {
                if let Some(n) = numeric {
                    *current = Some(current.map_or(n, |c| c.min(n)));
                }
            }
            AccumulatorState::Max(current) => {
                if let Some(n) = numeric {
                    *current = Some(current.map_or(n, |c| c.max(n)));
                }
            }
        }
    }

    fn finish(self) -> Value {
        match self {
            AccumulatorState::Count(count) => Value::I64(count),
            AccumulatorState::Sum(total) => Value::F64(total),
            AccumulatorState::Avg { total, count } => {
                if count == 0 {
                    Value::Null
                } else {
                    Value::F64(total / count as f64)
                }
            }
            AccumulatorState::Min(current) => current.map(Value::F64).unwrap_or(Value::Null),
            AccumulatorState::Max(current) => current.map(Value::F64).unwrap_or(Value::Null),
        }
    }
}

struct GroupState {
    key: Option<Value>,
    states: Vec<AccumulatorState>,
}

fn run_group(rows: Vec<DocumentData>, spec: &GroupSpec) -> Vec<DocumentData> {
    // groups keyed by the JSON rendering of the key value, first-seen order
    let mut groups: IndexMap<String, GroupState> = IndexMap::new();

    for row in rows {
        let key = spec
            .by()
            .map(|field| row.get(field).cloned().unwrap_or(Value::Null));
        let rendered = key
            .as_ref()
            .map(|v| crate::common::value_to_json(v).to_string())
            .unwrap_or_default();
        let state = groups.entry(rendered).or_insert_with(|| GroupState {
            key: key.clone(),
            states: spec
                .accumulators()
                .values()
                .map(AccumulatorState::new)
                .collect(),
        });
        for (state, (_, accumulator)) in state.states.iter_mut().zip(spec.accumulators().iter()) {
            state.fold(&row, accumulator);
        }
    }

    groups
        .into_values()
        .map(|group| {
            let mut row = DocumentData::new();
            if let (Some(field), Some(key)) = (spec.by(), group.key) {
                row.insert(field.to_string(), key);
            }
            for ((name, _), state) in spec.accumulators().iter().zip(group.states) {
                row.insert(name.clone(), state.finish());
            }
            row
        })
        .collect()
}

/// Evaluates the portable pipeline client-side over a collection's
/// documents.
///
/// This is the reference semantics every native translation must agree
/// with. The full stage set is supported in any order; stages apply
/// strictly in sequence.
pub fn run_pipeline(
    documents: Vec<Document>,
    stages: &[PipelineStage],
) -> IsotopeResult<Vec<DocumentData>> {
    let mut rows: Vec<DocumentData> = documents.iter().map(document_row).collect();

    for stage in stages {
        match stage {
            PipelineStage::Match(filter) => {
                rows.retain(|row| matches_row(row, filter));
            }
            PipelineStage::Sort(sort_by) => {
                sort_rows(&mut rows, sort_by);
            }
            PipelineStage::Skip(n) => {
                rows = apply_skip_limit(rows, Some(*n), None);
            }
            PipelineStage::Limit(n) => {
                rows = apply_skip_limit(rows, None, Some(*n));
            }
            PipelineStage::Group(spec) => {
                if spec.accumulators().is_empty() && spec.by().is_none() {
                    return Err(IsotopeError::invalid_argument(
                        "Group stage needs a group field or at least one accumulator",
                    ));
                }
                rows = run_group(rows, spec);
            }
            PipelineStage::Project(fields) => {
                rows = rows
                    .into_iter()
                    .map(|row| apply_projection(&row, fields))
                    .collect();
            }
        }
    }

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use crate::filter::field;
    use chrono::Utc;

    fn doc(collection: &str, id: &str, data: DocumentData) -> Document {
        Document::with_id(collection, id, data).into_first_version(Utc::now())
    }

    #[test]
    fn test_matches_filter_on_payload_and_id() {
        let document = doc("users", "u1", data! { name: "Alice", age: 30 });

        assert!(matches_filter(&document, &Filter::empty()));
        assert!(matches_filter(&document, &field("name").eq("Alice")));
        assert!(matches_filter(&document, &Filter::by_id("u1")));
        assert!(!matches_filter(&document, &field("name").eq("Bob")));
        assert!(!matches_filter(&document, &Filter::by_id("u2")));
        assert!(!matches_filter(&document, &field("missing").eq("x")));
    }

    #[test]
    fn test_matches_filter_numeric_equality_across_types() {
        let document = doc("users", "u1", data! { age: 30 });
        assert!(matches_filter(&document, &field("age").eq(30.0)));
    }

    #[test]
    fn test_sort_documents_missing_field_sorts_first_ascending() {
        let mut documents = vec![
            doc("users", "b", data! { age: 30 }),
            doc("users", "a", data! {}),
            doc("users", "c", data! { age: 25 }),
        ];
        sort_documents(
            &mut documents,
            &[("age".to_string(), SortOrder::Ascending)],
        );
        let ids: Vec<&str> = documents.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_sort_documents_by_id() {
        let mut documents = vec![
            doc("users", "b", data! {}),
            doc("users", "a", data! {}),
        ];
        sort_documents(&mut documents, &[(FIELD_ID.to_string(), SortOrder::Descending)]);
        let ids: Vec<&str> = documents.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_apply_find_options_paginates_and_projects() {
        let documents = vec![
            doc("users", "a", data! { age: 1, name: "a" }),
            doc("users", "b", data! { age: 2, name: "b" }),
            doc("users", "c", data! { age: 3, name: "c" }),
        ];
        let options = FindOptions::new()
            .sort_by("age", SortOrder::Descending)
            .skip(1)
            .limit(1)
            .project(&["name"]);
        let result = apply_find_options(documents, &options);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id(), "b");
        assert_eq!(result[0].data().len(), 1);
        assert_eq!(result[0].get("name"), Some(&Value::from("b")));
    }

    #[test]
    fn test_apply_update_sets_and_preserves() {
        let mut data = data! { a: 1, b: 2 };
        apply_update(&mut data, &data! { b: 3, c: 4 });
        assert_eq!(data, data! { a: 1, b: 3, c: 4 });
    }

    #[test]
    fn test_upsert_document_seeds_id_from_filter() {
        let filter = Filter::by_id("u7").and(field("region").eq("eu"));
        let document = upsert_document("users", &filter, &data! { active: true });

        assert_eq!(document.id(), "u7");
        assert_eq!(document.get("region"), Some(&Value::from("eu")));
        assert_eq!(document.get("active"), Some(&Value::Bool(true)));
        assert!(document.get("id").is_none());
    }

    #[test]
    fn test_upsert_payload_update_wins_over_filter() {
        let payload = upsert_payload(&field("age").eq(30), &data! { age: 31 });
        assert_eq!(payload, data! { age: 31 });
    }

    #[test]
    fn test_distinct_values_first_seen_order() {
        let documents = vec![
            doc("users", "a", data! { city: "NY" }),
            doc("users", "b", data! { city: "SF" }),
            doc("users", "c", data! { city: "NY" }),
            doc("users", "d", data! {}),
        ];
        let values = distinct_values(&documents, "city", &Filter::empty());
        assert_eq!(values, vec![Value::from("NY"), Value::from("SF")]);
    }

    #[test]
    fn test_run_pipeline_match_sort_paginate() {
        let documents = vec![
            doc("orders", "o1", data! { status: "done", amount: 10 }),
            doc("orders", "o2", data! { status: "open", amount: 99 }),
            doc("orders", "o3", data! { status: "done", amount: 30 }),
            doc("orders", "o4", data! { status: "done", amount: 20 }),
        ];
        let pipeline = vec![
            PipelineStage::Match(field("status").eq("done")),
            PipelineStage::Sort(vec![("amount".to_string(), SortOrder::Descending)]),
            PipelineStage::Skip(1),
            PipelineStage::Limit(1),
        ];
        let rows = run_pipeline(documents, &pipeline).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("id"), Some(&Value::from("o4")));
        assert_eq!(rows[0].get("amount"), Some(&Value::I64(20)));
    }

    #[test]
    fn test_run_pipeline_group_accumulators() {
        let documents = vec![
            doc("orders", "o1", data! { customer: "c1", amount: 10 }),
            doc("orders", "o2", data! { customer: "c2", amount: 5 }),
            doc("orders", "o3", data! { customer: "c1", amount: 20 }),
        ];
        let pipeline = vec![PipelineStage::Group(
            GroupSpec::by_field("customer")
                .accumulate("orders", Accumulator::Count)
                .accumulate("total", Accumulator::Sum("amount".into()))
                .accumulate("avg", Accumulator::Avg("amount".into()))
                .accumulate("min", Accumulator::Min("amount".into()))
                .accumulate("max", Accumulator::Max("amount".into())),
        )];
        let rows = run_pipeline(documents, &pipeline).unwrap();

        assert_eq!(rows.len(), 2);
        let c1 = rows
            .iter()
            .find(|r| r.get("customer") == Some(&Value::from("c1")))
            .unwrap();
        assert_eq!(c1.get("orders"), Some(&Value::I64(2)));
        assert_eq!(c1.get("total"), Some(&Value::F64(30.0)));
        assert_eq!(c1.get("avg"), Some(&Value::F64(15.0)));
        assert_eq!(c1.get("min"), Some(&Value::F64(10.0)));
        assert_eq!(c1.get("max"), Some(&Value::F64(20.0)));
    }

    #[test]
    fn test_run_pipeline_whole_collection_group() {
        let documents = vec![
            doc("orders", "o1", data! { amount: 10 }),
            doc("orders", "o2", data! { amount: 20 }),
        ];
        let pipeline = vec![PipelineStage::Group(
            GroupSpec::whole_collection().accumulate("n", Accumulator::Count),
        )];
        let rows = run_pipeline(documents, &pipeline).unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("n"), Some(&Value::I64(2)));
        assert!(rows[0].get("id").is_none());
    }

    #[test]
    fn test_run_pipeline_group_skips_non_numeric_values() {
        let documents = vec![
            doc("orders", "o1", data! { amount: 10 }),
            doc("orders", "o2", data! { amount: "not a number" }),
        ];
        let pipeline = vec![PipelineStage::Group(
            GroupSpec::whole_collection()
                .accumulate("total", Accumulator::Sum("amount".into()))
                .accumulate("avg", Accumulator::Avg("amount".into())),
        )];
        let rows = run_pipeline(documents, &pipeline).unwrap();

        assert_eq!(rows[0].get("total"), Some(&Value::F64(10.0)));
        assert_eq!(rows[0].get("avg"), Some(&Value::F64(10.0)));
    }

    #[test]
    fn test_run_pipeline_project_after_group() {
        let documents = vec![doc("orders", "o1", data! { customer: "c1", amount: 10 })];
        let pipeline = vec![
            PipelineStage::Group(
                GroupSpec::by_field("customer").accumulate("n", Accumulator::Count),
            ),
            PipelineStage::Project(vec!["n".to_string()]),
        ];
        let rows = run_pipeline(documents, &pipeline).unwrap();
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0].get("n"), Some(&Value::I64(1)));
    }

    #[test]
    fn test_run_pipeline_rejects_empty_group() {
        let result = run_pipeline(
            vec![],
            &[PipelineStage::Group(GroupSpec::whole_collection())],
        );
        assert!(result.is_err());
    }
}
