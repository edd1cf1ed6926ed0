//! Mapping between the document model and the search index's JSON surface.

use serde_json::{json, Value as Json};

use isotope::common::constants::FIELD_ID;
use isotope::common::{data_from_json, data_to_json, value_to_json, Value};
use isotope::document::Document;
use isotope::errors::{ErrorKind, IsotopeError, IsotopeResult};
use isotope::filter::Filter;

/// Index name for a collection: prefix plus the lowercased collection name.
/// Collection names are validated to ASCII alphanumerics and underscores,
/// all of which the index naming rules accept.
pub(crate) fn index_name(prefix: &str, collection: &str) -> String {
    format!("{}{}", prefix, collection.to_lowercase())
}

/// Index creation body: payload strings index as keywords so equality
/// filters compare whole values, and the mapping `_meta` remembers the
/// original collection name for listing.
pub(crate) fn mappings_body(collection: &str) -> Json {
    json!({
        "mappings": {
            "_meta": { "collection": collection },
            "dynamic_templates": [
                {
                    "payload_strings_as_keywords": {
                        "path_match": "data.*",
                        "match_mapping_type": "string",
                        "mapping": { "type": "keyword" }
                    }
                }
            ],
            "properties": {
                "collection": { "type": "keyword" },
                "version": { "type": "long" },
                "created_at": { "type": "date", "format": "epoch_millis" },
                "updated_at": { "type": "date", "format": "epoch_millis" }
            }
        }
    })
}

pub(crate) fn source_from_document(document: &Document) -> Json {
    json!({
        "collection": document.collection(),
        "data": data_to_json(document.data()),
        "version": document.version(),
        "created_at": document.created_at().timestamp_millis(),
        "updated_at": document.updated_at().timestamp_millis(),
    })
}

pub(crate) fn document_from_source(
    collection: &str,
    id: &str,
    source: &Json,
) -> IsotopeResult<Document> {
    let data = source
        .get("data")
        .cloned()
        .ok_or_else(|| malformed(id, "no data field"))?;
    let data = data_from_json(data)?;
    let version = source
        .get("version")
        .and_then(Json::as_i64)
        .ok_or_else(|| malformed(id, "no version field"))?;
    let created_at = timestamp(source, "created_at", id)?;
    let updated_at = timestamp(source, "updated_at", id)?;
    Ok(Document::from_stored(
        id.to_string(),
        collection.to_string(),
        data,
        version,
        created_at,
        updated_at,
    ))
}

fn timestamp(source: &Json, field: &str, id: &str) -> IsotopeResult<chrono::DateTime<chrono::Utc>> {
    let millis = source
        .get(field)
        .and_then(Json::as_i64)
        .ok_or_else(|| malformed(id, "missing timestamp"))?;
    chrono::DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| malformed(id, "timestamp out of range"))
}

fn malformed(id: &str, detail: &str) -> IsotopeError {
    IsotopeError::new(
        &format!("Stored source for '{}' is malformed: {}", id, detail),
        ErrorKind::ValidationFailed,
    )
}

/// Renders a filter as a bool query of term clauses.
///
/// # Returns
///
/// `Ok(None)` when a condition cannot be pushed down (an explicit null,
/// which the index stores as an absent value) and the caller has to match
/// client-side instead.
pub(crate) fn query_for_filter(filter: &Filter) -> IsotopeResult<Option<Json>> {
    if filter.is_empty() {
        return Ok(Some(json!({ "match_all": {} })));
    }
    let mut clauses = Vec::new();
    for (field, value) in filter.conditions() {
        let clause = if field == FIELD_ID {
            match value {
                Value::String(id) => json!({ "ids": { "values": [id] } }),
                _ => {
                    return Err(IsotopeError::invalid_argument(
                        "id conditions must compare against a string",
                    ))
                }
            }
        } else {
            match value {
                Value::Null => return Ok(None),
                Value::Array(_) | Value::Object(_) => {
                    return Err(IsotopeError::unsupported(&format!(
                        "cannot compare the composite value filtered on field '{}'",
                        field
                    )))
                }
                value => {
                    json!({ "term": { format!("data.{}", field): value_to_json(value) } })
                }
            }
        };
        clauses.push(clause);
    }
    Ok(Some(json!({ "bool": { "filter": clauses } })))
}

/// Compare-and-set write: replaces the payload and bumps the version when
/// the stored version matches, otherwise turns the operation into a noop.
pub(crate) const WRITE_SCRIPT: &str = "if (ctx._source.version != params.expected) \
     { ctx.op = 'noop' } else \
     { ctx._source.data = params.data; \
       ctx._source.version = params.expected + 1; \
       ctx._source.updated_at = params.now }";

/// Compare-and-set delete.
pub(crate) const DELETE_SCRIPT: &str = "if (ctx._source.version == params.expected) \
     { ctx.op = 'delete' } else { ctx.op = 'noop' }";

pub(crate) fn write_script_body(data: &Json, expected: i64, now_millis: i64) -> Json {
    json!({
        "script": {
            "lang": "painless",
            "source": WRITE_SCRIPT,
            "params": { "expected": expected, "data": data, "now": now_millis }
        }
    })
}

pub(crate) fn delete_script_body(expected: i64) -> Json {
    json!({
        "script": {
            "lang": "painless",
            "source": DELETE_SCRIPT,
            "params": { "expected": expected }
        }
    })
}
