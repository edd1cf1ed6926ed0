//! Argument validation shared by every backend adapter.
//!
//! Adapters embed collection and field names into SQL text, CQL statements,
//! JSON paths, and index names, so names are restricted to a conservative
//! identifier charset and rejected up front with `InvalidArgument`.

use crate::common::constants::{INITIAL_VERSION, UNSAVED_VERSION};
use crate::common::DocumentData;
use crate::document::Document;
use crate::errors::{IsotopeError, IsotopeResult};
use crate::filter::Filter;

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validates a collection name: non-empty, ASCII alphanumeric or underscore.
pub fn collection_name(name: &str) -> IsotopeResult<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(IsotopeError::invalid_argument(&format!(
            "Invalid collection name: '{}'",
            name
        )))
    }
}

/// Validates a payload field name used in filters, sorts, projections,
/// groupings, and index keys.
pub fn field_name(field: &str) -> IsotopeResult<()> {
    if is_identifier(field) {
        Ok(())
    } else {
        Err(IsotopeError::invalid_argument(&format!(
            "Invalid field name: '{}'",
            field
        )))
    }
}

/// Validates every field a filter conditions on.
pub fn filter_fields(filter: &Filter) -> IsotopeResult<()> {
    for (field, _) in filter.conditions() {
        field_name(field)?;
    }
    Ok(())
}

/// Validates a document id: non-empty.
pub fn document_id(id: &str) -> IsotopeResult<()> {
    if id.is_empty() {
        Err(IsotopeError::invalid_argument("Document id must not be empty"))
    } else {
        Ok(())
    }
}

/// Validates an expected version for a compare-and-set mutation.
pub fn expected_version(version: i64) -> IsotopeResult<()> {
    if version < INITIAL_VERSION {
        Err(IsotopeError::invalid_argument(&format!(
            "Expected version must be at least {}, got {}",
            INITIAL_VERSION, version
        )))
    } else {
        Ok(())
    }
}

/// Validates a document handed to save: it must not carry a stored version.
pub fn unsaved_document(document: &Document) -> IsotopeResult<()> {
    collection_name(document.collection())?;
    if document.version() != UNSAVED_VERSION {
        Err(IsotopeError::invalid_argument(&format!(
            "Document already carries version {}; save only accepts unsaved documents",
            document.version()
        )))
    } else {
        Ok(())
    }
}

/// Validates a document handed to replace: it must identify a stored version.
pub fn stored_document(document: &Document) -> IsotopeResult<()> {
    collection_name(document.collection())?;
    document_id(document.id())?;
    expected_version(document.version())
}

/// Rejects an empty filter for collection-wide mutations.
///
/// `UpdateMany` and `DeleteMany` refuse to run unfiltered so a missing
/// filter cannot silently rewrite or clear a whole collection.
pub fn broad_mutation_filter(filter: &Filter, operation: &str) -> IsotopeResult<()> {
    if filter.is_empty() {
        Err(IsotopeError::invalid_argument(&format!(
            "{} requires a non-empty filter",
            operation
        )))
    } else {
        filter_fields(filter)
    }
}

/// Validates an update payload: at least one field, all names sane.
pub fn update_payload(update: &DocumentData) -> IsotopeResult<()> {
    if update.is_empty() {
        return Err(IsotopeError::invalid_argument(
            "Update payload must set at least one field",
        ));
    }
    for field in update.keys() {
        field_name(field)?;
    }
    Ok(())
}
