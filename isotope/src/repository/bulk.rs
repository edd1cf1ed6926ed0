use std::collections::BTreeMap;

use crate::common::DocumentData;
use crate::document::Document;
use crate::errors::IsotopeError;
use crate::filter::Filter;

/// A single operation inside a bulk write.
///
/// Every operation names its target collection, so one bulk request may span
/// collections; the translator groups operations per collection before
/// dispatching them to the backend.
#[derive(Debug, Clone)]
pub enum BulkOperation {
    /// Insert a new document.
    Insert {
        collection: String,
        document: Document,
    },
    /// Apply a field-set update to matching documents.
    Update {
        collection: String,
        filter: Filter,
        update: DocumentData,
        multi: bool,
        upsert: bool,
    },
    /// Replace the payload of one matching document.
    Replace {
        collection: String,
        filter: Filter,
        data: DocumentData,
        upsert: bool,
    },
    /// Delete matching documents.
    Delete {
        collection: String,
        filter: Filter,
        multi: bool,
    },
}

impl BulkOperation {
    /// Returns the collection this operation targets.
    pub fn collection(&self) -> &str {
        match self {
            BulkOperation::Insert { collection, .. } => collection,
            BulkOperation::Update { collection, .. } => collection,
            BulkOperation::Replace { collection, .. } => collection,
            BulkOperation::Delete { collection, .. } => collection,
        }
    }
}

/// The outcome of a bulk write.
///
/// Execution is unordered and partial success is expected: failed operations
/// land in `errors` keyed by their submission index while independent
/// operations still take effect. Upserts that inserted report their document
/// ids in `upserted_ids`, also keyed by submission index.
#[derive(Debug, Clone, Default)]
pub struct BulkResult {
    inserted_count: u64,
    matched_count: u64,
    modified_count: u64,
    deleted_count: u64,
    upserted_ids: BTreeMap<usize, String>,
    errors: BTreeMap<usize, IsotopeError>,
}

impl BulkResult {
    pub fn new() -> BulkResult {
        BulkResult::default()
    }

    pub fn record_inserted(&mut self, count: u64) {
        self.inserted_count += count;
    }

    pub fn record_matched(&mut self, count: u64) {
        self.matched_count += count;
    }

    pub fn record_modified(&mut self, count: u64) {
        self.modified_count += count;
    }

    pub fn record_deleted(&mut self, count: u64) {
        self.deleted_count += count;
    }

    /// Records an upsert that inserted, keyed by the operation's submission
    /// index.
    pub fn record_upserted(&mut self, index: usize, id: String) {
        self.upserted_ids.insert(index, id);
    }

    /// Records a failed operation, keyed by its submission index.
    pub fn record_error(&mut self, index: usize, error: IsotopeError) {
        self.errors.insert(index, error);
    }

    /// Folds another result into this one.
    pub fn merge(&mut self, other: BulkResult) {
        self.inserted_count += other.inserted_count;
        self.matched_count += other.matched_count;
        self.modified_count += other.modified_count;
        self.deleted_count += other.deleted_count;
        self.upserted_ids.extend(other.upserted_ids);
        self.errors.extend(other.errors);
    }

    pub fn inserted_count(&self) -> u64 {
        self.inserted_count
    }

    pub fn matched_count(&self) -> u64 {
        self.matched_count
    }

    pub fn modified_count(&self) -> u64 {
        self.modified_count
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count
    }

    pub fn upserted_ids(&self) -> &BTreeMap<usize, String> {
        &self.upserted_ids
    }

    pub fn errors(&self) -> &BTreeMap<usize, IsotopeError> {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;
    use crate::errors::ErrorKind;
    use crate::filter::field;

    #[test]
    fn test_bulk_operation_collection() {
        let insert = BulkOperation::Insert {
            collection: "users".to_string(),
            document: Document::new("users", data! {}),
        };
        let delete = BulkOperation::Delete {
            collection: "orders".to_string(),
            filter: field("status").eq("stale"),
            multi: true,
        };
        assert_eq!(insert.collection(), "users");
        assert_eq!(delete.collection(), "orders");
    }

    #[test]
    fn test_bulk_result_accumulates_counts() {
        let mut result = BulkResult::new();
        result.record_inserted(2);
        result.record_matched(3);
        result.record_modified(3);
        result.record_deleted(1);

        assert_eq!(result.inserted_count(), 2);
        assert_eq!(result.matched_count(), 3);
        assert_eq!(result.modified_count(), 3);
        assert_eq!(result.deleted_count(), 1);
        assert!(!result.has_errors());
    }

    #[test]
    fn test_bulk_result_tracks_upserts_and_errors_by_index() {
        let mut result = BulkResult::new();
        result.record_upserted(4, "user-9".to_string());
        result.record_error(2, IsotopeError::invalid_argument("bad filter"));

        assert_eq!(result.upserted_ids().get(&4).map(String::as_str), Some("user-9"));
        assert_eq!(
            result.errors().get(&2).map(|e| e.kind().clone()),
            Some(ErrorKind::InvalidArgument)
        );
        assert!(result.has_errors());
    }

    #[test]
    fn test_bulk_result_merge() {
        let mut left = BulkResult::new();
        left.record_inserted(1);
        left.record_upserted(0, "a".to_string());

        let mut right = BulkResult::new();
        right.record_inserted(2);
        right.record_error(3, IsotopeError::not_found("missing"));

        left.merge(right);
        assert_eq!(left.inserted_count(), 3);
        assert_eq!(left.upserted_ids().len(), 1);
        assert_eq!(left.errors().len(), 1);
    }
}
