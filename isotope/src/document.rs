//! The versioned document envelope stored by every backend.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::common::constants::{
    FIELD_COLLECTION, FIELD_CREATED_AT, FIELD_DATA, FIELD_ID, FIELD_UPDATED_AT, FIELD_VERSION,
    INITIAL_VERSION, UNSAVED_VERSION,
};
use crate::common::{data_from_json, data_to_json, DocumentData, Value};
use crate::errors::{ErrorKind, IsotopeError, IsotopeResult};

/// A schemaless document with optimistic-concurrency metadata.
///
/// A document couples an opaque `id`, the owning `collection` name, a
/// schemaless `data` payload, a monotonically increasing `version`, and
/// creation/update timestamps. The version starts at 1 on first save and
/// increments by exactly 1 for every accepted mutation; a mutation carrying a
/// stale expected version is rejected with `VersionConflict` and never merged.
///
/// Instances are immutable from the caller's point of view: mutations go
/// through the repository, which returns a new `Document` reflecting the
/// accepted state.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::data;
/// use isotope::document::Document;
///
/// let doc = Document::new("users", data! { name: "Alice", age: 30 });
/// assert_eq!(doc.collection(), "users");
/// assert!(doc.id().is_empty()); // assigned on save
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    id: String,
    collection: String,
    data: DocumentData,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Document {
    /// Creates an unsaved document for the given collection.
    ///
    /// The id remains empty until save assigns a generated one; the version
    /// is the unsaved sentinel 0.
    pub fn new(collection: &str, data: DocumentData) -> Document {
        let now = Utc::now();
        Document {
            id: String::new(),
            collection: collection.to_string(),
            data,
            version: UNSAVED_VERSION,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates an unsaved document with a caller-supplied id.
    pub fn with_id(collection: &str, id: &str, data: DocumentData) -> Document {
        let mut doc = Document::new(collection, data);
        doc.id = id.to_string();
        doc
    }

    /// Rehydrates a document from its stored representation.
    ///
    /// Backend adapters use this when decoding rows, BSON documents, or
    /// search hits back into the contract shape.
    pub fn from_stored(
        id: String,
        collection: String,
        data: DocumentData,
        version: i64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Document {
        Document {
            id,
            collection,
            data,
            version,
            created_at,
            updated_at,
        }
    }

    /// Consumes an unsaved document and produces its first stored version.
    ///
    /// Assigns a generated id when the caller did not supply one, sets the
    /// version to 1, and stamps both timestamps with `now`.
    pub fn into_first_version(self, now: DateTime<Utc>) -> Document {
        let id = if self.id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            self.id
        };
        Document {
            id,
            collection: self.collection,
            data: self.data,
            version: INITIAL_VERSION,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns a copy of this document carrying a replacement payload.
    ///
    /// The id, collection, version, and timestamps are preserved, so the copy
    /// is ready to hand to `replace` for a compare-and-set on the observed
    /// version.
    pub fn with_data(&self, data: DocumentData) -> Document {
        Document {
            id: self.id.clone(),
            collection: self.collection.clone(),
            data,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn data(&self) -> &DocumentData {
        &self.data
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns a payload field by name.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Renders the document in the external wire shape.
    ///
    /// The wire shape is `{id, collection, data, version, created_at,
    /// updated_at}` with RFC 3339 timestamps.
    pub fn to_wire_json(&self) -> serde_json::Value {
        serde_json::json!({
            FIELD_ID: self.id,
            FIELD_COLLECTION: self.collection,
            FIELD_DATA: data_to_json(&self.data),
            FIELD_VERSION: self.version,
            FIELD_CREATED_AT: self.created_at.to_rfc3339(),
            FIELD_UPDATED_AT: self.updated_at.to_rfc3339(),
        })
    }

    /// Parses a document from the external wire shape.
    ///
    /// # Returns
    ///
    /// The document, or a `ValidationFailed` error when a field is missing or
    /// carries the wrong type.
    pub fn from_wire_json(json: serde_json::Value) -> IsotopeResult<Document> {
        let wire_error =
            |field: &str| IsotopeError::validation_failed(&format!("Wire document missing or invalid field: {}", field));

        let object = match json {
            serde_json::Value::Object(map) => map,
            _ => return Err(IsotopeError::validation_failed("Wire document must be a JSON object")),
        };
        let id = object
            .get(FIELD_ID)
            .and_then(|v| v.as_str())
            .ok_or_else(|| wire_error(FIELD_ID))?
            .to_string();
        let collection = object
            .get(FIELD_COLLECTION)
            .and_then(|v| v.as_str())
            .ok_or_else(|| wire_error(FIELD_COLLECTION))?
            .to_string();
        let version = object
            .get(FIELD_VERSION)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| wire_error(FIELD_VERSION))?;
        let data = data_from_json(
            object
                .get(FIELD_DATA)
                .cloned()
                .ok_or_else(|| wire_error(FIELD_DATA))?,
        )?;
        let created_at = parse_wire_timestamp(&object, FIELD_CREATED_AT)?;
        let updated_at = parse_wire_timestamp(&object, FIELD_UPDATED_AT)?;

        Ok(Document {
            id,
            collection,
            data,
            version,
            created_at,
            updated_at,
        })
    }
}

fn parse_wire_timestamp(
    object: &serde_json::Map<String, serde_json::Value>,
    field: &str,
) -> IsotopeResult<DateTime<Utc>> {
    let raw = object
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            IsotopeError::validation_failed(&format!("Wire document missing or invalid field: {}", field))
        })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            IsotopeError::new(
                &format!("Wire timestamp {} is not RFC 3339: {}", field, e),
                ErrorKind::ValidationFailed,
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;

    #[test]
    fn test_new_document_is_unsaved() {
        let doc = Document::new("users", data! { name: "Alice" });
        assert!(doc.id().is_empty());
        assert_eq!(doc.collection(), "users");
        assert_eq!(doc.version(), UNSAVED_VERSION);
        assert_eq!(doc.get("name"), Some(&Value::from("Alice")));
    }

    #[test]
    fn test_with_id_keeps_caller_id() {
        let doc = Document::with_id("users", "user-1", data! {});
        assert_eq!(doc.id(), "user-1");
        assert_eq!(doc.version(), UNSAVED_VERSION);
    }

    #[test]
    fn test_into_first_version_assigns_generated_id() {
        let now = Utc::now();
        let doc = Document::new("users", data! { name: "Alice" }).into_first_version(now);
        assert!(!doc.id().is_empty());
        assert_eq!(doc.version(), INITIAL_VERSION);
        assert_eq!(doc.created_at(), now);
        assert_eq!(doc.updated_at(), now);
    }

    #[test]
    fn test_into_first_version_preserves_caller_id() {
        let now = Utc::now();
        let doc = Document::with_id("users", "user-1", data! {}).into_first_version(now);
        assert_eq!(doc.id(), "user-1");
        assert_eq!(doc.version(), INITIAL_VERSION);
    }

    #[test]
    fn test_with_data_preserves_identity_and_version() {
        let now = Utc::now();
        let doc = Document::with_id("users", "user-1", data! { a: 1 }).into_first_version(now);
        let replacement = doc.with_data(data! { b: 2 });
        assert_eq!(replacement.id(), doc.id());
        assert_eq!(replacement.version(), doc.version());
        assert_eq!(replacement.get("b"), Some(&Value::I64(2)));
        assert!(replacement.get("a").is_none());
    }

    #[test]
    fn test_wire_json_round_trip() {
        let now = Utc::now();
        let doc = Document::with_id("users", "user-1", data! { name: "Alice", age: 30 })
            .into_first_version(now);
        let wire = doc.to_wire_json();
        assert_eq!(wire["id"], "user-1");
        assert_eq!(wire["collection"], "users");
        assert_eq!(wire["version"], 1);

        let restored = Document::from_wire_json(wire).unwrap();
        assert_eq!(restored.id(), doc.id());
        assert_eq!(restored.data(), doc.data());
        assert_eq!(restored.version(), doc.version());
        assert_eq!(
            restored.created_at().timestamp_millis(),
            doc.created_at().timestamp_millis()
        );
    }

    #[test]
    fn test_from_wire_json_rejects_missing_fields() {
        let result = Document::from_wire_json(serde_json::json!({ "id": "x" }));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::ValidationFailed);
    }
}
