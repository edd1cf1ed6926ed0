use serde::{Deserialize, Serialize};

use crate::common::SortOrder;
use crate::filter::Filter;

/// A single indexed field with its sort direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexKey {
    pub field: String,
    pub order: SortOrder,
}

impl IndexKey {
    /// Creates an ascending key on the given field.
    pub fn asc(field: &str) -> IndexKey {
        IndexKey {
            field: field.to_string(),
            order: SortOrder::Ascending,
        }
    }

    /// Creates a descending key on the given field.
    pub fn desc(field: &str) -> IndexKey {
        IndexKey {
            field: field.to_string(),
            order: SortOrder::Descending,
        }
    }
}

/// Options attached to an index definition.
///
/// The same shape is accepted by every adapter; each adapter honours the
/// subset its engine can express and answers `Unsupported` for the rest
/// rather than silently dropping an option.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: bool,
    pub sparse: bool,
    pub ttl_seconds: Option<i64>,
    pub partial_filter: Option<Filter>,
    pub text: bool,
}

impl IndexOptions {
    pub fn new() -> IndexOptions {
        IndexOptions::default()
    }

    /// Sets an explicit index name; otherwise a deterministic name is
    /// derived from the collection and keys.
    pub fn named(mut self, name: &str) -> IndexOptions {
        self.name = Some(name.to_string());
        self
    }

    /// Marks the index unique.
    pub fn unique(mut self) -> IndexOptions {
        self.unique = true;
        self
    }

    /// Marks the index sparse: documents missing the indexed fields are not
    /// indexed.
    pub fn sparse(mut self) -> IndexOptions {
        self.sparse = true;
        self
    }

    /// Expires documents this many seconds after their indexed timestamp.
    pub fn ttl_seconds(mut self, seconds: i64) -> IndexOptions {
        self.ttl_seconds = Some(seconds);
        self
    }

    /// Restricts the index to documents matching the filter.
    pub fn partial(mut self, filter: Filter) -> IndexOptions {
        self.partial_filter = Some(filter);
        self
    }

    /// Marks the index as a text index over the keyed fields.
    pub fn text(mut self) -> IndexOptions {
        self.text = true;
        self
    }
}

/// A backend-neutral secondary index definition.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::repository::{IndexKey, IndexModel, IndexOptions};
///
/// let by_email = IndexModel::on("email").with_options(IndexOptions::new().unique());
/// let compound = IndexModel::new(vec![IndexKey::asc("last_name"), IndexKey::desc("age")]);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexModel {
    keys: Vec<IndexKey>,
    options: IndexOptions,
}

impl IndexModel {
    /// Creates an index over the given keys with default options.
    pub fn new(keys: Vec<IndexKey>) -> IndexModel {
        IndexModel {
            keys,
            options: IndexOptions::default(),
        }
    }

    /// Creates a single-field ascending index.
    pub fn on(field: &str) -> IndexModel {
        IndexModel::new(vec![IndexKey::asc(field)])
    }

    /// Attaches options to this index definition.
    pub fn with_options(mut self, options: IndexOptions) -> IndexModel {
        self.options = options;
        self
    }

    pub fn keys(&self) -> &[IndexKey] {
        &self.keys
    }

    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// Returns the deterministic name derived from the collection and keys,
    /// used when no explicit name is set.
    pub fn derived_name(&self, collection: &str) -> String {
        let mut name = format!("ix_{}", collection);
        for key in &self.keys {
            let direction = match key.order {
                SortOrder::Ascending => "asc",
                SortOrder::Descending => "desc",
            };
            name.push('_');
            name.push_str(&key.field);
            name.push('_');
            name.push_str(direction);
        }
        name
    }

    /// Returns the explicit name when set, the derived name otherwise.
    pub fn resolve_name(&self, collection: &str) -> String {
        self.options
            .name
            .clone()
            .unwrap_or_else(|| self.derived_name(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::field;

    #[test]
    fn test_index_model_on_single_field() {
        let model = IndexModel::on("email");
        assert_eq!(model.keys().len(), 1);
        assert_eq!(model.keys()[0].field, "email");
        assert_eq!(model.keys()[0].order, SortOrder::Ascending);
        assert!(!model.options().unique);
    }

    #[test]
    fn test_index_options_builders() {
        let options = IndexOptions::new()
            .named("by_email")
            .unique()
            .sparse()
            .ttl_seconds(3600)
            .partial(field("active").eq(true))
            .text();

        assert_eq!(options.name.as_deref(), Some("by_email"));
        assert!(options.unique);
        assert!(options.sparse);
        assert_eq!(options.ttl_seconds, Some(3600));
        assert!(options.partial_filter.is_some());
        assert!(options.text);
    }

    #[test]
    fn test_derived_name_encodes_keys_and_directions() {
        let model = IndexModel::new(vec![IndexKey::asc("last_name"), IndexKey::desc("age")]);
        assert_eq!(model.derived_name("users"), "ix_users_last_name_asc_age_desc");
    }

    #[test]
    fn test_resolve_name_prefers_explicit_name() {
        let model = IndexModel::on("email").with_options(IndexOptions::new().named("by_email"));
        assert_eq!(model.resolve_name("users"), "by_email");

        let unnamed = IndexModel::on("email");
        assert_eq!(unnamed.resolve_name("users"), "ix_users_email_asc");
    }

    #[test]
    fn test_index_model_serde_round_trip() {
        let model = IndexModel::on("email").with_options(IndexOptions::new().unique());
        let encoded = serde_json::to_string(&model).unwrap();
        let decoded: IndexModel = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, model);
    }
}
