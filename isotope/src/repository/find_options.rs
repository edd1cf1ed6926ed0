use smallvec::SmallVec;

use crate::common::SortOrder;

/// Options for controlling find operations on documents.
///
/// `FindOptions` allows you to specify sorting, pagination, and projection
/// for query results. It supports method chaining for convenient
/// configuration.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::repository::FindOptions;
/// use isotope::common::SortOrder;
///
/// // Create options with sorting, skip, and limit
/// let options = FindOptions::new()
///     .sort_by("age", SortOrder::Descending)
///     .skip(10)
///     .limit(20);
///
/// // Use convenience functions
/// let options = order_by("name", SortOrder::Ascending);
/// let options = skip_by(5);
/// let options = limit_to(100);
/// let options = project(&["name", "age"]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct FindOptions {
    pub sort_by: SmallVec<[(String, SortOrder); 2]>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Vec<String>>,
}

/// Creates `FindOptions` with sorting by a field.
///
/// # Arguments
///
/// * `field_name` - The field to sort by
/// * `sort_order` - The sort order (Ascending or Descending)
///
/// # Returns
///
/// A new `FindOptions` with sorting configured
pub fn order_by(field_name: &str, sort_order: SortOrder) -> FindOptions {
    FindOptions::new().sort_by(field_name, sort_order)
}

/// Creates `FindOptions` that skips a number of results.
///
/// Useful for pagination: skip the first N results and process the remaining.
///
/// # Arguments
///
/// * `skip` - Number of documents to skip
///
/// # Returns
///
/// A new `FindOptions` with skip configured
pub fn skip_by(skip: u64) -> FindOptions {
    FindOptions::new().skip(skip)
}

/// Creates `FindOptions` that limits the number of results.
///
/// Combined with skip for pagination: skip(10).limit(20) returns results
/// 11-30 of the sorted result set.
///
/// # Arguments
///
/// * `limit` - Maximum number of documents to return
///
/// # Returns
///
/// A new `FindOptions` with limit configured
pub fn limit_to(limit: u64) -> FindOptions {
    FindOptions::new().limit(limit)
}

/// Creates `FindOptions` that trims returned payloads to the given fields.
///
/// Projection applies to payload fields only; document metadata (id,
/// collection, version, timestamps) is always returned.
pub fn project(fields: &[&str]) -> FindOptions {
    FindOptions::new().project(fields)
}

impl FindOptions {
    /// Creates a new `FindOptions` with default settings.
    pub fn new() -> FindOptions {
        FindOptions {
            sort_by: SmallVec::new(),
            skip: None,
            limit: None,
            projection: None,
        }
    }

    /// Appends a sort field; earlier fields take precedence.
    pub fn sort_by(mut self, field_name: &str, sort_order: SortOrder) -> FindOptions {
        self.sort_by.push((field_name.to_string(), sort_order));
        self
    }

    /// Sets the number of documents to skip.
    ///
    /// # Arguments
    ///
    /// * `skip` - Number of documents to skip from the beginning
    pub fn skip(mut self, skip: u64) -> FindOptions {
        self.skip = Some(skip);
        self
    }

    /// Sets the maximum number of documents to return.
    ///
    /// # Arguments
    ///
    /// * `limit` - Maximum number of documents to return
    pub fn limit(mut self, limit: u64) -> FindOptions {
        self.limit = Some(limit);
        self
    }

    /// Restricts returned payloads to the given fields.
    pub fn project(mut self, fields: &[&str]) -> FindOptions {
        self.projection = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Returns `true` when no option is set.
    pub fn is_plain(&self) -> bool {
        self.sort_by.is_empty() && self.skip.is_none() && self.limit.is_none() && self.projection.is_none()
    }
}

impl Default for FindOptions {
    fn default() -> Self {
        FindOptions::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by() {
        let options = order_by("name", SortOrder::Ascending);

        assert_eq!(options.sort_by.len(), 1);
        assert_eq!(options.sort_by[0].0, "name");
        assert_eq!(options.sort_by[0].1, SortOrder::Ascending);
        assert!(options.skip.is_none());
        assert!(options.limit.is_none());
    }

    #[test]
    fn test_skip_by() {
        let options = skip_by(10);

        assert_eq!(options.skip, Some(10));
        assert!(options.sort_by.is_empty());
        assert!(options.limit.is_none());
        assert!(options.projection.is_none());
    }

    #[test]
    fn test_limit_to() {
        let options = limit_to(5);

        assert_eq!(options.limit, Some(5));
        assert!(options.sort_by.is_empty());
        assert!(options.skip.is_none());
    }

    #[test]
    fn test_project() {
        let options = project(&["name", "age"]);

        assert_eq!(
            options.projection,
            Some(vec!["name".to_string(), "age".to_string()])
        );
    }

    #[test]
    fn test_find_options_chaining() {
        let options = FindOptions::new()
            .sort_by("age", SortOrder::Descending)
            .sort_by("name", SortOrder::Ascending)
            .skip(10)
            .limit(20);

        assert_eq!(options.sort_by.len(), 2);
        assert_eq!(options.sort_by[0].0, "age");
        assert_eq!(options.sort_by[1].0, "name");
        assert_eq!(options.skip, Some(10));
        assert_eq!(options.limit, Some(20));
    }

    #[test]
    fn test_find_options_default_is_plain() {
        let options = FindOptions::default();

        assert!(options.is_plain());
    }
}
