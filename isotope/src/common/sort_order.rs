use serde::{Deserialize, Serialize};

/// Specifies the direction for sorting documents.
///
/// # Purpose
/// Defines whether documents should be sorted in ascending (low to high) or
/// descending (high to low) order. Used in find options, index keys, and
/// aggregation sort stages to control result ordering.
///
/// # Variants
/// - `Ascending`: Sort from smallest to largest value (A to Z, 0 to 9, oldest to newest)
/// - `Descending`: Sort from largest to smallest value (Z to A, 9 to 0, newest to oldest)
///
/// # Usage
/// Used with the `order_by()` helper function when querying collections:
/// ```text
/// let options = order_by("age", SortOrder::Ascending);
/// let docs = repo.find_with_options("users", &filter, &options).await?;
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Sort in ascending order (smallest to largest, A-Z, oldest to newest)
    Ascending,
    /// Sort in descending order (largest to smallest, Z-A, newest to oldest)
    Descending,
}

impl SortOrder {
    /// Returns `true` for [`SortOrder::Ascending`].
    pub fn is_ascending(&self) -> bool {
        matches!(self, SortOrder::Ascending)
    }
}
