use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::errors::{ErrorKind, IsotopeError, IsotopeResult};

pub type Atomic<T> = Arc<RwLock<T>>;

#[inline]
pub fn atomic<T>(t: T) -> Atomic<T> {
    Arc::new(RwLock::new(t))
}

/// Converts a timestamp to milliseconds since the Unix epoch.
///
/// Millisecond precision is the wire resolution for `created_at` and
/// `updated_at` across every backend.
pub fn epoch_millis(timestamp: &DateTime<Utc>) -> i64 {
    timestamp.timestamp_millis()
}

/// Reconstructs a timestamp from milliseconds since the Unix epoch.
///
/// # Arguments
///
/// * `millis` - Milliseconds since 1970-01-01T00:00:00Z
///
/// # Returns
///
/// The timestamp, or a `ValidationFailed` error when the stored value is
/// outside the representable range.
pub fn from_epoch_millis(millis: i64) -> IsotopeResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| {
        IsotopeError::new(
            &format!("Invalid stored timestamp: {}", millis),
            ErrorKind::ValidationFailed,
        )
    })
}

/// Strips the surrounding quotes that `stringify!` leaves on string-literal
/// keys, so the `data!` macro accepts both bare and quoted keys.
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('"') && trimmed.ends_with('"') {
        trimmed[1..trimmed.len() - 1].to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_millis_round_trip() {
        let now = Utc::now();
        let millis = epoch_millis(&now);
        let restored = from_epoch_millis(millis).unwrap();
        assert_eq!(restored.timestamp_millis(), millis);
    }

    #[test]
    fn test_from_epoch_millis_rejects_out_of_range() {
        let result = from_epoch_millis(i64::MAX);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_normalize_key_strips_quotes() {
        assert_eq!(normalize_key("\"name\""), "name");
        assert_eq!(normalize_key("name"), "name");
        assert_eq!(normalize_key(" age "), "age");
    }

    #[test]
    fn test_atomic_shares_state() {
        let shared = atomic(1);
        let clone = shared.clone();
        *clone.write() = 2;
        assert_eq!(*shared.read(), 2);
    }
}
