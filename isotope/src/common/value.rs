use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorKind, IsotopeError, IsotopeResult};

/// The schemaless payload of a document: an insertion-ordered mapping of
/// field names to [Value]s.
pub type DocumentData = IndexMap<String, Value>;

/// Compare two floats with total ordering; NaN sorts greater than all other
/// values.
#[inline]
fn num_cmp_float(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Represents a document payload value. It can be a simple value like
/// [Value::I64] or [Value::String], or a complex value like [Value::Object]
/// or [Value::Array].
///
/// # Purpose
/// Provides a unified, backend-neutral representation for everything a
/// document payload can hold. The variant set is deliberately the JSON value
/// set, so payloads round-trip losslessly through every backend's wire format
/// (BSON documents, JSON columns, CQL text, search-index sources).
///
/// # Variants
/// - Null: Absence of a value
/// - Bool(bool): Boolean true/false
/// - I64(i64): Integer value
/// - F64(f64): Floating point value
/// - String(String): Text value
/// - Array(Vec<Value>): Ordered collection of values
/// - Object(DocumentData): Nested object
///
/// # Characteristics
/// - **Comparable**: cross-type ordering for sorts (Null < Bool < numbers < String < Array < Object)
/// - **Serializable**: untagged serde representation, identical to plain JSON
/// - **Default**: Defaults to Null
///
/// # Usage
/// Create values using the From trait or the `data!` macro:
/// ```text
/// let v1: Value = 42i64.into();
/// let v2 = Value::from("hello");
/// let payload = data! { age: 42, name: "Alice" };
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Represents a null value.
    #[default]
    Null,
    /// Represents a boolean value.
    Bool(bool),
    /// Represents a signed 64-bit integer value.
    I64(i64),
    /// Represents a 64-bit floating point value.
    F64(f64),
    /// Represents a string value.
    String(String),
    /// Represents an array value.
    Array(Vec<Value>),
    /// Represents a nested object value.
    Object(DocumentData),
}

impl Value {
    /// Returns the boolean payload if this value is a [Value::Bool].
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer payload if this value is a [Value::I64].
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the numeric payload of an [Value::I64] or [Value::F64].
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::I64(i) => Some(*i as f64),
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the string payload if this value is a [Value::String].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the array payload if this value is a [Value::Array].
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    /// Returns the object payload if this value is a [Value::Object].
    pub fn as_object(&self) -> Option<&DocumentData> {
        match self {
            Value::Object(data) => Some(data),
            _ => None,
        }
    }

    /// Returns `true` if this value is [Value::Null].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns `true` for [Value::I64] and [Value::F64].
    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::I64(_) | Value::F64(_))
    }

    // rank used for cross-type ordering
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::I64(_) | Value::F64(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            // integral and floating representations of the same number are equal
            (Value::I64(a), Value::F64(b)) | (Value::F64(b), Value::I64(a)) => *a as f64 == *b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => false,
        }
    }
}

/// Compares two values for sorting.
///
/// Values of the same type compare naturally; integers and floats compare
/// numerically with each other. Values of different types order by a fixed
/// type rank: Null < Bool < numbers < String < Array < Object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::I64(x), Value::I64(y)) => x.cmp(y),
        (Value::F64(x), Value::F64(y)) => num_cmp_float(*x, *y),
        (Value::I64(x), Value::F64(y)) => num_cmp_float(*x as f64, *y),
        (Value::F64(x), Value::I64(y)) => num_cmp_float(*x, *y as f64),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xv, yv) in x.iter().zip(y.iter()) {
                let ord = compare_values(xv, yv);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            for ((xk, xv), (yk, yv)) in x.iter().zip(y.iter()) {
                let ord = xk.cmp(yk).then_with(|| compare_values(xv, yv));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => a.type_rank().cmp(&b.type_rank()),
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::I64(i) => write!(f, "{}", i),
            Value::F64(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(values) => {
                write!(f, "[")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", value)?;
                }
                write!(f, "]")
            }
            Value::Object(data) => {
                write!(f, "{{")?;
                for (i, (key, value)) in data.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::I64(value as i64)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::I64(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::I64(value as i64)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::F64(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Array(value)
    }
}

impl From<DocumentData> for Value {
    fn from(value: DocumentData) -> Self {
        Value::Object(value)
    }
}

/// Converts a value into its JSON representation.
///
/// Integral values stay integral; the conversion is lossless for every
/// variant except [Value::F64] holding NaN or infinity, which JSON cannot
/// carry and which becomes null.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::I64(i) => serde_json::Value::from(*i),
        Value::F64(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Array(values) => serde_json::Value::Array(values.iter().map(value_to_json).collect()),
        Value::Object(data) => serde_json::Value::Object(
            data.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}

/// Converts a JSON value into a [Value].
///
/// Integral JSON numbers map to [Value::I64]; all other numbers map to
/// [Value::F64].
pub fn value_from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::I64(i)
            } else {
                Value::F64(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        serde_json::Value::String(s) => Value::String(s),
        serde_json::Value::Array(values) => {
            Value::Array(values.into_iter().map(value_from_json).collect())
        }
        serde_json::Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, value_from_json(v)))
                .collect(),
        ),
    }
}

/// Converts a document payload into a JSON object.
pub fn data_to_json(data: &DocumentData) -> serde_json::Value {
    serde_json::Value::Object(
        data.iter()
            .map(|(k, v)| (k.clone(), value_to_json(v)))
            .collect(),
    )
}

/// Converts a JSON value into a document payload.
///
/// # Returns
///
/// The payload, or a `ValidationFailed` error when the JSON value is not an
/// object.
pub fn data_from_json(json: serde_json::Value) -> IsotopeResult<DocumentData> {
    match json {
        serde_json::Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, value_from_json(v)))
            .collect()),
        other => Err(IsotopeError::new(
            &format!("Expected a JSON object payload, got: {}", other),
            ErrorKind::ValidationFailed,
        )),
    }
}

/// Parses a stored JSON text into a document payload.
pub fn data_from_json_text(text: &str) -> IsotopeResult<DocumentData> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| {
        IsotopeError::new(
            &format!("Stored payload is not valid JSON: {}", e),
            ErrorKind::ValidationFailed,
        )
    })?;
    data_from_json(json)
}

/// Renders a document payload as compact JSON text.
pub fn data_to_json_text(data: &DocumentData) -> String {
    data_to_json(data).to_string()
}

/// Creates a [DocumentData] payload from a literal.
///
/// Keys may be bare identifiers or string literals; values may be literals,
/// expressions, arrays, or nested objects.
///
/// # Examples
///
/// ```rust,ignore
/// use isotope::data;
///
/// let payload = data! {
///     name: "Alice",
///     age: 30,
///     address: { city: "New York", zip: "10001" },
///     tags: ["admin", "ops"],
/// };
/// ```
#[macro_export]
macro_rules! data {
    // match an empty payload (with braces)
    ({}) => {
        $crate::common::DocumentData::new()
    };

    // match an empty payload
    () => {
        $crate::common::DocumentData::new()
    };

    // match a payload with key value pairs (with outer braces)
    ({ $($body:tt)+ }) => {
        $crate::data!($($body)+)
    };

    // match a payload with key value pairs
    ($($body:tt)+) => {
        {
            let mut data = $crate::common::DocumentData::new();
            $crate::data_pairs!(data, $($body)+);
            data
        }
    };
}

/// Helper macro consuming `key : value` pairs for the `data!` macro.
/// A pair at a time so a negative literal (two tokens) still matches.
#[doc(hidden)]
#[macro_export]
macro_rules! data_pairs {
    ($data:ident $(,)?) => {};

    ($data:ident, $key:tt : - $value:tt $(, $($rest:tt)*)?) => {
        $data.insert(
            $crate::common::normalize_key(stringify!($key)),
            $crate::common::Value::from(-$value),
        );
        $crate::data_pairs!($data $(, $($rest)*)?);
    };

    ($data:ident, $key:tt : $value:tt $(, $($rest:tt)*)?) => {
        $data.insert(
            $crate::common::normalize_key(stringify!($key)),
            $crate::data_value!($value),
        );
        $crate::data_pairs!($data $(, $($rest)*)?);
    };
}

/// Helper macro consuming array elements for the `data!` macro.
#[doc(hidden)]
#[macro_export]
macro_rules! data_items {
    ($items:ident $(,)?) => {};

    ($items:ident, - $value:tt $(, $($rest:tt)*)?) => {
        $items.push($crate::common::Value::from(-$value));
        $crate::data_items!($items $(, $($rest)*)?);
    };

    ($items:ident, $value:tt $(, $($rest:tt)*)?) => {
        $items.push($crate::data_value!($value));
        $crate::data_items!($items $(, $($rest)*)?);
    };
}

/// Helper macro to convert values for the `data!` macro.
/// Handles nested objects, arrays, and expressions.
#[macro_export]
macro_rules! data_value {
    // match a nested object
    ({ $($body:tt)* }) => {
        $crate::common::Value::Object($crate::data!{ $($body)* })
    };

    // match an array of values
    ([ $($items:tt)* ]) => {
        {
            let mut items: ::std::vec::Vec<$crate::common::Value> = ::std::vec::Vec::new();
            $crate::data_items!(items, $($items)*);
            $crate::common::Value::Array(items)
        }
    };

    // match an expression (variable, function call, literal, etc.)
    ($value:expr) => {
        $crate::common::Value::from($value)
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data;

    #[test]
    fn test_value_equality_across_numeric_types() {
        assert_eq!(Value::I64(30), Value::F64(30.0));
        assert_ne!(Value::I64(30), Value::F64(30.5));
        assert_ne!(Value::I64(1), Value::Bool(true));
    }

    #[test]
    fn test_compare_values_same_type() {
        assert_eq!(compare_values(&Value::I64(1), &Value::I64(2)), Ordering::Less);
        assert_eq!(
            compare_values(&Value::String("b".into()), &Value::String("a".into())),
            Ordering::Greater
        );
        assert_eq!(compare_values(&Value::Null, &Value::Null), Ordering::Equal);
    }

    #[test]
    fn test_compare_values_objects_entry_by_entry() {
        let a = Value::Object(data! { a: 1 });
        let b = Value::Object(data! { b: 99 });
        assert_eq!(compare_values(&a, &b), Ordering::Less);
        assert_eq!(compare_values(&a, &Value::Object(data! { a: 1 })), Ordering::Equal);
        assert_eq!(
            compare_values(&Value::Object(data! { a: 2 }), &Value::Object(data! { a: 1 })),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compare_values_cross_type_rank() {
        assert_eq!(compare_values(&Value::Null, &Value::Bool(false)), Ordering::Less);
        assert_eq!(
            compare_values(&Value::String("a".into()), &Value::I64(9)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_compare_values_mixed_numbers() {
        assert_eq!(compare_values(&Value::I64(2), &Value::F64(2.5)), Ordering::Less);
        assert_eq!(compare_values(&Value::F64(3.0), &Value::I64(3)), Ordering::Equal);
    }

    #[test]
    fn test_json_round_trip_preserves_types() {
        let payload = data! {
            name: "Alice",
            age: 30,
            score: 99.5,
            active: true,
            tags: ["a", "b"],
            address: { city: "NY" },
            note: (Value::Null),
        };
        let json = data_to_json(&payload);
        let restored = data_from_json(json).unwrap();
        assert_eq!(restored, payload);
        assert_eq!(restored.get("age"), Some(&Value::I64(30)));
        assert_eq!(restored.get("score"), Some(&Value::F64(99.5)));
    }

    #[test]
    fn test_data_from_json_rejects_non_object() {
        let result = data_from_json(serde_json::json!([1, 2, 3]));
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_data_from_json_text_rejects_garbage() {
        let result = data_from_json_text("{not json");
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), &ErrorKind::ValidationFailed);
    }

    #[test]
    fn test_data_macro_builds_ordered_payload() {
        let payload = data! { b: 1, a: 2, "quoted key": 3 };
        let keys: Vec<&String> = payload.keys().collect();
        assert_eq!(keys, vec!["b", "a", "quoted key"]);
    }

    #[test]
    fn test_data_macro_empty() {
        let payload = data! {};
        assert!(payload.is_empty());
    }

    #[test]
    fn test_data_macro_negative_numbers() {
        let payload = data! { delta: -50, ratio: -0.5, series: [-1, 2, -3] };
        assert_eq!(payload.get("delta"), Some(&Value::I64(-50)));
        assert_eq!(payload.get("ratio"), Some(&Value::F64(-0.5)));
        assert_eq!(
            payload.get("series"),
            Some(&Value::Array(vec![
                Value::I64(-1),
                Value::I64(2),
                Value::I64(-3)
            ]))
        );
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::I64(4).as_f64(), Some(4.0));
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert!(Value::Null.is_null());
        assert!(Value::F64(1.5).is_numeric());
        assert_eq!(Value::Bool(true).as_bool(), Some(true));
        assert!(Value::from("x").as_i64().is_none());
    }

    #[test]
    fn test_display_renders_nested_values() {
        let payload = data! { a: [1, 2], b: { c: "d" } };
        let rendered = format!("{}", Value::Object(payload));
        assert_eq!(rendered, "{a: [1, 2], b: {c: d}}");
    }
}
