//! Query keys and their canonical encoding.
//!
//! A [`QueryKey`] is an ordered list of plain JSON-like segments, for example
//! `["appointments", 2024, 7]`. Before a key touches the store it is normalized
//! into a [`CanonicalKey`]: object properties are emitted in sorted order, so two
//! keys that differ only in property insertion order map to the same entry.
//!
//! # Example
//!
//! ```
//! use refetch::query_key;
//! use serde_json::json;
//!
//! let a = query_key!["posts", json!({"page": 1, "limit": 10})];
//! let b = query_key!["posts", json!({"limit": 10, "page": 1})];
//!
//! assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());
//! ```

use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use crate::error::InvalidKeyError;

/// Deepest nesting a segment may have. Owned values cannot be cyclic, so this is
/// what stands between a pathological key and unbounded recursion.
const MAX_DEPTH: usize = 32;

/// Builds a [`QueryKey`] from a list of segments.
///
/// Every segment must convert into a [`serde_json::Value`].
///
/// ```
/// use refetch::query_key;
///
/// let key = query_key!["appointments", 2024, 7];
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:expr),+ $(,)?) => {
        $crate::QueryKey::default()$(.with($segment))+
    };
}

/// The identity under which fetched data is cached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryKey {
    segments: Vec<Value>,
}

impl QueryKey {
    /// Creates a key with a single root segment.
    #[must_use]
    pub fn new(root: impl Into<Value>) -> Self {
        Self {
            segments: vec![root.into()],
        }
    }

    /// Creates a key from already-built segments.
    #[must_use]
    pub const fn from_segments(segments: Vec<Value>) -> Self {
        Self { segments }
    }

    /// Appends a segment.
    #[must_use]
    pub fn with(mut self, segment: impl Into<Value>) -> Self {
        self.segments.push(segment.into());
        self
    }

    /// Appends any serializable value as a segment.
    ///
    /// Fails when the value cannot be represented as plain data, for instance a
    /// type whose `Serialize` implementation refuses, or a map with non-string keys.
    pub fn try_segment<S: Serialize + ?Sized>(mut self, segment: &S) -> Result<Self, InvalidKeyError> {
        let value = serde_json::to_value(segment)
            .map_err(|e| InvalidKeyError::new(format!("segment {} is not plain data: {e}", self.segments.len())))?;
        self.segments.push(value);
        Ok(self)
    }

    /// The raw segments of this key.
    #[must_use]
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// Number of segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Returns `true` if the key has no segments.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Normalizes this key into its canonical, order-independent form.
    pub fn canonical(&self) -> Result<CanonicalKey, InvalidKeyError> {
        if self.segments.is_empty() {
            return Err(InvalidKeyError::new("query key has no segments"));
        }

        let segments = self
            .segments
            .iter()
            .enumerate()
            .map(|(index, value)| {
                let mut out = String::new();
                encode(value, 0, &mut out)
                    .map_err(|reason| InvalidKeyError::new(format!("segment {index}: {reason}")))?;
                Ok(out)
            })
            .collect::<Result<Vec<_>, InvalidKeyError>>()?;

        let encoded = format!("[{}]", segments.join(","));
        Ok(CanonicalKey { segments, encoded })
    }
}

impl From<&str> for QueryKey {
    fn from(root: &str) -> Self {
        Self::new(root)
    }
}

impl From<String> for QueryKey {
    fn from(root: String) -> Self {
        Self::new(root)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical() {
            Ok(canonical) => f.write_str(canonical.as_str()),
            Err(_) => write!(f, "{:?}", self.segments),
        }
    }
}

/// The normalized form of a [`QueryKey`].
///
/// Equality and hashing are plain string operations; no traversal happens at lookup
/// time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey {
    segments: Vec<String>,
    encoded: String,
}

impl CanonicalKey {
    /// The canonical string used as the store's map key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.encoded
    }

    /// Returns `true` if `prefix`'s segments are the leading segments of this key.
    #[must_use]
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.segments.starts_with(&prefix.segments)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encoded)
    }
}

fn encode(value: &Value, depth: usize, out: &mut String) -> Result<(), String> {
    if depth > MAX_DEPTH {
        return Err(format!("nested deeper than {MAX_DEPTH} levels"));
    }

    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => push_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                encode(item, depth + 1, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // `serde_json::Map` keeps insertion order when `preserve_order` is
            // enabled anywhere in the build, so sort explicitly.
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                push_string(name, out);
                out.push(':');
                encode(item, depth + 1, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn push_string(s: &str, out: &mut String) {
    // Serializing a `str` cannot fail.
    match serde_json::to_string(s) {
        Ok(quoted) => out.push_str(&quoted),
        Err(_) => {
            let _ = write!(out, "{s:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::ser::{Error as _, Serializer};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_object_order_does_not_matter() {
        let a = query_key!["appointments", json!({"year": 2024, "month": 7})];
        let b = query_key!["appointments", json!({"month": 7, "year": 2024})];
        assert_eq!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn test_segment_position_matters() {
        let a = query_key!["posts", 1, 2];
        let b = query_key!["posts", 2, 1];
        assert_ne!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn test_array_and_object_are_distinct() {
        let a = query_key!["x", json!([1, 2])];
        let b = query_key!["x", json!({"0": 1, "1": 2})];
        assert_ne!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn test_string_and_number_are_distinct() {
        let a = query_key!["posts", 1];
        let b = query_key!["posts", "1"];
        assert_ne!(a.canonical().unwrap(), b.canonical().unwrap());
    }

    #[test]
    fn test_canonical_string() {
        let key = query_key!["posts", 1, json!({"b": true, "a": null})];
        assert_eq!(
            key.canonical().unwrap().as_str(),
            r#"["posts",1,{"a":null,"b":true}]"#
        );
    }

    #[test]
    fn test_prefix_is_segment_wise() {
        let appointments = query_key!["appointments"].canonical().unwrap();
        let month = query_key!["appointments", 2024, 7].canonical().unwrap();
        let lookalike = query_key!["appointments-archive"].canonical().unwrap();

        assert!(month.starts_with(&appointments));
        assert!(appointments.starts_with(&appointments));
        assert!(!lookalike.starts_with(&appointments));
        assert!(!appointments.starts_with(&month));
    }

    #[test]
    fn test_empty_key_is_invalid() {
        assert!(QueryKey::default().canonical().is_err());
    }

    #[test]
    fn test_too_deep_is_invalid() {
        let mut value = json!(0);
        for _ in 0..=MAX_DEPTH {
            value = json!([value]);
        }
        let err = query_key!["deep", value].canonical().unwrap_err();
        assert!(err.to_string().contains("nested deeper"));
    }

    struct Handle;

    impl Serialize for Handle {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(S::Error::custom("live handles cannot be serialized"))
        }
    }

    #[test]
    fn test_unserializable_segment_is_invalid() {
        let err = QueryKey::new("files").try_segment(&Handle).unwrap_err();
        assert!(err.to_string().contains("not plain data"));
    }

    #[test]
    fn test_non_string_map_keys_are_invalid() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], "x");
        assert!(QueryKey::new("k").try_segment(&map).is_err());
    }

    #[test]
    fn test_structured_segment() {
        #[derive(Serialize)]
        struct MonthYear {
            year: u16,
            month: u8,
        }

        let key = QueryKey::new("appointments")
            .try_segment(&MonthYear { year: 2024, month: 7 })
            .unwrap();
        let expected = query_key!["appointments", json!({"month": 7, "year": 2024})];
        assert_eq!(key.canonical().unwrap(), expected.canonical().unwrap());
    }

    #[test]
    fn test_string_escaping() {
        let key = query_key!["a\"b", "c,d"];
        assert_eq!(key.canonical().unwrap().as_str(), r#"["a\"b","c,d"]"#);
    }

    proptest! {
        #[test]
        fn prop_property_order_is_irrelevant(fields in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..8)) {
            let forward: serde_json::Map<String, Value> =
                fields.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let backward: serde_json::Map<String, Value> =
                fields.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();

            let a = query_key!["q", Value::Object(forward)].canonical().unwrap();
            let b = query_key!["q", Value::Object(backward)].canonical().unwrap();
            prop_assert_eq!(a, b);
        }

        #[test]
        fn prop_distinct_integers_stay_distinct(x in any::<i64>(), y in any::<i64>()) {
            prop_assume!(x != y);
            let a = query_key!["q", x].canonical().unwrap();
            let b = query_key!["q", y].canonical().unwrap();
            prop_assert_ne!(a, b);
        }
    }
}
