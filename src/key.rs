//! Structured query keys and their canonical encoding.
//!
//! A [`QueryKey`] is an ordered list of JSON-safe segments such as
//! `["bookings", facility_id, page]`. Every key carries a canonical
//! [`KeyToken`]: two keys are equal exactly when their tokens are
//! byte-identical. Object segments are encoded with their fields sorted, so
//! property insertion order never changes the token.
//!
//! # Example
//!
//! ```
//! use cachet::query_key;
//!
//! let all_bookings = query_key!["bookings"].unwrap();
//! let page = query_key!["bookings", "F1", 2].unwrap();
//!
//! assert!(all_bookings.is_prefix_of(&page));
//! assert_eq!(page.token().as_str(), r#"["bookings","F1",2]"#);
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;
use serde_json::Value;

use crate::error::QueryError;

/// Builds a [`QueryKey`] from heterogeneous segments.
///
/// Each segment may be any `Serialize` value. The macro evaluates to
/// `Result<QueryKey, QueryError>` and fails with
/// [`QueryError::InvalidKeyError`] if a segment is not JSON-safe.
///
/// ```
/// use cachet::query_key;
///
/// let facility_id = String::from("F1");
/// let key = query_key!["facility", facility_id, serde_json::json!({ "page": 1 })].unwrap();
/// assert_eq!(key.len(), 3);
/// ```
#[macro_export]
macro_rules! query_key {
    () => {
        ::std::result::Result::<$crate::key::QueryKey, $crate::QueryError>::Ok(
            $crate::key::QueryKey::root(),
        )
    };
    ($($segment:expr),+ $(,)?) => {
        $crate::key::QueryKey::try_from_segments([$($crate::key::segment(&$segment)),+])
    };
}

/// The canonical, comparable encoding of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyToken(String);

impl KeyToken {
    /// Returns the token as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parses the token back into a key.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidKeyError`] if the token is not a JSON array.
    pub fn decode(&self) -> Result<QueryKey, QueryError> {
        decode(self.as_str())
    }
}

impl fmt::Display for KeyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An ordered identifier for a cached resource.
#[derive(Clone, Default)]
pub struct QueryKey {
    segments: Vec<Value>,
    encoded: Vec<String>,
    token: KeyToken,
}

impl Default for KeyToken {
    fn default() -> Self {
        Self("[]".to_string())
    }
}

impl QueryKey {
    /// The empty key. It is a prefix of every key, so it can be used to
    /// invalidate or observe the whole cache.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Creates a key from homogeneous segments.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidKeyError`] if a segment cannot be
    /// represented as JSON.
    pub fn new<S, I>(segments: I) -> Result<Self, QueryError>
    where
        S: Serialize,
        I: IntoIterator<Item = S>,
    {
        Self::try_from_segments(segments.into_iter().map(|s| segment(&s)))
    }

    /// Creates a key from already converted segments, failing on the first
    /// conversion error. This is what [`query_key!`] expands to.
    ///
    /// # Errors
    ///
    /// Returns the first error yielded by `segments`.
    pub fn try_from_segments<I>(segments: I) -> Result<Self, QueryError>
    where
        I: IntoIterator<Item = Result<Value, QueryError>>,
    {
        let segments = segments.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_values(segments))
    }

    /// Returns a new key with `segment` appended.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidKeyError`] if the segment cannot be
    /// represented as JSON.
    pub fn child(&self, segment_value: impl Serialize) -> Result<Self, QueryError> {
        let mut segments = self.segments.clone();
        segments.push(segment(&segment_value)?);
        Ok(Self::from_values(segments))
    }

    fn from_values(segments: Vec<Value>) -> Self {
        let encoded: Vec<String> = segments
            .iter()
            .map(|value| {
                let mut out = String::new();
                write_canonical(value, &mut out);
                out
            })
            .collect();
        let token = KeyToken(format!("[{}]", encoded.join(",")));

        Self {
            segments,
            encoded,
            token,
        }
    }

    #[must_use]
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Returns the canonical token of this key.
    #[must_use]
    pub const fn token(&self) -> &KeyToken {
        &self.token
    }

    /// Returns `true` if `other` starts with all of this key's segments.
    ///
    /// Matching is segment-wise: `["bookings", "12"]` is not a prefix of
    /// `["bookings", "123"]`.
    #[must_use]
    pub fn is_prefix_of(&self, other: &Self) -> bool {
        self.encoded.len() <= other.encoded.len()
            && self.encoded[..] == other.encoded[..self.encoded.len()]
    }
}

/// Returns the canonical token of `key`.
#[must_use]
pub fn encode(key: &QueryKey) -> KeyToken {
    key.token.clone()
}

/// Parses a canonical token back into a key.
///
/// # Errors
///
/// Returns [`QueryError::InvalidKeyError`] if `token` is not a JSON array.
pub fn decode(token: &str) -> Result<QueryKey, QueryError> {
    let segments: Vec<Value> = serde_json::from_str(token)
        .map_err(|e| QueryError::InvalidKeyError(format!("malformed key token {token}: {e}")))?;
    Ok(QueryKey::from_values(segments))
}

/// Returns `true` if `pattern` is a prefix of `key`.
#[must_use]
pub fn is_prefix(pattern: &QueryKey, key: &QueryKey) -> bool {
    pattern.is_prefix_of(key)
}

/// Converts a single value into a key segment.
///
/// # Errors
///
/// Returns [`QueryError::InvalidKeyError`] if the value's `Serialize` impl
/// fails or produces something JSON cannot hold (such as a map with
/// non-string keys).
pub fn segment<S: Serialize + ?Sized>(value: &S) -> Result<Value, QueryError> {
    serde_json::to_value(value).map_err(|e| QueryError::InvalidKeyError(e.to_string()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(name, out);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value's Display emits compact JSON with escaping.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

impl From<&str> for QueryKey {
    fn from(segment: &str) -> Self {
        Self::from_values(vec![Value::String(segment.to_owned())])
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.token.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.token.cmp(&other.token)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.token)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token.as_str())
    }
}
