//! Query identity keys.

use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Segment name used for derived page keys.
const PAGE_SEGMENT: &str = "$page";

/// Canonical identity of a query.
///
/// A key is an ordered list of JSON segments. Two keys are equal when
/// their segments are structurally equal, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` identify the same query.
#[derive(Clone)]
pub struct QueryKey {
    segments: Vec<Value>,
    /// JSON rendering with sorted object keys, used for Eq/Hash/Ord.
    canonical: String,
}

impl QueryKey {
    /// Build a key from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Value>,
    {
        let segments: Vec<Value> = segments.into_iter().map(Into::into).collect();
        // serde_json's default map is ordered by key, so Display is canonical.
        let canonical = Value::Array(segments.clone()).to_string();
        Self {
            segments,
            canonical,
        }
    }

    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Key for page `index` of a paginated query rooted at this key.
    pub fn page(&self, index: usize) -> QueryKey {
        let mut segments = self.segments.clone();
        let mut marker = serde_json::Map::new();
        marker.insert(PAGE_SEGMENT.to_string(), Value::from(index));
        segments.push(Value::Object(marker));
        QueryKey::new(segments)
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for QueryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Build a [`QueryKey`] from JSON-literal segments.
///
/// ```ignore
/// let key = query_key!["products", { "category": "shoes", "limit": 20 }];
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),* $(,)?) => {
        $crate::QueryKey::new(::std::vec![$($crate::__json::json!($segment)),*])
    };
}
