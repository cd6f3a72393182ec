//! Keys, key ranges, and key paths.
//!
//! Every record in a store is addressed by a [`Key`]. Keys are totally
//! ordered across all variants so that stores and indexes can keep their
//! records in a single global key order: numbers sort before strings,
//! strings before binary, binary before arrays. Arrays compare
//! lexicographically element by element, which is what makes compound
//! keys work.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A primary or index key.
#[derive(Debug, Clone)]
pub enum Key {
    /// A numeric key. Integers and floats share this representation.
    Number(f64),
    /// A string key.
    String(String),
    /// A binary key.
    Binary(Vec<u8>),
    /// A compound key: an ordered list of component keys.
    Array(Vec<Key>),
}

impl Key {
    fn type_rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Binary(_) => 2,
            Key::Array(_) => 3,
        }
    }

    /// Converts a JSON value into a key, if the value is key-eligible.
    ///
    /// Numbers, strings, and arrays of key-eligible values convert;
    /// null, booleans, and objects do not.
    pub fn from_json(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_f64().map(Key::Number),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Renders the key back into a JSON value.
    ///
    /// Whole numbers come back as JSON integers so a generated key
    /// injected into a record reads as `1`, not `1.0`.
    pub fn to_json(&self) -> Value {
        match self {
            Key::Number(n) => {
                if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)
                }
            }
            Key::String(s) => Value::String(s.clone()),
            Key::Binary(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_json).collect()),
        }
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Binary(a), Key::Binary(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.cmp(y) {
                        Ordering::Equal => {}
                        non_eq => return non_eq,
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Number(n) => write!(f, "{n}"),
            Key::String(s) => write!(f, "{s:?}"),
            Key::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Key::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<u64> for Key {
    fn from(n: u64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Number(f64::from(n))
    }
}

impl From<f64> for Key {
    fn from(n: f64) -> Self {
        Key::Number(n)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Key::Binary(bytes)
    }
}

/// A contiguous range of keys, with independently open or closed bounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Lower bound, unbounded when `None`.
    pub lower: Option<Key>,
    /// Upper bound, unbounded when `None`.
    pub upper: Option<Key>,
    /// Whether the lower bound itself is excluded.
    pub lower_open: bool,
    /// Whether the upper bound itself is excluded.
    pub upper_open: bool,
}

impl KeyRange {
    /// The range covering every key.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// The range containing exactly one key.
    #[must_use]
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    /// Keys at or above (or, when `open`, strictly above) the bound.
    #[must_use]
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            upper: None,
            lower_open: open,
            upper_open: false,
        }
    }

    /// Keys at or below (or, when `open`, strictly below) the bound.
    #[must_use]
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: None,
            upper: Some(key.into()),
            lower_open: false,
            upper_open: open,
        }
    }

    /// Keys between the two bounds.
    #[must_use]
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            lower_open,
            upper_open,
        }
    }

    /// Whether the key falls inside this range.
    #[must_use]
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            match key.cmp(lower) {
                Ordering::Less => return false,
                Ordering::Equal if self.lower_open => return false,
                _ => {}
            }
        }
        if let Some(upper) = &self.upper {
            match key.cmp(upper) {
                Ordering::Greater => return false,
                Ordering::Equal if self.upper_open => return false,
                _ => {}
            }
        }
        true
    }
}

/// The field path a store or index derives its key from.
///
/// A single path may be dotted (`"profile.id"`) and resolves through
/// nested objects. A compound path derives an [`Key::Array`] from several
/// members; every member must resolve for the whole path to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyPath {
    /// One (possibly dotted) field path.
    Single(String),
    /// An ordered list of field paths producing a compound key.
    Compound(Vec<String>),
}

impl KeyPath {
    /// Creates a single-member key path.
    pub fn single(path: impl Into<String>) -> Self {
        KeyPath::Single(path.into())
    }

    /// Creates a compound key path.
    pub fn compound<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Compound(paths.into_iter().map(Into::into).collect())
    }

    /// The canonical comparison form: compound members joined with `,`.
    ///
    /// Two key paths describe the same derivation exactly when their
    /// serialized forms are equal; the schema reconciler compares these.
    #[must_use]
    pub fn serialize(&self) -> String {
        match self {
            KeyPath::Single(path) => path.clone(),
            KeyPath::Compound(paths) => paths.join(","),
        }
    }

    /// Derives a key from a record.
    ///
    /// Returns `None` when any member of the path is missing or the
    /// resolved value is not key-eligible.
    #[must_use]
    pub fn extract(&self, value: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => Key::from_json(resolve_path(value, path)?),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| Key::from_json(resolve_path(value, p)?))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// The raw value at a single-member path, for multi-entry fan-out.
    ///
    /// Compound paths never resolve here; multi-entry indexes are
    /// restricted to single paths.
    #[must_use]
    pub fn resolve<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        match self {
            KeyPath::Single(path) => resolve_path(value, path),
            KeyPath::Compound(_) => None,
        }
    }

    /// Writes a generated key into a record at a single-member path,
    /// creating intermediate objects as needed.
    ///
    /// Returns false for compound paths or when a path segment lands on
    /// a non-object.
    pub fn inject(&self, value: &mut Value, key: &Key) -> bool {
        let KeyPath::Single(path) = self else {
            return false;
        };
        let segments: Vec<&str> = path.split('.').collect();
        let mut current = value;
        for (i, segment) in segments.iter().enumerate() {
            let Value::Object(map) = current else {
                return false;
            };
            if i == segments.len() - 1 {
                map.insert((*segment).to_string(), key.to_json());
                return true;
            }
            current = map
                .entry((*segment).to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
        }
        false
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(path: String) -> Self {
        KeyPath::Single(path)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::compound(paths)
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(paths: Vec<String>) -> Self {
        KeyPath::Compound(paths)
    }
}

fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn cross_type_ordering() {
        let number = Key::from(10);
        let string = Key::from("a");
        let binary = Key::Binary(vec![0]);
        let array = Key::Array(vec![Key::from(0)]);

        assert!(number < string);
        assert!(string < binary);
        assert!(binary < array);
    }

    #[test]
    fn number_ordering() {
        assert!(Key::from(1) < Key::from(2));
        assert!(Key::from(-1.5) < Key::from(0));
        assert_eq!(Key::from(3), Key::Number(3.0));
    }

    #[test]
    fn array_ordering_is_lexicographic() {
        let short = Key::Array(vec![Key::from(1)]);
        let long = Key::Array(vec![Key::from(1), Key::from(0)]);
        let bigger = Key::Array(vec![Key::from(2)]);

        assert!(short < long);
        assert!(long < bigger);
    }

    #[test]
    fn range_contains_respects_open_bounds() {
        let range = KeyRange::bound(1, 5, true, false);
        assert!(!range.contains(&Key::from(1)));
        assert!(range.contains(&Key::from(2)));
        assert!(range.contains(&Key::from(5)));
        assert!(!range.contains(&Key::from(6)));

        assert!(KeyRange::all().contains(&Key::from("anything")));
        assert!(KeyRange::only("x").contains(&Key::from("x")));
        assert!(!KeyRange::only("x").contains(&Key::from("y")));
    }

    #[test]
    fn extract_single_and_dotted() {
        let record = json!({"id": 7, "profile": {"email": "a@b.c"}});
        assert_eq!(KeyPath::single("id").extract(&record), Some(Key::from(7)));
        assert_eq!(
            KeyPath::single("profile.email").extract(&record),
            Some(Key::from("a@b.c"))
        );
        assert_eq!(KeyPath::single("missing").extract(&record), None);
        assert_eq!(KeyPath::single("profile.missing").extract(&record), None);
    }

    #[test]
    fn extract_compound_requires_all_members() {
        let record = json!({"a": 1, "b": "two"});
        let path = KeyPath::compound(["a", "b"]);
        assert_eq!(
            path.extract(&record),
            Some(Key::Array(vec![Key::from(1), Key::from("two")]))
        );
        assert_eq!(KeyPath::compound(["a", "c"]).extract(&record), None);
    }

    #[test]
    fn extract_rejects_non_key_values() {
        let record = json!({"flag": true, "meta": {"x": 1}});
        assert_eq!(KeyPath::single("flag").extract(&record), None);
        assert_eq!(KeyPath::single("meta").extract(&record), None);
    }

    #[test]
    fn inject_creates_intermediates() {
        let mut record = json!({"name": "a"});
        assert!(KeyPath::single("id").inject(&mut record, &Key::from(4)));
        assert_eq!(record, json!({"name": "a", "id": 4}));

        let mut nested = json!({});
        assert!(KeyPath::single("meta.id").inject(&mut nested, &Key::from(9)));
        assert_eq!(nested, json!({"meta": {"id": 9}}));

        let mut scalar = json!(3);
        assert!(!KeyPath::single("id").inject(&mut scalar, &Key::from(1)));
    }

    #[test]
    fn serialized_form_joins_compound_members() {
        assert_eq!(KeyPath::single("id").serialize(), "id");
        assert_eq!(KeyPath::compound(["a", "b"]).serialize(), "a,b");
    }

    fn arb_key() -> impl Strategy<Value = Key> {
        let leaf = prop_oneof![
            any::<i32>().prop_map(Key::from),
            "[a-z]{0,4}".prop_map(Key::from),
            prop::collection::vec(any::<u8>(), 0..4).prop_map(Key::Binary),
        ];
        leaf.prop_recursive(2, 8, 3, |inner| {
            prop::collection::vec(inner, 0..3).prop_map(Key::Array)
        })
    }

    proptest! {
        #[test]
        fn ordering_is_total_and_transitive(a in arb_key(), b in arb_key(), c in arb_key()) {
            // antisymmetry
            if a < b {
                prop_assert!(b > a);
            }
            // transitivity
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
            // consistency of eq with cmp
            prop_assert_eq!(a == b, a.cmp(&b) == std::cmp::Ordering::Equal);
        }
    }
}
