//! Ordered, de-duplicated id sets stored as JSON arrays in the state tree.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Insertion-ordered set of ids.
///
/// Kept in the tree as a plain JSON array so it survives snapshots. Numeric
/// ids read from the tree are normalized to their decimal string form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct SelectionSet {
    ids: Vec<String>,
}

impl SelectionSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a set from a tree value. Anything that is not an array reads as
    /// empty; non-scalar elements are skipped.
    pub fn from_value(value: Option<&Value>) -> Self {
        let Some(Value::Array(items)) = value else {
            return Self::new();
        };
        items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }

    /// The JSON array form written back into the tree.
    pub fn to_value(&self) -> Value {
        Value::Array(self.ids.iter().cloned().map(Value::String).collect())
    }

    /// Add `id`; returns `false` if already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.contains(&id) {
            return false;
        }
        self.ids.push(id);
        true
    }

    /// Remove `id`; returns `false` if absent.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.ids.len();
        self.ids.retain(|x| x != id);
        self.ids.len() < before
    }

    /// Remove `id` if present, insert it otherwise. Returns whether it is now
    /// selected.
    pub fn toggle(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if self.remove(&id) {
            false
        } else {
            self.ids.push(id);
            true
        }
    }

    /// Whether `id` is selected.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|x| x == id)
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing is selected.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.ids.iter().map(String::as_str)
    }

    /// Deselect everything.
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl FromIterator<String> for SelectionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            let _ = set.insert(id);
        }
        set
    }
}

impl From<Vec<String>> for SelectionSet {
    fn from(ids: Vec<String>) -> Self {
        ids.into_iter().collect()
    }
}

impl From<SelectionSet> for Vec<String> {
    fn from(set: SelectionSet) -> Self {
        set.ids
    }
}
