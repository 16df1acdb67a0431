//! Dot-path addressing over a JSON tree.
//!
//! Paths are dot-separated segments (`"ui.loading.suites"`). Object members
//! are addressed by key; array elements by decimal index.

use serde_json::{Map, Value};

/// Split `path` into segments, or `None` when it is empty or contains an
/// empty segment (`"a..b"`, `".a"`).
pub fn segments(path: &str) -> Option<Vec<&str>> {
    if path.is_empty() {
        return None;
    }
    let segs: Vec<&str> = path.split('.').collect();
    if segs.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segs)
}

/// Resolve `segs` under `root`. Any missing intermediate yields `None`.
pub fn lookup<'a>(root: &'a Value, segs: &[&str]) -> Option<&'a Value> {
    segs.iter().try_fold(root, |node, seg| match node {
        Value::Object(map) => map.get(*seg),
        Value::Array(items) => seg.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Write `value` at `segs`, creating intermediate objects, and return the
/// previous leaf.
///
/// An intermediate that is neither an object nor an in-bounds array slot is
/// replaced by an empty object. Nothing is rolled back.
pub fn assign(root: &mut Value, segs: &[&str], value: Value) -> Option<Value> {
    let (leaf, parents) = segs.split_last()?;
    let mut node = root;
    for seg in parents {
        node = child_mut(node, seg);
    }
    match (array_index(node, leaf), node) {
        (Some(i), Value::Array(items)) => Some(std::mem::replace(&mut items[i], value)),
        (_, node) => as_object(node).insert((*leaf).to_owned(), value),
    }
}

/// Remove the leaf at `segs` and return it. Parents are left in place, even
/// when they become empty.
pub fn remove(root: &mut Value, segs: &[&str]) -> Option<Value> {
    let (leaf, parents) = segs.split_last()?;
    let mut node = root;
    for seg in parents {
        node = match node {
            Value::Object(map) => map.get_mut(*seg)?,
            Value::Array(items) => items.get_mut(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    match node {
        Value::Object(map) => map.remove(*leaf),
        Value::Array(items) => {
            let i = leaf.parse::<usize>().ok().filter(|i| *i < items.len())?;
            Some(items.remove(i))
        }
        _ => None,
    }
}

/// Shallow merge: keys of `incoming` overwrite keys of `current` when both
/// are objects. Otherwise `incoming` wins outright.
pub fn shallow_merge(current: Option<&Value>, incoming: Value) -> Value {
    match (current, incoming) {
        (Some(Value::Object(base)), Value::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                let _ = merged.insert(k, v);
            }
            Value::Object(merged)
        }
        (_, incoming) => incoming,
    }
}

fn child_mut<'a>(node: &'a mut Value, seg: &str) -> &'a mut Value {
    match (array_index(node, seg), node) {
        (Some(i), Value::Array(items)) => &mut items[i],
        (_, node) => {
            let slot = as_object(node)
                .entry(seg.to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() && !slot.is_array() {
                *slot = Value::Object(Map::new());
            }
            slot
        }
    }
}

/// In-bounds index when `node` is an array and `seg` is numeric.
fn array_index(node: &Value, seg: &str) -> Option<usize> {
    match node {
        Value::Array(items) => seg.parse::<usize>().ok().filter(|i| *i < items.len()),
        _ => None,
    }
}

fn as_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just made an object"),
    }
}
