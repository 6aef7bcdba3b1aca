//! Dotted/bracket path addressing over plain JSON trees.
//!
//! Paths like `"pets[0].name"` tokenize into `["pets", "0", "name"]` and
//! address a slot inside a `serde_json::Value`. The empty path is the
//! root. Writes go through a structural merge that reports whether the
//! tree actually changed via [`Applied`]; callers treat
//! [`Applied::Unchanged`] as the "nothing happened" signal and skip
//! notifications and network traffic on it.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Cap on the process-wide tokenization cache.
const TOKEN_CACHE_CAPACITY: usize = 1024;

/// Outcome of a write operation.
///
/// `Unchanged` means the merged result is structurally identical to the
/// previous tree, so the caller keeps the old value untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Unchanged,
    Changed(Value),
}

impl Applied {
    /// True when the write left the tree as it was.
    pub fn is_unchanged(&self) -> bool {
        matches!(self, Applied::Unchanged)
    }

    /// The resulting tree, falling back to a clone of `old` when unchanged.
    pub fn into_value(self, old: &Value) -> Value {
        match self {
            Applied::Unchanged => old.clone(),
            Applied::Changed(value) => value,
        }
    }
}

fn token_cache() -> &'static Mutex<LruCache<String, Arc<[String]>>> {
    static CACHE: OnceLock<Mutex<LruCache<String, Arc<[String]>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        let capacity = NonZeroUsize::new(TOKEN_CACHE_CAPACITY).expect("nonzero capacity");
        Mutex::new(LruCache::new(capacity))
    })
}

/// Split a path into its tokens: the maximal runs of characters that are
/// not `.`, `[`, `]`, or whitespace. The empty path has no tokens.
///
/// Results are memoized in a bounded process-wide cache, so repeated
/// lookups of hot paths do not re-split.
pub fn tokenize(path: &str) -> Arc<[String]> {
    if path.is_empty() {
        return Arc::from(Vec::new());
    }
    let mut cache = token_cache().lock();
    if let Some(tokens) = cache.get(path) {
        return tokens.clone();
    }
    let tokens: Arc<[String]> = path
        .split(is_separator)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect();
    cache.put(path.to_owned(), tokens.clone());
    tokens
}

fn is_separator(c: char) -> bool {
    c == '.' || c == '[' || c == ']' || c.is_whitespace()
}

/// Read the value a path addresses.
///
/// Returns `Ok(None)` when any step of the walk lands on a missing key,
/// an out-of-range index, or `null`. Fails with [`Error::InvalidPath`]
/// when the walk hits a non-null primitive with tokens still remaining.
/// The root path returns the tree itself.
pub fn get<'a>(data: &'a Value, path: &str) -> Result<Option<&'a Value>> {
    let tokens = tokenize(path);
    let mut cursor = data;
    for token in tokens.iter() {
        cursor = match cursor {
            Value::Object(map) => match map.get(token) {
                Some(value) => value,
                None => return Ok(None),
            },
            Value::Array(items) => match token.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(value) => value,
                None => return Ok(None),
            },
            Value::Null => return Ok(None),
            _ => {
                return Err(Error::InvalidPath {
                    path: path.to_string(),
                    token: token.clone(),
                })
            }
        };
    }
    Ok(Some(cursor))
}

/// Write `value` at `path`, producing a new tree.
///
/// The root path merges `value` over the whole tree. Missing
/// intermediates are created on the way down: an array when the token is
/// a non-negative integer literal, an object otherwise; a primitive in
/// the way is overwritten so the written value is always readable back.
/// Returns [`Applied::Unchanged`] when the merged slot is structurally
/// identical to what was already there.
pub fn set(data: &Value, path: &str, value: Value) -> Applied {
    let tokens = tokenize(path);
    if tokens.is_empty() {
        return patch(data, value);
    }
    set_at(Some(data), &tokens, value)
}

fn set_at(old: Option<&Value>, tokens: &[String], value: Value) -> Applied {
    let Some((token, rest)) = tokens.split_first() else {
        return match old {
            Some(prev) => patch(prev, value),
            None => Applied::Changed(value),
        };
    };

    let index = token.parse::<usize>().ok();

    let existing_child = match old {
        Some(Value::Object(map)) => map.get(token.as_str()),
        Some(Value::Array(items)) => index.and_then(|i| items.get(i)),
        _ => None,
    };

    let child = match set_at(existing_child, rest, value) {
        Applied::Unchanged => return Applied::Unchanged,
        Applied::Changed(child) => child,
    };

    match (old, index) {
        (Some(Value::Object(map)), _) => {
            let mut map = map.clone();
            map.insert(token.clone(), child);
            Applied::Changed(Value::Object(map))
        }
        (Some(Value::Array(items)), Some(i)) => {
            let mut items = items.clone();
            if i < items.len() {
                items[i] = child;
            } else {
                items.resize(i, Value::Null);
                items.push(child);
            }
            Applied::Changed(Value::Array(items))
        }
        // Missing or mismatched intermediate: integer tokens address a
        // fresh array slot, everything else a fresh object key.
        (_, Some(i)) => {
            let mut items = vec![Value::Null; i];
            items.push(child);
            Applied::Changed(Value::Array(items))
        }
        (_, None) => {
            let mut map = Map::new();
            map.insert(token.clone(), child);
            Applied::Changed(Value::Object(map))
        }
    }
}

/// Structurally merge `new` over `old`.
///
/// Arrays merge elementwise and objects keep exactly the incoming key
/// set; scalars and type mismatches take the incoming value. The merge
/// reports [`Applied::Unchanged`] whenever the result would be
/// structurally identical to `old`, which is what makes change detection
/// up the tree cheap.
pub fn patch(old: &Value, new: Value) -> Applied {
    match (old, new) {
        (Value::Null, Value::Null) => Applied::Unchanged,
        (_, Value::Null) => Applied::Changed(Value::Null),
        (Value::Null, new) => Applied::Changed(new),
        (Value::Array(old_items), Value::Array(new_items)) => patch_array(old_items, new_items),
        (Value::Object(old_map), Value::Object(new_map)) => patch_object(old_map, new_map),
        (old, new) => {
            if *old == new {
                Applied::Unchanged
            } else {
                Applied::Changed(new)
            }
        }
    }
}

fn patch_array(old: &[Value], new: Vec<Value>) -> Applied {
    let mut changed = old.len() != new.len();
    let mut merged = Vec::with_capacity(new.len());
    for (i, item) in new.into_iter().enumerate() {
        match old.get(i) {
            Some(prev) => match patch(prev, item) {
                Applied::Unchanged => merged.push(prev.clone()),
                Applied::Changed(value) => {
                    changed = true;
                    merged.push(value);
                }
            },
            None => merged.push(item),
        }
    }
    if changed {
        Applied::Changed(Value::Array(merged))
    } else {
        Applied::Unchanged
    }
}

fn patch_object(old: &Map<String, Value>, new: Map<String, Value>) -> Applied {
    let mut changed = old.len() != new.len();
    let mut merged = Map::new();
    for (key, item) in new {
        match old.get(&key) {
            Some(prev) => match patch(prev, item) {
                Applied::Unchanged => {
                    merged.insert(key, prev.clone());
                }
                Applied::Changed(value) => {
                    changed = true;
                    merged.insert(key, value);
                }
            },
            None => {
                changed = true;
                merged.insert(key, item);
            }
        }
    }
    if changed {
        Applied::Changed(Value::Object(merged))
    } else {
        Applied::Unchanged
    }
}
