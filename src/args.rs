//! AWS query-string argument reconstruction.
//!
//! The EC2 "query" wire dialect flattens nested structures into dotted,
//! 1-based-indexed keys (`Filter.1.Name=tag:Name`). `decode_query_form`
//! rebuilds those into a tree represented as `serde_json::Value`, so that
//! EC2-query-decoded and JSON-protocol-decoded argument trees share one
//! representation and one set of handler-side accessors (see [`Args`]).
//!
//! A sparse list (an index assigned ahead of its predecessors) is
//! represented as a JSON array padded with `Value::Null`.

use serde_json::{Map, Value};

use crate::error::ApiError;

/// Decode a flat list of `(key, value)` pairs from a form-urlencoded body
/// or query string into a nested argument tree.
pub fn decode_query_form(pairs: &[(String, String)]) -> Result<Value, ApiError> {
    let mut root = Value::Object(Map::new());

    for (key, value) in pairs {
        let path: Vec<&str> = key.split('.').collect();
        set_path(&mut root, &path, Value::String(value.clone()))?;
    }

    Ok(root)
}

fn set_path(root: &mut Value, path: &[&str], leaf: Value) -> Result<(), ApiError> {
    let mut cursor = root;

    for (i, segment) in path.iter().enumerate() {
        let is_last = i == path.len() - 1;
        let index: Option<usize> = segment.parse::<usize>().ok().and_then(|n| n.checked_sub(1));

        if is_last {
            match index {
                Some(idx) => {
                    let list = ensure_array(cursor)?;
                    set_sparse(list, idx, leaf);
                }
                None => {
                    let map = ensure_object(cursor)?;
                    map.insert((*segment).to_string(), leaf);
                }
            }
            return Ok(());
        }

        // Decide the shape of the *next* hop by looking one segment ahead:
        // a numeric next segment means this hop is a list, not a map.
        let next_is_index = path[i + 1].parse::<usize>().is_ok();

        cursor = match index {
            Some(idx) => {
                let list = ensure_array(cursor)?;
                ensure_slot(list, idx, next_is_index)
            }
            None => {
                let map = ensure_object(cursor)?;
                let entry = map
                    .entry((*segment).to_string())
                    .or_insert_with(|| placeholder(next_is_index));
                entry
            }
        };
    }

    Ok(())
}

fn placeholder(is_list: bool) -> Value {
    if is_list {
        Value::Array(Vec::new())
    } else {
        Value::Object(Map::new())
    }
}

fn ensure_array(v: &mut Value) -> Result<&mut Vec<Value>, ApiError> {
    if v.is_null() {
        *v = Value::Array(Vec::new());
    }
    v.as_array_mut()
        .ok_or_else(|| ApiError::InvalidParameter("conflicting array/map argument shape".into()))
}

fn ensure_object(v: &mut Value) -> Result<&mut Map<String, Value>, ApiError> {
    if v.is_null() {
        *v = Value::Object(Map::new());
    }
    v.as_object_mut()
        .ok_or_else(|| ApiError::InvalidParameter("conflicting array/map argument shape".into()))
}

/// Assign `list[index] = value`, padding any gap with `Value::Null`
/// (the "sparse list" semantics from the spec).
fn set_sparse(list: &mut Vec<Value>, index: usize, value: Value) {
    if index >= list.len() {
        list.resize(index + 1, Value::Null);
    }
    list[index] = value;
}

/// Like `set_sparse` but returns a mutable reference to the slot so the
/// caller can keep walking into it, creating the slot as the expected
/// shape (list or map) if it is currently `Null`.
fn ensure_slot(list: &mut Vec<Value>, index: usize, next_is_index: bool) -> &mut Value {
    if index >= list.len() {
        list.resize(index + 1, Value::Null);
    }
    if list[index].is_null() {
        list[index] = placeholder(next_is_index);
    }
    &mut list[index]
}

/// Flatten a decoded tree back into dotted/indexed key-value pairs. Used
/// only to verify the round-trip law in tests; never on a live request
/// path.
pub fn encode_query_form(value: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    encode_into(value, &mut String::new(), &mut out);
    out
}

fn encode_into(value: &Value, prefix: &mut String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push((prefix.clone(), s.clone())),
        Value::Object(map) => {
            for (k, v) in map {
                let base_len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(k);
                encode_into(v, prefix, out);
                prefix.truncate(base_len);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                let base_len = prefix.len();
                if !prefix.is_empty() {
                    prefix.push('.');
                }
                prefix.push_str(&(i + 1).to_string());
                encode_into(v, prefix, out);
                prefix.truncate(base_len);
            }
        }
        other => out.push((prefix.clone(), other.to_string())),
    }
}

/// Convenience accessors handlers use against the decoded tree. The same
/// helpers work whether `value` came from query-form decoding or direct
/// JSON-1.1 body parsing.
pub trait ArgsExt {
    fn str_at(&self, key: &str) -> Option<&str>;
    fn require_str(&self, key: &str) -> Result<&str, ApiError>;
    fn list_at(&self, key: &str) -> Vec<&Value>;
    fn non_null_strings(&self, key: &str) -> Vec<String>;
}

impl ArgsExt for Value {
    fn str_at(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn require_str(&self, key: &str) -> Result<&str, ApiError> {
        self.str_at(key)
            .ok_or_else(|| ApiError::InvalidParameter(format!("missing required {key}")))
    }

    fn list_at(&self, key: &str) -> Vec<&Value> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
            Some(other) if !other.is_null() => vec![other],
            _ => Vec::new(),
        }
    }

    fn non_null_strings(&self, key: &str) -> Vec<String> {
        self.list_at(key)
            .into_iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }
}
