//! Structured walk over JSON log payloads.
//!
//! Paths are built from object keys joined with a NUL byte; array elements
//! collapse to a literal `[*]` segment so `items[0].name` and
//! `items[9].name` address the same posting list. Keys are folded to lower
//! case, leaf values are reported verbatim.

use serde_json::Value;

/// Separator between path segments.
pub const PATH_SEPARATOR: u8 = 0;

/// Path segment standing in for any array index.
pub const ARRAY_SEGMENT: &[u8] = b"[*]";

/// Walks `raw` as JSON, reporting every path through `on_path` and every
/// `(path, value)` leaf through `on_pv`.
///
/// Returns `false` without invoking any callback when `raw` is not a JSON
/// object or array; plain scalars and unparsable payloads carry no paths.
pub fn walk_json(
    raw: &[u8],
    on_path: &mut dyn FnMut(&[u8]),
    on_pv: &mut dyn FnMut(&[u8], &[u8]),
) -> bool {
    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(_) => return false,
    };

    if !value.is_object() && !value.is_array() {
        return false;
    }

    let mut path = Vec::with_capacity(64);
    walk_value(&value, &mut path, on_path, on_pv);
    true
}

fn push_segment(path: &mut Vec<u8>, segment: &[u8], lowercase: bool) -> usize {
    let parent_len = path.len();
    if !path.is_empty() {
        path.push(PATH_SEPARATOR);
    }
    if lowercase {
        path.extend(segment.iter().map(|b| b.to_ascii_lowercase()));
    } else {
        path.extend_from_slice(segment);
    }
    parent_len
}

fn walk_value(
    value: &Value,
    path: &mut Vec<u8>,
    on_path: &mut dyn FnMut(&[u8]),
    on_pv: &mut dyn FnMut(&[u8], &[u8]),
) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let parent_len = push_segment(path, key.as_bytes(), true);
                on_path(path);
                walk_value(child, path, on_path, on_pv);
                path.truncate(parent_len);
            }
        }
        Value::Array(items) => {
            let parent_len = push_segment(path, ARRAY_SEGMENT, false);
            on_path(path);
            for child in items {
                walk_value(child, path, on_path, on_pv);
            }
            path.truncate(parent_len);
        }
        Value::String(s) => {
            if !path.is_empty() {
                on_pv(path, s.as_bytes());
            }
        }
        Value::Number(n) => {
            if !path.is_empty() {
                on_pv(path, n.to_string().as_bytes());
            }
        }
        Value::Bool(b) => {
            if !path.is_empty() {
                on_pv(path, if *b { b"true" } else { b"false" });
            }
        }
        Value::Null => {
            if !path.is_empty() {
                on_pv(path, b"null");
            }
        }
    }
}
