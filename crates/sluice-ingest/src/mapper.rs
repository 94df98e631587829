//! Property mapping: reshape a raw source object into the canonical form its
//! schema expects.
//!
//! Paths use dot notation (`metadata.sku`). Reading descends through nested
//! objects; any non-object along the way counts as missing.

use serde_json::Value;
use sluice_core::{Object, ReceiveRoute};

/// Look up a dotted path.
pub fn get_path<'a>(object: &'a Object, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = object.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Remove and return the value at a dotted path.
pub fn take_path(object: &mut Object, path: &str) -> Option<Value> {
    match path.split_once('.') {
        None => object.remove(path),
        Some((head, rest)) => take_path(object.get_mut(head)?.as_object_mut()?, rest),
    }
}

/// Set a dotted path, creating intermediate objects. Existing values along
/// the way that are not objects are replaced.
pub fn set_path(object: &mut Object, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            object.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let child = object
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Object::new()));
            if !child.is_object() {
                *child = Value::Object(Object::new());
            }
            if let Value::Object(child) = child {
                set_path(child, rest, value);
            }
        }
    }
}

/// Apply a receive route's renames and constants.
///
/// Every input path is taken out before any output is written, so renames
/// do not feed each other. Missing inputs produce nothing; existing outputs
/// are overwritten. Constants are set after renaming, then top-level nulls
/// are dropped.
pub fn map_properties(mut raw: Object, route: &ReceiveRoute) -> Object {
    let moved: Vec<(&str, Value)> = route
        .properties
        .iter()
        .filter_map(|(input, output)| take_path(&mut raw, input).map(|v| (output.as_str(), v)))
        .collect();

    for (output, value) in moved {
        set_path(&mut raw, output, value);
    }

    for (path, value) in &route.hardcode {
        set_path(&mut raw, path, value.clone());
    }

    raw.retain(|_, v| !v.is_null());
    raw
}
