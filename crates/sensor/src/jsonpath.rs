//! Dotted paths into JSON documents: `body.items.0.name`, with `\.` for a literal dot.

use serde_json::{Map, Value};

use crate::{Error, Result};

/// Split a dotted path into its segments.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'.') => {
                current.push('.');
                chars.next();
            }
            '.' => segments.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    segments.push(current);
    segments
}

/// Look up the value at `path`. Numeric segments index into arrays.
pub fn get<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    split_path(path)
        .iter()
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Render a JSON value the way it is substituted into a resource: strings verbatim,
/// everything else as compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Set `new` at `path`, creating intermediate objects as needed.
pub fn set(value: &mut Value, path: &str, new: Value) -> Result<()> {
    let segments = split_path(path);
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::Parameter(format!("invalid destination path '{}'", path)));
    }

    let mut current = value;
    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;

        if current.is_null() {
            *current = Value::Object(Map::new());
        }

        current = match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.clone(), new);
                    return Ok(());
                }
                map.entry(segment.clone()).or_insert(Value::Null)
            }
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| {
                    Error::Parameter(format!(
                        "path '{}': segment '{}' does not index an array",
                        path, segment
                    ))
                })?;
                if index > items.len() {
                    return Err(Error::Parameter(format!(
                        "path '{}': index {} out of bounds",
                        path, index
                    )));
                }
                if index == items.len() {
                    items.push(Value::Null);
                }
                if last {
                    items[index] = new;
                    return Ok(());
                }
                &mut items[index]
            }
            _ => {
                return Err(Error::Parameter(format!(
                    "path '{}': cannot descend into scalar at '{}'",
                    path, segment
                )))
            }
        };
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_path_with_escaped_dot() {
        assert_eq!(
            split_path(r"metadata.labels.app\.kubernetes\.io/name"),
            vec!["metadata", "labels", "app.kubernetes.io/name"]
        );
    }

    #[test]
    fn test_get() {
        let doc = json!({"body": {"items": [{"name": "a"}, {"name": "b"}]}});
        assert_eq!(get(&doc, "body.items.1.name"), Some(&json!("b")));
        assert_eq!(get(&doc, "body.items.2.name"), None);
        assert_eq!(get(&doc, "body.missing"), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = json!({"spec": {}});
        set(&mut doc, "spec.template.metadata.name", json!("x")).unwrap();
        assert_eq!(doc["spec"]["template"]["metadata"]["name"], "x");

        set(&mut doc, "spec.args.0", json!("first")).unwrap();
        // "args" was created as an object, so "0" is a key
        assert_eq!(doc["spec"]["args"]["0"], "first");
    }

    #[test]
    fn test_set_into_array() {
        let mut doc = json!({"args": ["a"]});
        set(&mut doc, "args.0", json!("b")).unwrap();
        set(&mut doc, "args.1", json!("c")).unwrap();
        assert_eq!(doc["args"], json!(["b", "c"]));
        assert!(set(&mut doc, "args.5", json!("z")).is_err());
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut doc = json!({"name": "x"});
        assert!(set(&mut doc, "name.first", json!("y")).is_err());
    }
}
