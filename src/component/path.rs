//! Dotted-path resolution over the component tree.
//!
//! Paths look like `light.bulbs[2].sensor`: dot-separated component
//! names, each optionally indexed into an array child.

use serde_json::{Map, Value};

use crate::component::DomainError;

type JsonObject = Map<String, Value>;

fn parse_path_element(part: &str) -> Result<(&str, Option<usize>), DomainError> {
    match part.split_once('[') {
        None => Ok((part, None)),
        Some((name, rest)) => {
            let index_str = rest.strip_suffix(']').ok_or_else(|| {
                DomainError::property_missing(format!("invalid array element syntax '{part}'"))
            })?;
            let index = index_str.trim().parse::<usize>().map_err(|_| {
                DomainError::invalid_prop_value(format!("invalid array index '{index_str}'"))
            })?;
            Ok((name, Some(index)))
        }
    }
}

fn missing(name: &str, at: &str) -> DomainError {
    DomainError::property_missing(format!("component '{name}' does not exist at '{at}'"))
}

/// Resolve `path` against the root dictionary of top-level components.
/// Errors distinguish empty path elements, missing components, and
/// array/object mismatches.
pub fn find_component_at<'a>(
    root: &'a JsonObject,
    path: &str,
) -> Result<&'a JsonObject, DomainError> {
    let mut node = root;
    let mut walked = String::new();
    for part in path.split('.') {
        let (name, index) = parse_path_element(part)?;
        if name.is_empty() {
            return Err(DomainError::property_missing(format!(
                "empty path element at '{walked}'"
            )));
        }
        if !walked.is_empty() {
            // `node` is a component; descend into its children first.
            node = match node.get("components").and_then(Value::as_object) {
                Some(children) => children,
                None => return Err(missing(name, &walked)),
            };
        }
        let value = node.get(name).ok_or_else(|| missing(name, &walked))?;
        node = match (value, index) {
            (Value::Object(component), None) => component,
            (Value::Object(_), Some(_)) => {
                return Err(DomainError::type_mismatch(format!(
                    "element '{walked}.{name}' is not an array"
                )))
            }
            (Value::Array(_), None) => {
                return Err(DomainError::type_mismatch(format!(
                    "element '{walked}.{name}' is an array"
                )))
            }
            (Value::Array(items), Some(index)) => {
                match items.get(index).and_then(Value::as_object) {
                    Some(component) => component,
                    None => {
                        return Err(DomainError::property_missing(format!(
                            "element '{walked}.{name}' does not contain item #{index}"
                        )))
                    }
                }
            }
            _ => return Err(missing(name, &walked)),
        };
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(part);
    }
    Ok(node)
}

/// Mutable variant of [`find_component_at`].
pub fn find_component_at_mut<'a>(
    root: &'a mut JsonObject,
    path: &str,
) -> Result<&'a mut JsonObject, DomainError> {
    let mut node = root;
    let mut walked = String::new();
    for part in path.split('.') {
        let (name, index) = parse_path_element(part)?;
        if name.is_empty() {
            return Err(DomainError::property_missing(format!(
                "empty path element at '{walked}'"
            )));
        }
        if !walked.is_empty() {
            node = match node.get_mut("components").and_then(Value::as_object_mut) {
                Some(children) => children,
                None => return Err(missing(name, &walked)),
            };
        }
        // Inspect the shape before the mutable descent so error paths do
        // not fight the borrow checker.
        let shape = node.get(name).map(|value| {
            (
                value.is_object(),
                value.as_array().map(Vec::len).unwrap_or(0),
            )
        });
        let (is_object, array_len) = shape.ok_or_else(|| missing(name, &walked))?;
        match (is_object, index) {
            (true, Some(_)) => {
                return Err(DomainError::type_mismatch(format!(
                    "element '{walked}.{name}' is not an array"
                )))
            }
            (false, None) => {
                return Err(DomainError::type_mismatch(format!(
                    "element '{walked}.{name}' is an array"
                )))
            }
            (false, Some(i)) if i >= array_len => {
                return Err(DomainError::property_missing(format!(
                    "element '{walked}.{name}' does not contain item #{i}"
                )))
            }
            _ => {}
        }
        let value = node.get_mut(name).expect("shape checked above");
        node = match (value, index) {
            (Value::Object(component), None) => component,
            (Value::Array(items), Some(i)) => items
                .get_mut(i)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    DomainError::property_missing(format!(
                        "element '{walked}.{name}' does not contain item #{i}"
                    ))
                })?,
            _ => unreachable!("shape checked above"),
        };
        if !walked.is_empty() {
            walked.push('.');
        }
        walked.push_str(part);
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> JsonObject {
        serde_json::from_str::<Value>(
            r#"{
              "light": {
                "traits": ["onOff"],
                "components": {
                  "bulbs": [
                    {"traits": ["brightness"]},
                    {"traits": ["brightness"], "components": {"sensor": {"traits": ["color"]}}}
                  ],
                  "driver": {"traits": ["power"]}
                }
              }
            }"#,
        )
        .unwrap()
        .as_object()
        .unwrap()
        .clone()
    }

    #[test]
    fn resolves_nested_and_indexed_paths() {
        let root = tree();
        assert!(find_component_at(&root, "light").is_ok());
        assert!(find_component_at(&root, "light.driver").is_ok());
        let sensor = find_component_at(&root, "light.bulbs[1].sensor").unwrap();
        assert_eq!(sensor["traits"][0], "color");
    }

    #[test]
    fn distinguishes_error_kinds() {
        let root = tree();
        assert_eq!(
            find_component_at(&root, "nope").unwrap_err().code(),
            "property_missing"
        );
        assert_eq!(
            find_component_at(&root, "light.bulbs").unwrap_err().code(),
            "type_mismatch"
        );
        assert_eq!(
            find_component_at(&root, "light.driver[0]")
                .unwrap_err()
                .code(),
            "type_mismatch"
        );
        assert_eq!(
            find_component_at(&root, "light.bulbs[7]")
                .unwrap_err()
                .code(),
            "property_missing"
        );
        assert_eq!(
            find_component_at(&root, "light..driver")
                .unwrap_err()
                .code(),
            "property_missing"
        );
        assert_eq!(
            find_component_at(&root, "light.bulbs[x]")
                .unwrap_err()
                .code(),
            "invalid_prop_value"
        );
        assert_eq!(
            find_component_at(&root, "light.bulbs[0")
                .unwrap_err()
                .code(),
            "property_missing"
        );
    }

    #[test]
    fn mutable_lookup_matches_shared_lookup() {
        let mut root = tree();
        let component = find_component_at_mut(&mut root, "light.bulbs[0]").unwrap();
        component.insert("state".to_string(), serde_json::json!({}));
        assert!(find_component_at(&root, "light.bulbs[0]")
            .unwrap()
            .contains_key("state"));
        assert!(find_component_at_mut(&mut root, "light.bulbs[9]").is_err());
    }
}
