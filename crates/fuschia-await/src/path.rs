use serde_json::Value;

/// Follow a dot-separated path through nested objects and return the leaf as
/// an id. String and number leaves are accepted; empty strings are not.
pub fn lookup_path(value: &Value, path: &str) -> Option<String> {
  let mut current = value;
  for segment in path.split('.') {
    current = current.as_object()?.get(segment)?;
  }
  match current {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// The first path in `paths` that resolves.
pub fn first_match(value: &Value, paths: &[String]) -> Option<String> {
  paths.iter().find_map(|p| lookup_path(value, p))
}
