use std::path::Path;

use serde_json::Value;

/// Derive a job name from a job file path.
///
/// Extracts the file stem (name without extension).
/// Example: `"jobs/support_tickets.json"` → `"support_tickets"`
pub fn derive_job_name(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}

/// Split a dotted document path (`"customer.address.city"`, `"choices.0.text"`).
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|s| !s.is_empty()).collect()
}

/// Look up a dotted path inside a JSON value. Numeric segments index arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    split_path(path)
        .into_iter()
        .try_fold(value, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

/// Overwrite the value at a dotted path, creating missing object keys on the way.
///
/// Fails when an intermediate segment exists but is not an object (or an
/// array indexed in range), since the value cannot be placed there.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) -> Result<(), String> {
    let segments = split_path(path);
    let Some((last, parents)) = segments.split_last() else {
        return Err("empty path".to_string());
    };

    let mut current = value;
    for segment in parents {
        current = match current {
            Value::Object(map) => map
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(serde_json::Map::new())),
            Value::Array(items) => {
                let index: usize = segment
                    .parse()
                    .map_err(|_| format!("segment '{segment}' of '{path}' indexes an array"))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| format!("index {index} of '{path}' is out of bounds"))?
            }
            other => {
                return Err(format!(
                    "segment '{segment}' of '{path}' is a {}, not an object",
                    type_name(other)
                ));
            }
        };
    }

    match current {
        Value::Object(map) => {
            map.insert(last.to_string(), new_value);
            Ok(())
        }
        Value::Array(items) => {
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| format!("'{path}' does not address an array element"))?;
            *slot = new_value;
            Ok(())
        }
        other => Err(format!(
            "parent of '{path}' is a {}, not an object",
            type_name(other)
        )),
    }
}

/// Absent-equivalent values: null, empty string, empty array, empty object.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_derive_job_name() {
        assert_eq!(derive_job_name(Path::new("emails.json")), "emails");
        assert_eq!(
            derive_job_name(Path::new("jobs/support_tickets.json")),
            "support_tickets"
        );
        assert_eq!(derive_job_name(Path::new("chat")), "chat");
    }

    #[test]
    fn test_lookup_nested_and_indexed() {
        let doc = json!({"a": {"b": [{"c": 1}, {"c": 2}]}});
        assert_eq!(lookup(&doc, "a.b.1.c"), Some(&json!(2)));
        assert_eq!(lookup(&doc, "a.b.5.c"), None);
        assert_eq!(lookup(&doc, "a.x"), None);
        assert_eq!(lookup(&doc, "a.b.c"), None);
    }

    #[test]
    fn test_set_path_creates_objects() {
        let mut doc = json!({});
        set_path(&mut doc, "meta.source.id", json!("T-1")).unwrap();
        assert_eq!(doc, json!({"meta": {"source": {"id": "T-1"}}}));
    }

    #[test]
    fn test_set_path_rejects_scalar_parent() {
        let mut doc = json!({"meta": "flat"});
        let err = set_path(&mut doc, "meta.id", json!(1)).unwrap_err();
        assert!(err.contains("string"), "{err}");
    }

    #[test]
    fn test_set_path_into_array_element() {
        let mut doc = json!({"items": [{"id": 1}, {"id": 2}]});
        set_path(&mut doc, "items.1.id", json!(7)).unwrap();
        assert_eq!(doc["items"][1]["id"], json!(7));
        assert!(set_path(&mut doc, "items.9.id", json!(7)).is_err());
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&json!(null)));
        assert!(is_blank(&json!("")));
        assert!(is_blank(&json!([])));
        assert!(is_blank(&json!({})));
        assert!(!is_blank(&json!(0)));
        assert!(!is_blank(&json!(false)));
        assert!(!is_blank(&json!("x")));
    }
}
