//! Type normalization of model properties and connector settings
//!
//! Values come from the UI layer as loosely typed JSON (a temperature typed
//! into a text box arrives as `"0.7"`). Before a call they are coerced to the
//! type the connector declares in its schema.

use sdk::{PropertyType, SchemaField};
use serde_json::{Map, Number, Value};
use tracing::warn;

/// Coerce one value to `kind`
///
/// Returns `None` when the value cannot be represented (including `null`).
pub fn normalize_value(kind: PropertyType, value: &Value) -> Option<Value> {
    match (kind, value) {
        (_, Value::Null) => None,

        (PropertyType::Number, Value::Number(_)) => Some(value.clone()),
        (PropertyType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        (PropertyType::Number, Value::Bool(b)) => Some(Value::from(if *b { 1 } else { 0 })),
        (PropertyType::Number, _) => None,

        (PropertyType::Boolean, Value::Bool(_)) => Some(value.clone()),
        (PropertyType::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(Value::Bool(true)),
            "false" | "0" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        (PropertyType::Boolean, Value::Number(n)) => n.as_f64().map(|f| Value::Bool(f != 0.0)),
        (PropertyType::Boolean, _) => None,

        (PropertyType::Array, Value::Array(_)) => Some(value.clone()),
        (PropertyType::Array, Value::String(s)) => Some(parse_array(s)),
        (PropertyType::Array, other) => Some(Value::Array(vec![other.clone()])),

        (PropertyType::String, Value::String(_)) => Some(value.clone()),
        (PropertyType::String, Value::Number(n)) => Some(Value::String(n.to_string())),
        (PropertyType::String, Value::Bool(b)) => Some(Value::String(b.to_string())),
        (PropertyType::String, other) => Some(Value::String(other.to_string())),
    }
}

/// A JSON-encoded array, else a comma separated list
fn parse_array(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            return Value::Array(items);
        }
    }

    Value::Array(
        trimmed
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| Value::String(s.to_string()))
            .collect(),
    )
}

/// Normalize a property or settings map against a schema
///
/// Keys not in the schema pass through unchanged. Schema fields missing from
/// `values` take their declared default. Values that cannot be coerced are
/// dropped with a warning.
pub fn normalize_map(values: &Map<String, Value>, schema: &[SchemaField]) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in values {
        match schema.iter().find(|f| &f.name == key) {
            Some(field) => match normalize_value(field.kind, value) {
                Some(normalized) => {
                    out.insert(key.clone(), normalized);
                }
                None => warn!(
                    "Dropping '{}': {} is not a valid {}",
                    key,
                    value,
                    field.kind.as_str()
                ),
            },
            None => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    for field in schema {
        if out.contains_key(&field.name) || values.contains_key(&field.name) {
            continue;
        }
        if let Some(default) = field.default.as_ref().and_then(|d| normalize_value(field.kind, d)) {
            out.insert(field.name.clone(), default);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(name: &str, kind: PropertyType, default: Option<Value>) -> SchemaField {
        SchemaField {
            name: name.to_string(),
            label: None,
            kind,
            default,
        }
    }

    #[test]
    fn test_number_from_string() {
        assert_eq!(
            normalize_value(PropertyType::Number, &json!(" 0.5 ")),
            Some(json!(0.5))
        );
        assert_eq!(normalize_value(PropertyType::Number, &json!("warm")), None);
    }

    #[test]
    fn test_boolean_spellings() {
        for (raw, expected) in [("true", true), ("YES", true), ("1", true), ("no", false), ("0", false)] {
            assert_eq!(
                normalize_value(PropertyType::Boolean, &json!(raw)),
                Some(json!(expected))
            );
        }
        assert_eq!(normalize_value(PropertyType::Boolean, &json!("maybe")), None);
    }

    #[test]
    fn test_array_forms() {
        assert_eq!(
            normalize_value(PropertyType::Array, &json!("[\"a\", 2]")),
            Some(json!(["a", 2]))
        );
        assert_eq!(
            normalize_value(PropertyType::Array, &json!("stop, end ,")),
            Some(json!(["stop", "end"]))
        );
        assert_eq!(
            normalize_value(PropertyType::Array, &json!(5)),
            Some(json!([5]))
        );
    }

    #[test]
    fn test_string_stringifies_scalars() {
        assert_eq!(normalize_value(PropertyType::String, &json!(42)), Some(json!("42")));
        assert_eq!(normalize_value(PropertyType::String, &json!(false)), Some(json!("false")));
        assert_eq!(normalize_value(PropertyType::String, &Value::Null), None);
    }

    #[test]
    fn test_normalize_map() {
        let schema = vec![
            field("temperature", PropertyType::Number, Some(json!(1.0))),
            field("stream", PropertyType::Boolean, Some(json!("no"))),
            field("max_tokens", PropertyType::Number, None),
        ];
        let mut values = Map::new();
        values.insert("temperature".into(), json!("0.2"));
        values.insert("max_tokens".into(), json!("lots"));
        values.insert("extra".into(), json!({"kept": true}));

        let out = normalize_map(&values, &schema);
        assert_eq!(out["temperature"], json!(0.2));
        assert_eq!(out["stream"], json!(false));
        assert_eq!(out["extra"], json!({"kept": true}));
        // Invalid value is dropped and does not fall back to a default
        assert!(!out.contains_key("max_tokens"));
    }
}
