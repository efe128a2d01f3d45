//! Minimal draft-07 subset validator for skill input schemas. Supports
//! `type`, `properties`, `required`, `enum`, `items`, `minimum`, `maximum`
//! and `default` injection. Anything else is ignored rather than rejected.

use serde_json::{Map, Value};

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        other => type_name(value) == other,
    }
}

fn check_value(path: &str, value: &Value, schema: &Value) -> Result<(), String> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(format!(
                "{path}: expected {expected}, got {}",
                type_name(value)
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(format!("{path}: value is not one of the allowed options"));
        }
    }

    if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
        if let Some(actual) = value.as_f64() {
            if actual < minimum {
                return Err(format!("{path}: {actual} is below minimum {minimum}"));
            }
        }
    }
    if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
        if let Some(actual) = value.as_f64() {
            if actual > maximum {
                return Err(format!("{path}: {actual} is above maximum {maximum}"));
            }
        }
    }

    if let (Some(items), Some(elements)) = (schema.get("items"), value.as_array()) {
        for (idx, element) in elements.iter().enumerate() {
            check_value(&format!("{path}[{idx}]"), element, items)?;
        }
    }

    if let (Some(properties), Some(object)) = (
        schema.get("properties").and_then(Value::as_object),
        value.as_object(),
    ) {
        for (key, sub_schema) in properties {
            if let Some(sub_value) = object.get(key) {
                check_value(&format!("{path}.{key}"), sub_value, sub_schema)?;
            }
        }
    }

    Ok(())
}

/// Validate `args` against a schema, returning a copy with defaults filled
/// in for absent top-level properties.
pub fn validate_args(args: &Map<String, Value>, schema: &Value) -> Result<Map<String, Value>, String> {
    let mut merged = args.clone();

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, sub_schema) in properties {
            if !merged.contains_key(key) {
                if let Some(default) = sub_schema.get("default") {
                    merged.insert(key.clone(), default.clone());
                }
            }
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !merged.contains_key(key) {
                return Err(format!("missing required argument `{key}`"));
            }
        }
    }

    check_value("args", &Value::Object(merged.clone()), schema)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn missing_required_argument_fails() {
        let schema = json!({
            "type": "object",
            "properties": {"url": {"type": "string"}},
            "required": ["url"]
        });
        let err = validate_args(&args(json!({})), &schema).unwrap_err();
        assert!(err.contains("url"));
    }

    #[test]
    fn wrong_type_fails_with_path() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}}
        });
        let err = validate_args(&args(json!({"count": "three"})), &schema).unwrap_err();
        assert!(err.contains("args.count"));
    }

    #[test]
    fn defaults_are_injected() {
        let schema = json!({
            "type": "object",
            "properties": {
                "quality": {"type": "string", "default": "best"},
                "url": {"type": "string"}
            },
            "required": ["url"]
        });
        let merged =
            validate_args(&args(json!({"url": "https://example.com/v.mp4"})), &schema).unwrap();
        assert_eq!(merged["quality"], "best");
    }

    #[test]
    fn enum_and_bounds_are_enforced() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mode": {"type": "string", "enum": ["fast", "slow"]},
                "retries": {"type": "integer", "minimum": 0, "maximum": 5}
            }
        });
        assert!(validate_args(&args(json!({"mode": "fast", "retries": 3})), &schema).is_ok());
        assert!(validate_args(&args(json!({"mode": "warp"})), &schema).is_err());
        assert!(validate_args(&args(json!({"retries": 9})), &schema).is_err());
        assert!(validate_args(&args(json!({"retries": -1})), &schema).is_err());
    }

    #[test]
    fn array_items_are_checked() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        assert!(validate_args(&args(json!({"tags": ["a", "b"]})), &schema).is_ok());
        let err = validate_args(&args(json!({"tags": ["a", 1]})), &schema).unwrap_err();
        assert!(err.contains("tags[1]"));
    }

    #[test]
    fn integer_accepts_integral_numbers_only() {
        let schema = json!({
            "type": "object",
            "properties": {"n": {"type": "integer"}}
        });
        assert!(validate_args(&args(json!({"n": 2})), &schema).is_ok());
        assert!(validate_args(&args(json!({"n": 2.5})), &schema).is_err());
    }
}
