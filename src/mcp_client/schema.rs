//! Input-schema validation for tool arguments.
//!
//! Covers the JSON Schema subset MCP servers actually publish: `type`,
//! `required`, `properties`, `additionalProperties: false`, `enum`, `items`,
//! numeric bounds and string/array length bounds. Unknown keywords are
//! ignored and left to the server.

use serde_json::{Map, Value};
use thiserror::Error;

/// First violation found, with a JSON-pointer-ish path.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{path}: {reason}")]
pub struct SchemaViolation {
    pub path: String,
    pub reason: String,
}

impl SchemaViolation {
    fn new(path: &str, reason: impl Into<String>) -> Self {
        Self {
            path: if path.is_empty() { "$".into() } else { path.into() },
            reason: reason.into(),
        }
    }
}

/// Validate `value` against `schema`. A null or non-object schema accepts
/// everything.
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaViolation> {
    check(schema, value, "")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        check_type(expected, value, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(SchemaViolation::new(
                path,
                format!("{value} is not one of {}", Value::Array(allowed.clone())),
            ));
        }
    }

    match value {
        Value::Object(obj) => check_object(schema, obj, path),
        Value::Array(items) => check_array(schema, items, path),
        Value::String(s) => check_string(schema, s, path),
        Value::Number(_) => check_number(schema, value, path),
        _ => Ok(()),
    }
}

fn check_type(expected: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let matches = match expected {
        Value::String(t) => type_matches(t, value),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .any(|t| type_matches(t, value)),
        _ => true,
    };
    if matches {
        Ok(())
    } else {
        Err(SchemaViolation::new(
            path,
            format!("expected {expected}, got {}", type_name(value)),
        ))
    }
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn check_object(
    schema: &Map<String, Value>,
    obj: &Map<String, Value>,
    path: &str,
) -> Result<(), SchemaViolation> {
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(field) {
                return Err(SchemaViolation::new(
                    path,
                    format!("missing required field '{field}'"),
                ));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    let closed = schema.get("additionalProperties") == Some(&Value::Bool(false));

    for (key, field_value) in obj {
        let field_path = format!("{path}/{key}");
        match properties.and_then(|p| p.get(key)) {
            Some(field_schema) => check(field_schema, field_value, &field_path)?,
            None if closed => {
                return Err(SchemaViolation::new(
                    path,
                    format!("unexpected field '{key}'"),
                ))
            }
            None => {}
        }
    }
    Ok(())
}

fn check_array(
    schema: &Map<String, Value>,
    items: &[Value],
    path: &str,
) -> Result<(), SchemaViolation> {
    if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
        if (items.len() as u64) < min {
            return Err(SchemaViolation::new(path, format!("fewer than {min} items")));
        }
    }
    if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
        if (items.len() as u64) > max {
            return Err(SchemaViolation::new(path, format!("more than {max} items")));
        }
    }
    if let Some(item_schema) = schema.get("items") {
        for (i, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{path}/{i}"))?;
        }
    }
    Ok(())
}

fn check_string(
    schema: &Map<String, Value>,
    s: &str,
    path: &str,
) -> Result<(), SchemaViolation> {
    let len = s.chars().count() as u64;
    if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
        if len < min {
            return Err(SchemaViolation::new(
                path,
                format!("shorter than {min} characters"),
            ));
        }
    }
    if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
        if len > max {
            return Err(SchemaViolation::new(
                path,
                format!("longer than {max} characters"),
            ));
        }
    }
    Ok(())
}

fn check_number(
    schema: &Map<String, Value>,
    value: &Value,
    path: &str,
) -> Result<(), SchemaViolation> {
    let Some(n) = value.as_f64() else {
        return Ok(());
    };
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            return Err(SchemaViolation::new(path, format!("{n} is below minimum {min}")));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            return Err(SchemaViolation::new(path, format!("{n} is above maximum {max}")));
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
