//! Inbound decoding into the canonical payload.
//!
//! HTTP callers are decoded through the route's field mapping: path
//! parameters, query parameters and top-level body keys are read, checked
//! against their declared kind and stored under the canonical key. Native
//! RPC callers already send canonical payloads; those are checked against
//! the same mapping by canonical key. Keys the route does not declare are
//! dropped, and identity-sourced fields are never taken from the caller.

use crate::domain::error::ValidationError;
use crate::domain::routes::{FieldKind, FieldSource, FieldSpec, RouteSpec};
use crate::domain::value::Value;
use std::collections::HashMap;

/// Raw pieces of an HTTP request, before mapping.
#[derive(Debug)]
pub struct HttpInput<'a> {
    pub path: &'a HashMap<String, String>,
    pub query: &'a HashMap<String, String>,
    /// Body already checked to be empty or a JSON object
    pub body: &'a [u8],
}

/// Decode an HTTP request for `route` into the canonical payload.
pub fn decode_http(route: &RouteSpec, input: &HttpInput<'_>) -> Result<Value, ValidationError> {
    let body = parse_body(input.body)?;
    let mut payload = Value::map();

    for field in route.fields {
        let raw = match field.source {
            FieldSource::Path(name) => input.path.get(name).map(|s| Raw::Text(s.as_str())),
            FieldSource::Query(name) => input.query.get(name).map(|s| Raw::Text(s.as_str())),
            FieldSource::Body(name) => body.get(name).map(Raw::Json),
            FieldSource::Identity => continue,
        };

        match raw {
            Some(raw) => {
                let value = coerce(field, raw)?;
                payload.insert(field.target, value);
            }
            None if field.required => {
                return Err(ValidationError::new(field.external_name(), "is required"));
            }
            None => {}
        }
    }

    Ok(payload)
}

/// Check a canonical payload from a native RPC caller.
pub fn validate_canonical(route: &RouteSpec, payload: Value) -> Result<Value, ValidationError> {
    let mut input = match payload {
        Value::Map(map) => map,
        Value::Null => Default::default(),
        other => {
            return Err(ValidationError::new(
                "payload",
                format!("expected an object, got {}", other.kind_name()),
            ))
        }
    };

    let mut payload = Value::map();
    for field in route.fields {
        if field.source == FieldSource::Identity {
            continue;
        }
        match input.remove(field.target) {
            Some(value) if !value.is_null() => {
                check_kind(field, field.target, &value)?;
                payload.insert(field.target, value);
            }
            _ if field.required => {
                return Err(ValidationError::new(field.target, "is required"));
            }
            _ => {}
        }
    }

    Ok(payload)
}

fn parse_body(body: &[u8]) -> Result<Value, ValidationError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::map());
    }
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| ValidationError::body(format!("invalid JSON: {e}")))?;
    if !json.is_object() {
        return Err(ValidationError::body("expected a JSON object"));
    }
    Ok(Value::from(json))
}

enum Raw<'a> {
    /// Path and query parameters arrive as text
    Text(&'a str),
    Json(&'a Value),
}

fn coerce(field: &FieldSpec, raw: Raw<'_>) -> Result<Value, ValidationError> {
    let name = field.external_name();
    let value = match raw {
        Raw::Json(value) => value.clone(),
        Raw::Text(text) => match field.kind {
            FieldKind::Int { .. } => text
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| ValidationError::new(name, "must be an integer"))?,
            FieldKind::Bool => match text {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(ValidationError::new(name, "must be true or false")),
            },
            FieldKind::Str { .. } | FieldKind::Id => Value::Str(text.to_string()),
        },
    };

    if value.is_null() {
        if field.required {
            return Err(ValidationError::new(name, "is required"));
        }
        return Ok(Value::Null);
    }
    check_kind(field, name, &value)?;
    Ok(value)
}

fn check_kind(field: &FieldSpec, name: &str, value: &Value) -> Result<(), ValidationError> {
    match (field.kind, value) {
        (FieldKind::Str { min, max }, Value::Str(s)) => {
            let len = s.chars().count();
            if len < min || len > max {
                return Err(ValidationError::new(
                    name,
                    format!("length must be between {min} and {max}"),
                ));
            }
            Ok(())
        }
        (FieldKind::Id, Value::Str(s)) => {
            if is_valid_id(s) {
                Ok(())
            } else {
                Err(ValidationError::new(name, "is not a valid id"))
            }
        }
        (FieldKind::Int { min, max }, Value::Int(i)) => {
            if *i < min || *i > max {
                return Err(ValidationError::new(
                    name,
                    format!("must be between {min} and {max}"),
                ));
            }
            Ok(())
        }
        (FieldKind::Bool, Value::Bool(_)) => Ok(()),
        (kind, other) => Err(ValidationError::new(
            name,
            format!("expected {}, got {}", kind_label(kind), other.kind_name()),
        )),
    }
}

fn kind_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Str { .. } | FieldKind::Id => "string",
        FieldKind::Int { .. } => "integer",
        FieldKind::Bool => "bool",
    }
}

/// 1 to 64 characters of `[A-Za-z0-9_-]`
pub fn is_valid_id(id: &str) -> bool {
    (1..=64).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
