// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Parameter-schema serialisation and argument validation.

use serde_json::{json, Map, Value};

use crate::tool::{ParamKind, ToolParam};

/// Serialise a parameter list into a JSON-Schema object suitable for the
/// provider's function-calling API.
pub fn params_to_schema(params: &[ToolParam]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();
    for p in params {
        let mut prop = Map::new();
        prop.insert("type".into(), json!(p.kind.as_str()));
        prop.insert("description".into(), json!(p.description));
        if !p.allowed.is_empty() {
            prop.insert("enum".into(), json!(p.allowed));
        }
        properties.insert(p.name.clone(), Value::Object(prop));
        if p.required {
            required.push(p.name.clone());
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

/// Validate `args` against `params`.
///
/// Returns the normalised argument map, or a list of human-readable errors.
/// Unknown parameters are rejected in strict mode and passed through
/// otherwise; in lenient mode, mistyped scalars are coerced where an
/// unambiguous conversion exists.
pub fn validate_args(
    params: &[ToolParam],
    args: &Value,
    strict: bool,
) -> Result<Map<String, Value>, Vec<String>> {
    let mut errors = Vec::new();

    let obj = match args {
        Value::Object(m) => m.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(vec![format!(
                "arguments must be a JSON object, got {}",
                type_name(other)
            )])
        }
    };

    let mut normalised = Map::new();

    for p in params {
        match obj.get(&p.name) {
            None => {
                if p.required {
                    errors.push(format!("missing required parameter '{}'", p.name));
                }
            }
            Some(v) => match check_or_coerce(p, v, strict) {
                Ok(v) => {
                    normalised.insert(p.name.clone(), v);
                }
                Err(e) => errors.push(e),
            },
        }
    }

    for key in obj.keys() {
        if params.iter().all(|p| p.name != *key) {
            if strict {
                errors.push(format!("unknown parameter '{key}'"));
            } else {
                normalised.insert(key.clone(), obj[key].clone());
            }
        }
    }

    if errors.is_empty() {
        Ok(normalised)
    } else {
        Err(errors)
    }
}

fn check_or_coerce(p: &ToolParam, v: &Value, strict: bool) -> Result<Value, String> {
    let ok = match p.kind {
        ParamKind::String => v.is_string(),
        ParamKind::Integer => v.is_i64() || v.is_u64(),
        ParamKind::Number => v.is_number(),
        ParamKind::Boolean => v.is_boolean(),
        ParamKind::Array => v.is_array(),
        ParamKind::Object => v.is_object(),
    };

    let value = if ok {
        v.clone()
    } else if strict {
        return Err(format!(
            "parameter '{}' must be {}, got {}",
            p.name,
            p.kind.as_str(),
            type_name(v)
        ));
    } else {
        coerce(p.kind, v).ok_or_else(|| {
            format!(
                "parameter '{}' must be {}, got {}",
                p.name,
                p.kind.as_str(),
                type_name(v)
            )
        })?
    };

    if !p.allowed.is_empty() {
        let s = value.as_str().unwrap_or_default();
        if !p.allowed.iter().any(|a| a == s) {
            return Err(format!(
                "parameter '{}' must be one of [{}], got {:?}",
                p.name,
                p.allowed.join(", "),
                s
            ));
        }
    }

    Ok(value)
}

/// Lenient-mode scalar coercion.  Only unambiguous conversions are applied.
fn coerce(kind: ParamKind, v: &Value) -> Option<Value> {
    match (kind, v) {
        (ParamKind::String, Value::Number(n)) => Some(json!(n.to_string())),
        (ParamKind::String, Value::Bool(b)) => Some(json!(b.to_string())),
        (ParamKind::Integer, Value::String(s)) => s.parse::<i64>().ok().map(|n| json!(n)),
        (ParamKind::Number, Value::String(s)) => s.parse::<f64>().ok().map(|n| json!(n)),
        (ParamKind::Boolean, Value::String(s)) => match s.as_str() {
            "true" => Some(json!(true)),
            "false" => Some(json!(false)),
            _ => None,
        },
        _ => None,
    }
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
