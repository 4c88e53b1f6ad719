//! Event transformation: field extraction and schema validation.
//!
//! `transform` is a pure function from a raw event to a canonical event or a
//! validation failure. It holds no shared state and is safe to invoke
//! concurrently for independent events. Malformed input is a typed failure,
//! never a panic.

use crate::message::{CanonicalEvent, RawEvent};
use crate::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Expected type of an extracted field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
    Array,
    /// Accept any JSON value
    Any,
}

impl FieldKind {
    /// Check whether `value` conforms to this kind
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Float => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Float => "float",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        };
        write!(f, "{}", name)
    }
}

impl std::str::FromStr for FieldKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "string" => Ok(FieldKind::String),
            "integer" => Ok(FieldKind::Integer),
            "float" => Ok(FieldKind::Float),
            "boolean" => Ok(FieldKind::Boolean),
            "object" => Ok(FieldKind::Object),
            "array" => Ok(FieldKind::Array),
            "any" => Ok(FieldKind::Any),
            _ => Err(format!("Unknown field kind: {}", s)),
        }
    }
}

/// Declared shape of a single extracted field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSchema {
    /// Field name in the canonical mapping
    pub name: String,
    /// Path expression applied to the raw payload
    pub path: String,
    /// Expected type of the extracted value
    #[serde(default = "default_field_kind")]
    pub kind: FieldKind,
    /// Whether the field must be present
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_field_kind() -> FieldKind {
    FieldKind::Any
}

fn default_required() -> bool {
    true
}

/// Schema for one channel: an identifier plus its field declarations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSchema {
    /// Schema identifier carried on every canonical event
    pub id: String,
    /// Field declarations, extraction path included
    pub fields: Vec<FieldSchema>,
}

/// Resolve a dotted path expression against a JSON value
///
/// Segments are object keys, numeric array indices, or `*` which expands to
/// every element of an array or every value of an object. The result is the
/// list of all matching nodes; the caller decides how many are acceptable.
pub fn resolve_path<'a>(path: &str, root: &'a Value) -> Vec<&'a Value> {
    let mut current = vec![root];

    for segment in path.split('.') {
        let mut next = Vec::new();
        for node in current {
            match segment {
                "*" => match node {
                    Value::Array(items) => next.extend(items.iter()),
                    Value::Object(map) => next.extend(map.values()),
                    _ => {}
                },
                _ => match node {
                    Value::Object(map) => {
                        if let Some(value) = map.get(segment) {
                            next.push(value);
                        }
                    }
                    Value::Array(items) => {
                        if let Ok(index) = segment.parse::<usize>() {
                            if let Some(value) = items.get(index) {
                                next.push(value);
                            }
                        }
                    }
                    _ => {}
                },
            }
        }
        current = next;
        if current.is_empty() {
            break;
        }
    }

    current
}

/// Extract and validate a raw event against a channel schema
///
/// Returns the canonical event on success, or a `BridgeError::Validation`
/// describing the first offending field. A validation failure still counts
/// toward cursor advancement; the caller reports it and moves on.
pub fn transform(raw: &RawEvent, schema: &ChannelSchema) -> BridgeResult<CanonicalEvent> {
    let mut fields = Map::new();

    for field in &schema.fields {
        let matches = resolve_path(&field.path, &raw.payload);

        match matches.len() {
            0 => {
                if field.required {
                    return Err(validation_failure(
                        raw,
                        format!("required field '{}' not found at '{}'", field.name, field.path),
                    ));
                }
            }
            1 => {
                let value = matches[0];
                if !field.kind.matches(value) {
                    return Err(validation_failure(
                        raw,
                        format!(
                            "field '{}' at '{}' expected {}, got {}",
                            field.name,
                            field.path,
                            field.kind,
                            json_type_name(value)
                        ),
                    ));
                }
                fields.insert(field.name.clone(), value.clone());
            }
            count => {
                return Err(validation_failure(
                    raw,
                    format!(
                        "field '{}' at '{}' matched {} nodes, expected exactly one",
                        field.name, field.path, count
                    ),
                ));
            }
        }
    }

    Ok(CanonicalEvent::new(
        raw.channel.clone(),
        schema.id.clone(),
        fields,
        raw.position.clone(),
    ))
}

fn validation_failure(raw: &RawEvent, message: String) -> BridgeError {
    BridgeError::validation(&raw.channel, &raw.position.token, message)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
