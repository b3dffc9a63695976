//! Reference resolution
//!
//! A consumer resource pulls values out of its producers' live objects and
//! injects them into its own desired spec through `${name}` placeholders.
//! The placeholder syntax matches the rest of the platform: `${...}` marks a
//! substitution, `$${...}` escapes to a literal `${...}`.
//!
//! Paths are evaluated against the producer's *live* object, never its
//! desired spec, because the interesting values (pod IPs, generated names,
//! status URLs) are assigned by the server.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::api::DynamicObject;
use serde_json::Value;

use weld_common::crd::{Reference, ResourceName};
use weld_common::Error;

/// Modifier that base64-decodes the extracted value (secret `data` entries)
pub const MODIFIER_BASE64_DECODE: &str = "base64decode";

/// Walk a dotted path (`status.podIP`, `spec.ports.0.port`) into a JSON
/// value. An empty path selects the whole value.
pub(crate) fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Resolve the named references of `resource` against its dependencies'
/// live objects and substitute them into `object`.
pub fn resolve_references(
    resource: &str,
    object: &Value,
    references: &[Reference],
    dependencies: &BTreeMap<ResourceName, DynamicObject>,
) -> Result<Value, Error> {
    let mut values: BTreeMap<&str, Value> = BTreeMap::new();
    for reference in references {
        let Some(name) = reference.name.as_deref() else {
            // Unnamed references only order the graph
            continue;
        };
        let producer = dependencies.get(&reference.resource).ok_or_else(|| {
            Error::internal(
                "reference-resolver",
                format!(
                    "producer {:?} of resource {resource:?} has no live object",
                    reference.resource
                ),
            )
        })?;
        let producer_json = serde_json::to_value(producer)
            .map_err(|e| Error::serialization(e.to_string()))?;
        let path = reference.path.as_deref().unwrap_or("");
        let extracted = lookup_path(&producer_json, path).ok_or_else(|| {
            let example = reference
                .example
                .as_ref()
                .map(|e| format!(" (example: {e})"))
                .unwrap_or_default();
            Error::reference_pending(
                resource,
                format!(
                    "path {path:?} not found in live object of {:?}{example}",
                    reference.resource
                ),
            )
        })?;
        let value = apply_modifier(resource, reference, extracted)?;
        values.insert(name, value);
    }
    substitute(resource, object, &values)
}

fn apply_modifier(resource: &str, reference: &Reference, value: &Value) -> Result<Value, Error> {
    match reference.modifier.as_deref() {
        None => Ok(value.clone()),
        Some(MODIFIER_BASE64_DECODE) => {
            let encoded = value.as_str().ok_or_else(|| {
                Error::reference_invalid(
                    resource,
                    format!(
                        "modifier {MODIFIER_BASE64_DECODE:?} requires a string value at path {:?}",
                        reference.path.as_deref().unwrap_or("")
                    ),
                )
            })?;
            let decoded = BASE64.decode(encoded).map_err(|e| {
                Error::reference_invalid(resource, format!("value is not valid base64: {e}"))
            })?;
            let text = String::from_utf8(decoded).map_err(|e| {
                Error::reference_invalid(resource, format!("decoded value is not UTF-8: {e}"))
            })?;
            Ok(Value::String(text))
        }
        Some(other) => Err(Error::reference_invalid(
            resource,
            format!("unknown modifier {other:?}"),
        )),
    }
}

fn substitute(
    resource: &str,
    value: &Value,
    values: &BTreeMap<&str, Value>,
) -> Result<Value, Error> {
    match value {
        Value::String(s) => substitute_string(resource, s, values),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute(resource, item, values))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute(resource, item, values)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

enum Segment<'a> {
    Literal(String),
    Placeholder(&'a str),
}

/// Split a string into literal and placeholder segments. `$${` escapes to a
/// literal `${`; an unterminated `${` is kept as literal text.
fn parse_segments(s: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut rest = s;
    while !rest.is_empty() {
        if let Some(tail) = rest.strip_prefix("$${") {
            literal.push_str("${");
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("${") {
            match tail.find('}') {
                Some(end) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(&tail[..end]));
                    rest = &tail[end + 1..];
                }
                None => {
                    literal.push_str(rest);
                    rest = "";
                }
            }
        } else {
            let ch = rest.chars().next().expect("rest is non-empty");
            literal.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    segments
}

fn substitute_string(
    resource: &str,
    s: &str,
    values: &BTreeMap<&str, Value>,
) -> Result<Value, Error> {
    let segments = parse_segments(s);

    // A string that is exactly one placeholder injects the typed value, so
    // numbers and whole objects can cross the reference boundary.
    if let [Segment::Placeholder(name)] = segments.as_slice() {
        return values
            .get(name)
            .cloned()
            .ok_or_else(|| undeclared(resource, name));
    }

    let mut out = String::new();
    for segment in &segments {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Placeholder(name) => {
                let value = values.get(name).ok_or_else(|| undeclared(resource, name))?;
                match value {
                    Value::String(text) => out.push_str(text),
                    Value::Number(n) => out.push_str(&n.to_string()),
                    Value::Bool(b) => out.push_str(&b.to_string()),
                    Value::Null | Value::Array(_) | Value::Object(_) => {
                        return Err(Error::reference_invalid(
                            resource,
                            format!("cannot interpolate non-scalar reference {name:?} into a string"),
                        ))
                    }
                }
            }
        }
    }
    Ok(Value::String(out))
}

fn undeclared(resource: &str, name: &str) -> Error {
    Error::reference_invalid(
        resource,
        format!("placeholder ${{{name}}} does not match any named reference"),
    )
}
