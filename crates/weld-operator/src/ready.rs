//! Object readiness evaluation
//!
//! "Ready" is the gate that lets dependents consume an object. Well-known
//! workload kinds get built-in rules; anything else can opt in through the
//! `weld.dev/ready-when-field-path` / `weld.dev/ready-when-field-value`
//! annotations. Objects with neither are `Unknown`, which schedules like
//! NotReady but is not an error.

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use weld_common::Error;

use crate::refs::lookup_path;

/// Annotation naming a dotted path into the object
pub const READY_WHEN_FIELD_PATH_ANNOTATION: &str = "weld.dev/ready-when-field-path";

/// Annotation with the literal the path must equal for the object to be ready
pub const READY_WHEN_FIELD_VALUE_ANNOTATION: &str = "weld.dev/ready-when-field-value";

/// Three-valued readiness of a live object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// Dependents may consume the object
    Ready,
    /// The object exists but is still converging
    NotReady,
    /// No rule applies to this kind
    Unknown,
}

/// Decides whether a live object is ready
#[cfg_attr(test, automock)]
pub trait ReadyChecker: Send + Sync {
    /// Evaluate readiness of one live object
    fn is_ready(&self, object: &DynamicObject) -> Result<Readiness, Error>;
}

/// Built-in rules plus annotation-driven fallback
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultReadyChecker;

impl ReadyChecker for DefaultReadyChecker {
    fn is_ready(&self, object: &DynamicObject) -> Result<Readiness, Error> {
        let Some(types) = object.types.as_ref() else {
            return Ok(Readiness::Unknown);
        };
        let (group, _version) = split_api_version(&types.api_version);

        let readiness = match (group, types.kind.as_str()) {
            ("apps", "Deployment") => {
                workload_ready(object, |status| has_condition(status, "Available"))
            }
            ("apps", "StatefulSet") => workload_ready(object, replicas_ready),
            ("", "Service" | "ConfigMap" | "Secret" | "ServiceAccount" | "Namespace") => {
                Readiness::Ready
            }
            ("", "PersistentVolumeClaim") => {
                if object.data.pointer("/status/phase").and_then(Value::as_str) == Some("Bound") {
                    Readiness::Ready
                } else {
                    Readiness::NotReady
                }
            }
            _ => annotation_ready(object)?,
        };
        Ok(readiness)
    }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// A workload is ready once the controller has observed the current
/// generation and the kind-specific availability check passes.
fn workload_ready(object: &DynamicObject, available: fn(&Value) -> bool) -> Readiness {
    let Some(status) = object.data.get("status") else {
        return Readiness::NotReady;
    };
    if let Some(generation) = object.metadata.generation {
        let observed = status
            .get("observedGeneration")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        if observed < generation {
            return Readiness::NotReady;
        }
    }
    if available(status) {
        Readiness::Ready
    } else {
        Readiness::NotReady
    }
}

fn has_condition(status: &Value, type_: &str) -> bool {
    status
        .get("conditions")
        .and_then(Value::as_array)
        .is_some_and(|conditions| {
            conditions.iter().any(|c| {
                c.get("type").and_then(Value::as_str) == Some(type_)
                    && c.get("status").and_then(Value::as_str) == Some("True")
            })
        })
}

fn replicas_ready(status: &Value) -> bool {
    let ready = status.get("readyReplicas").and_then(Value::as_i64).unwrap_or(0);
    let desired = status.get("replicas").and_then(Value::as_i64).unwrap_or(0);
    ready >= desired
}

/// Annotation-driven readiness: the object names a field path, and the field
/// must equal the configured literal.
fn annotation_ready(object: &DynamicObject) -> Result<Readiness, Error> {
    let annotations = object.annotations();
    let Some(path) = annotations.get(READY_WHEN_FIELD_PATH_ANNOTATION) else {
        return Ok(Readiness::Unknown);
    };
    let expected = annotations
        .get(READY_WHEN_FIELD_VALUE_ANNOTATION)
        .map(String::as_str)
        .unwrap_or("Ready");

    let object_json =
        serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))?;
    let ready = lookup_path(&object_json, path)
        .map(|value| scalar_text(value) == expected)
        .unwrap_or(false);
    Ok(if ready { Readiness::Ready } else { Readiness::NotReady })
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
