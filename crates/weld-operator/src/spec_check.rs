//! Desired-vs-live object comparison
//!
//! The server defaults unset fields, assigns metadata, and other actors
//! inject finalizers and owner references. A naive equality between the
//! desired spec and the observed object would update forever. Instead the
//! desired object is merged *over* the observed one: fields set in desired
//! win, everything else is preserved, and cluster-managed fields are always
//! taken from the live object. An update is issued only when that merge
//! differs from what was observed.

use kube::api::DynamicObject;
use serde_json::Value;

use weld_common::Error;

/// Fields always owned by the cluster (or other controllers), never by the
/// bundle's desired spec.
const PRESERVED_POINTERS: &[&str] = &[
    "/metadata/resourceVersion",
    "/metadata/uid",
    "/metadata/creationTimestamp",
    "/metadata/generation",
    "/metadata/managedFields",
    "/metadata/finalizers",
    "/metadata/ownerReferences",
    "/metadata/selfLink",
    "/status",
];

/// Merge `desired` over `actual` and report whether a write is needed.
///
/// Returns the object to write (carrying the observed resource version as
/// the update precondition) and the `update needed` flag.
pub fn compare(desired: &Value, actual: &DynamicObject) -> Result<(DynamicObject, bool), Error> {
    let actual_json =
        serde_json::to_value(actual).map_err(|e| Error::serialization(e.to_string()))?;

    let mut overlay = desired.clone();
    prune_nulls(&mut overlay);

    let mut merged = actual_json.clone();
    deep_merge(&mut merged, &overlay);

    for pointer in PRESERVED_POINTERS {
        copy_pointer(&mut merged, &actual_json, pointer);
    }

    let update_needed = merged != actual_json;
    let to_write: DynamicObject =
        serde_json::from_value(merged).map_err(|e| Error::serialization(e.to_string()))?;
    Ok((to_write, update_needed))
}

/// Recursively overlay `overlay` onto `target`: objects merge key-wise,
/// everything else (scalars, arrays) is replaced wholesale.
fn deep_merge(target: &mut Value, overlay: &Value) {
    match (target, overlay) {
        (Value::Object(target_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, overlay) => *target = overlay.clone(),
    }
}

/// Drop null entries from the desired object; a null in desired means
/// "unset", and unset fields are preserved from the live object.
fn prune_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                prune_nulls(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                prune_nulls(item);
            }
        }
        _ => {}
    }
}

/// Force `merged[pointer]` to mirror `actual[pointer]`, removing it when the
/// live object does not have it.
fn copy_pointer(merged: &mut Value, actual: &Value, pointer: &str) {
    let (parent, key) = pointer
        .rsplit_once('/')
        .expect("preserved pointers are absolute");
    match actual.pointer(pointer) {
        Some(value) => {
            let value = value.clone();
            if let Some(slot) = merged.pointer_mut(pointer) {
                *slot = value;
            } else if let Some(Value::Object(map)) = merged.pointer_mut(parent) {
                map.insert(key.to_string(), value);
            }
        }
        None => {
            if let Some(Value::Object(map)) = merged.pointer_mut(parent) {
                map.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::{ApiResource, GroupVersionKind};
    use serde_json::json;

    fn live(data: Value, meta: Value) -> DynamicObject {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("", "v1", "ConfigMap"));
        let mut obj = DynamicObject::new("cm", &ar).within("default");
        obj.metadata = serde_json::from_value(meta).unwrap();
        obj.data = data;
        obj
    }

    #[test]
    fn test_no_drift_means_no_update() {
        let actual = live(
            json!({"data": {"greeting": "hello"}}),
            json!({
                "name": "cm",
                "namespace": "default",
                "uid": "u-1",
                "resourceVersion": "42",
            }),
        );
        // Desired omits everything the server assigned
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"greeting": "hello"},
        });
        let (_, update_needed) = compare(&desired, &actual).unwrap();
        assert!(!update_needed);
    }

    #[test]
    fn test_changed_field_requires_update_and_keeps_version() {
        let actual = live(
            json!({"data": {"greeting": "hello"}}),
            json!({
                "name": "cm",
                "namespace": "default",
                "uid": "u-1",
                "resourceVersion": "42",
            }),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"greeting": "goodbye"},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(update_needed);
        assert_eq!(to_write.data["data"]["greeting"], "goodbye");
        // Observed resource version rides along as the update precondition
        assert_eq!(to_write.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(to_write.metadata.uid.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_unset_desired_fields_are_preserved() {
        let actual = live(
            json!({"data": {"a": "1", "b": "2"}}),
            json!({"name": "cm", "namespace": "default"}),
        );
        // Desired only pins "a"; the server-kept "b" must survive the merge
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"a": "1"},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(!update_needed);
        assert_eq!(to_write.data["data"]["b"], "2");
    }

    #[test]
    fn test_cluster_managed_metadata_cannot_be_clobbered() {
        let actual = live(
            json!({}),
            json!({
                "name": "cm",
                "namespace": "default",
                "uid": "u-1",
                "resourceVersion": "42",
                "finalizers": ["other.io/guard"],
                "ownerReferences": [{
                    "apiVersion": "weld.dev/v1alpha1",
                    "kind": "Bundle",
                    "name": "app",
                    "uid": "bundle-uid",
                    "controller": true,
                }],
            }),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm",
                "uid": "forged",
                "resourceVersion": "1",
                "finalizers": [],
                "ownerReferences": [],
            },
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(!update_needed);
        assert_eq!(to_write.metadata.uid.as_deref(), Some("u-1"));
        assert_eq!(to_write.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            to_write.metadata.finalizers,
            Some(vec!["other.io/guard".to_string()])
        );
        assert_eq!(
            to_write
                .metadata
                .owner_references
                .as_ref()
                .map(Vec::len),
            Some(1)
        );
    }

    #[test]
    fn test_status_is_always_the_live_status() {
        let actual = live(
            json!({"status": {"observedGeneration": 7}}),
            json!({"name": "cm", "namespace": "default"}),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "status": {"observedGeneration": 1},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(!update_needed);
        assert_eq!(to_write.data["status"]["observedGeneration"], 7);
    }

    #[test]
    fn test_null_in_desired_means_unset_not_clear() {
        let actual = live(
            json!({"data": {"keep": "me"}}),
            json!({"name": "cm", "namespace": "default"}),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "data": {"keep": null},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(!update_needed);
        assert_eq!(to_write.data["data"]["keep"], "me");
    }

    #[test]
    fn test_labels_merge_instead_of_replacing() {
        let actual = live(
            json!({}),
            json!({
                "name": "cm",
                "namespace": "default",
                "labels": {"injected-by": "admission"},
            }),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm", "labels": {"app": "weld"}},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(update_needed);
        let labels = to_write.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("weld"));
        assert_eq!(
            labels.get("injected-by").map(String::as_str),
            Some("admission")
        );
    }

    #[test]
    fn test_arrays_replace_wholesale() {
        let actual = live(
            json!({"spec": {"args": ["a", "b"]}}),
            json!({"name": "cm", "namespace": "default"}),
        );
        let desired = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"},
            "spec": {"args": ["c"]},
        });
        let (to_write, update_needed) = compare(&desired, &actual).unwrap();
        assert!(update_needed);
        assert_eq!(to_write.data["spec"]["args"], json!(["c"]));
    }
}
