//! Bundle Custom Resource Definition
//!
//! A Bundle declares a set of related cluster objects and the references
//! between them. Each resource is either an inline object or a plugin
//! invocation; references pull values out of already-reconciled dependencies
//! into the consumer's spec via `${name}` placeholders.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Condition;
use crate::DELETE_RESOURCES_FINALIZER;

/// Name of a resource within a Bundle spec, unique per bundle
pub type ResourceName = String;

/// Condition types used in Bundle and resource statuses
pub mod condition_types {
    /// Resource is waiting for one of its dependencies to become ready
    pub const BLOCKED: &str = "Blocked";
    /// Work is ongoing (object written but not yet ready, or retrying)
    pub const IN_PROGRESS: &str = "InProgress";
    /// The object (or every object, at bundle level) is ready
    pub const READY: &str = "Ready";
    /// Processing failed
    pub const ERROR: &str = "Error";
}

/// Condition reasons used in Bundle and resource statuses
pub mod condition_reasons {
    /// The failure will be retried with back-off
    pub const RETRIABLE_ERROR: &str = "RetriableError";
    /// The failure requires a spec change to resolve
    pub const TERMINAL_ERROR: &str = "TerminalError";
    /// Producers of this resource are not ready yet
    pub const DEPENDENCIES_NOT_READY: &str = "DependenciesNotReady";
}

/// Bundle declares a group of cluster objects reconciled as one unit
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "weld.dev",
    version = "v1alpha1",
    kind = "Bundle",
    plural = "bundles",
    shortname = "bd",
    status = "BundleStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Error","type":"string","jsonPath":".status.conditions[?(@.type==\"Error\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BundleSpec {
    /// Desired resources, in declaration order
    #[serde(default)]
    pub resources: Vec<Resource>,
}

/// One entry of a Bundle spec: an inline object or a plugin invocation
///
/// Exactly one of `object` and `plugin` must be set; declaring neither or
/// both is a terminal error for this resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Name of the resource, unique within the bundle
    pub name: ResourceName,

    /// References to other resources in this bundle. Each reference creates
    /// a dependency edge; named references additionally make the extracted
    /// value available as a `${name}` placeholder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Reference>,

    /// Full desired object, including apiVersion, kind and metadata.name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,

    /// Plugin invocation producing the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginInvocation>,
}

/// A declaration that this resource consumes a value from another resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Placeholder name this reference binds. A reference without a name
    /// only expresses ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Name of the producer resource within the same bundle
    pub resource: ResourceName,

    /// Dotted path into the producer's live object (e.g. `status.podIP`,
    /// `spec.ports.0.port`). Evaluated against the live object because the
    /// value may be server-assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Optional transformation of the extracted value (e.g. `base64decode`
    /// for secret data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<String>,

    /// Example of the expected value, quoted in errors when the path is
    /// missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<serde_json::Value>,
}

/// Invocation of a registered plugin to synthesize an object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInvocation {
    /// Name of the plugin in the registry
    pub name: String,

    /// metadata.name of the object the plugin produces
    pub object_name: String,

    /// Opaque plugin configuration, interpreted by the plugin alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

/// Observed state of a Bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatus {
    /// Bundle-level conditions: InProgress, Ready, Error
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Per-resource conditions, in spec order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_statuses: Vec<ResourceStatus>,

    /// One status per distinct plugin referenced by the spec, in order of
    /// first mention
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugin_statuses: Vec<PluginStatus>,

    /// Objects controlled by this bundle but no longer present in its spec,
    /// pending deletion. Sorted by (group, version, kind, name).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects_to_delete: Vec<ObjectToDelete>,
}

impl BundleStatus {
    /// Look up a bundle-level condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Look up the status entry for a resource by name
    pub fn get_resource_status(&self, name: &str) -> Option<&ResourceStatus> {
        self.resource_statuses.iter().find(|s| s.name == name)
    }
}

/// Conditions of one resource within a Bundle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Name of the resource in the spec
    pub name: ResourceName,

    /// Blocked, InProgress, Ready and Error conditions for this resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    /// Look up a condition by type
    pub fn get_condition(&self, type_: &str) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Registration state of a plugin referenced by the spec
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PluginStatusValue {
    /// The plugin is registered
    Ok,
    /// The spec names a plugin that is not registered
    NoSuchPlugin,
}

/// Status of one plugin referenced by the spec
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginStatus {
    /// Plugin name as referenced in the spec
    pub name: String,

    /// API group of the objects the plugin produces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,

    /// API version of the objects the plugin produces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Kind of the objects the plugin produces
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,

    /// Whether the plugin is registered
    pub status: PluginStatusValue,
}

/// Identity of an object pending deletion
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "camelCase")]
pub struct ObjectToDelete {
    /// API group ("" for the core group)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// metadata.name
    pub name: String,
}

impl Bundle {
    /// Whether the bundle carries the controller's own cleanup finalizer
    pub fn has_delete_resources_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == DELETE_RESOURCES_FINALIZER))
    }

    /// Whether the platform foreground-deletion finalizer is present
    pub fn has_foreground_deletion_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == crate::FOREGROUND_DELETION_FINALIZER))
    }
}

/// Return the finalizer list with the cleanup finalizer appended (idempotent)
pub fn add_delete_resources_finalizer(finalizers: &[String]) -> Vec<String> {
    let mut out = finalizers.to_vec();
    if !out.iter().any(|f| f == DELETE_RESOURCES_FINALIZER) {
        out.push(DELETE_RESOURCES_FINALIZER.to_string());
    }
    out
}

/// Return the finalizer list without the cleanup finalizer
pub fn remove_delete_resources_finalizer(finalizers: &[String]) -> Vec<String> {
    finalizers
        .iter()
        .filter(|f| f.as_str() != DELETE_RESOURCES_FINALIZER)
        .cloned()
        .collect()
}
