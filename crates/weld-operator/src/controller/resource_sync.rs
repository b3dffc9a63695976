//! Per-resource reconciliation
//!
//! One resource at a time: wait for producers, materialize the desired
//! object (inline + references, or plugin), fetch the live counterpart,
//! create or update, then evaluate readiness. Failures are folded into the
//! outcome value, so one resource going wrong never corrupts another.

use std::collections::BTreeMap;

use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::{Resource as _, ResourceExt};
use serde_json::Value;
use tracing::{debug, info};

use weld_common::crd::{Bundle, PluginInvocation, Resource, ResourceName};
use weld_common::Error;

use crate::client::SmartClient;
use crate::plugin::{PluginContext, PluginRegistry};
use crate::ready::{ReadyChecker, Readiness};
use crate::refs;
use crate::spec_check;
use crate::store::{is_controlled_by, Store};

/// Computed state of one resource after processing
#[derive(Debug)]
pub enum ResourceOutcome {
    /// One or more producers are not ready; nothing was attempted
    DependenciesNotReady {
        /// Names of the producers that are not ready, sorted
        dependencies: Vec<ResourceName>,
    },
    /// The object was reconciled but is not ready yet
    InProgress,
    /// The object is live and ready
    Ready,
    /// Processing failed; retriability comes from the error itself
    Failed {
        /// What went wrong
        error: Error,
    },
}

/// Per-pass scratch state for one resource
#[derive(Debug)]
pub struct ResourceInfo {
    /// How processing ended
    pub outcome: ResourceOutcome,
    /// The live object after processing, when one exists
    pub actual: Option<DynamicObject>,
}

impl ResourceInfo {
    fn failed(error: Error) -> Self {
        Self {
            outcome: ResourceOutcome::Failed { error },
            actual: None,
        }
    }

    /// Whether the resource finished ready
    pub fn is_ready(&self) -> bool {
        matches!(self.outcome, ResourceOutcome::Ready)
    }

    /// The error, if processing failed
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            ResourceOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// Extract `(group/version/kind, name)` from a desired object
pub(crate) fn desired_identity(object: &Value) -> Result<(GroupVersionKind, String), Error> {
    let api_version = object
        .get("apiVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_spec("object is missing apiVersion"))?;
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_spec("object is missing kind"))?;
    let name = object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_spec("object is missing metadata.name"))?;
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    };
    Ok((
        GroupVersionKind::gvk(group, version, kind),
        name.to_string(),
    ))
}

/// Processes a single resource of a bundle within one pass
pub(crate) struct ResourceSyncTask<'a> {
    pub bundle: &'a Bundle,
    pub processed: &'a BTreeMap<ResourceName, ResourceInfo>,
    pub store: &'a dyn Store,
    pub smart_client: &'a dyn SmartClient,
    pub ready_checker: &'a dyn ReadyChecker,
    pub plugins: &'a PluginRegistry,
}

impl ResourceSyncTask<'_> {
    /// Run the resource state machine; errors become the outcome, never a
    /// panic or a pass failure.
    pub(crate) async fn process(&self, res: &Resource) -> ResourceInfo {
        match self.process_inner(res).await {
            Ok(info) => info,
            Err(error) => ResourceInfo::failed(error),
        }
    }

    async fn process_inner(&self, res: &Resource) -> Result<ResourceInfo, Error> {
        // 1. Every producer must be ready before this resource is attempted.
        let mut not_ready: Vec<ResourceName> = res
            .references
            .iter()
            .map(|r| r.resource.clone())
            .filter(|name| !self.processed.get(name).is_some_and(ResourceInfo::is_ready))
            .collect();
        not_ready.sort();
        not_ready.dedup();
        if !not_ready.is_empty() {
            debug!(resource = %res.name, blocked_on = ?not_ready, "dependencies not ready");
            return Ok(ResourceInfo {
                outcome: ResourceOutcome::DependenciesNotReady {
                    dependencies: not_ready,
                },
                actual: None,
            });
        }

        // 2. Live objects of the producers, for references and plugins.
        let mut dependencies: BTreeMap<ResourceName, DynamicObject> = BTreeMap::new();
        for reference in &res.references {
            if let Some(actual) = self
                .processed
                .get(&reference.resource)
                .and_then(|info| info.actual.as_ref())
            {
                dependencies.insert(reference.resource.clone(), actual.clone());
            }
        }

        // 3. Materialize the desired object.
        let desired = match (&res.object, &res.plugin) {
            (Some(_), Some(_)) => {
                return Err(Error::invalid_spec_for(
                    self.bundle.name_any(),
                    format!("resource {:?} declares both object and plugin", res.name),
                ));
            }
            (None, None) => {
                return Err(Error::invalid_spec_for(
                    self.bundle.name_any(),
                    format!("resource {:?} declares neither object nor plugin", res.name),
                ));
            }
            (Some(object), None) => {
                refs::resolve_references(&res.name, object, &res.references, &dependencies)?
            }
            (None, Some(invocation)) => self.materialize_plugin(invocation, &dependencies)?,
        };

        let (gvk, name) = desired_identity(&desired)?;
        let namespace = self
            .bundle
            .namespace()
            .ok_or_else(|| Error::internal("resource-sync", "bundle has no namespace"))?;

        // 4. Fetch the live counterpart and converge it.
        self.store.track(&gvk);
        let observed = self.store.get(&gvk, &namespace, &name).await?;
        let written = match observed {
            None => self.create(&gvk, &namespace, desired).await?,
            Some(actual) => self.update_if_needed(&gvk, &namespace, desired, actual).await?,
        };

        // 5. Readiness gates dependents.
        match self.ready_checker.is_ready(&written)? {
            Readiness::Ready => Ok(ResourceInfo {
                outcome: ResourceOutcome::Ready,
                actual: Some(written),
            }),
            Readiness::NotReady | Readiness::Unknown => Ok(ResourceInfo {
                outcome: ResourceOutcome::InProgress,
                actual: Some(written),
            }),
        }
    }

    fn materialize_plugin(
        &self,
        invocation: &PluginInvocation,
        dependencies: &BTreeMap<ResourceName, DynamicObject>,
    ) -> Result<Value, Error> {
        let bundle_name = self.bundle.name_any();
        let bundle_namespace = self.bundle.namespace().unwrap_or_default();
        let bundle_uid = self.bundle.uid().unwrap_or_default();
        let ctx = PluginContext {
            bundle_name: &bundle_name,
            bundle_namespace: &bundle_namespace,
            bundle_uid: &bundle_uid,
            object_name: &invocation.object_name,
            spec: invocation.spec.as_ref(),
            dependencies,
        };
        let produced = self.plugins.invoke(&invocation.name, &ctx)?;

        // The plugin must produce exactly what it describes.
        let description = self
            .plugins
            .lookup(&invocation.name)
            .expect("plugin exists, invoke succeeded")
            .describe();
        let (gvk, name) = desired_identity(&produced)?;
        if gvk.group != description.gvk.group
            || gvk.version != description.gvk.version
            || gvk.kind != description.gvk.kind
        {
            return Err(Error::plugin(
                &invocation.name,
                format!(
                    "produced {}/{}, Kind={} but describes {}/{}, Kind={}",
                    gvk.group,
                    gvk.version,
                    gvk.kind,
                    description.gvk.group,
                    description.gvk.version,
                    description.gvk.kind
                ),
            ));
        }
        if name != invocation.object_name {
            return Err(Error::plugin(
                &invocation.name,
                format!(
                    "produced object named {name:?}, expected {:?}",
                    invocation.object_name
                ),
            ));
        }
        Ok(produced)
    }

    async fn create(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        desired: Value,
    ) -> Result<DynamicObject, Error> {
        let mut object: DynamicObject = serde_json::from_value(desired)
            .map_err(|e| Error::serialization_for_kind(&gvk.kind, e.to_string()))?;

        // The controller owner reference is the single source of truth for
        // cleanup; a fresh object carries exactly one.
        let owner = self
            .bundle
            .controller_owner_ref(&())
            .ok_or_else(|| Error::internal("resource-sync", "bundle has no name or uid"))?;
        object.metadata.owner_references = Some(vec![owner]);
        object.metadata.namespace = Some(namespace.to_string());

        let client = self.smart_client.for_gvk(gvk, namespace).await?;
        info!(kind = %gvk.kind, name = %object.name_any(), "creating object");
        client.create(&object).await
    }

    async fn update_if_needed(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        desired: Value,
        actual: DynamicObject,
    ) -> Result<DynamicObject, Error> {
        let bundle_uid = self
            .bundle
            .uid()
            .ok_or_else(|| Error::internal("resource-sync", "bundle has no uid"))?;
        if !is_controlled_by(&actual, &bundle_uid) {
            // Never mutate an object some other owner controls.
            return Err(Error::foreign_object(&gvk.kind, actual.name_any()));
        }

        let (to_write, update_needed) = spec_check::compare(&desired, &actual)?;
        if !update_needed {
            debug!(kind = %gvk.kind, name = %actual.name_any(), "object up to date");
            return Ok(actual);
        }

        let client = self.smart_client.for_gvk(gvk, namespace).await?;
        info!(kind = %gvk.kind, name = %to_write.name_any(), "updating object");
        client.update(&to_write).await
    }
}
