//! Bundle reconciliation pass
//!
//! One pass per observed change: decide normal vs deletion path, walk the
//! resources in dependency order, garbage-collect objects that left the
//! spec, aggregate the outcomes into conditions and write the bundle back
//! exactly once. A write conflict on a managed object stops the walk and
//! returns retriable; the harness re-enqueues against fresh state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use weld_common::crd::{
    add_delete_resources_finalizer, condition_reasons, condition_types,
    remove_delete_resources_finalizer, Bundle, Condition, ConditionStatus, ObjectToDelete,
    Resource, ResourceName, ResourceStatus,
};
use weld_common::{graph, Error};

use super::resource_sync::{desired_identity, ResourceInfo, ResourceOutcome, ResourceSyncTask};
use super::status;
use super::Context;

/// Key identifying one object pending deletion
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct ObjectRef {
    group: String,
    version: String,
    kind: String,
    name: String,
}

impl ObjectRef {
    fn from_object(object: &DynamicObject) -> Option<Self> {
        let types = object.types.as_ref()?;
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group.to_string(), version.to_string()),
            None => (String::new(), types.api_version.clone()),
        };
        Some(Self {
            group,
            version,
            kind: types.kind.clone(),
            name: object.name_any(),
        })
    }

    fn from_gvk(gvk: &GroupVersionKind, name: impl Into<String>) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            name: name.into(),
        }
    }

    fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }

    fn to_status(&self) -> ObjectToDelete {
        ObjectToDelete {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
        }
    }
}

/// One reconciliation pass over one bundle
pub(crate) struct BundleSyncTask<'a> {
    ctx: &'a Context,
    /// Owned working copy; mutated in place and written back once
    pub(crate) bundle: Bundle,
    /// Outcome per resource processed this pass
    processed: BTreeMap<ResourceName, ResourceInfo>,
    /// Controlled objects absent from the spec, memoized per pass
    objects_to_delete: Option<BTreeMap<ObjectRef, DynamicObject>>,
    /// Staged finalizer change; its presence makes this a finalizer-only pass
    new_finalizers: Option<Vec<String>>,
}

impl<'a> BundleSyncTask<'a> {
    pub(crate) fn new(ctx: &'a Context, bundle: Bundle) -> Self {
        Self {
            ctx,
            bundle,
            processed: BTreeMap::new(),
            objects_to_delete: None,
            new_finalizers: None,
        }
    }

    /// Run the full pass: process, aggregate status, write the bundle.
    pub(crate) async fn run(&mut self) -> Result<(), Error> {
        let result = if self.bundle.metadata.deletion_timestamp.is_some() {
            self.process_deleted().await
        } else {
            self.process_normal().await
        };
        self.finish(result).await
    }

    // =========================================================================
    // Normal path
    // =========================================================================

    async fn process_normal(&mut self) -> Result<(), Error> {
        // Defer real work until the cleanup finalizer is confirmed, so a
        // deletion arriving later always finds it in place.
        if !self.bundle.has_delete_resources_finalizer() {
            let existing = self.bundle.metadata.finalizers.clone().unwrap_or_default();
            self.new_finalizers = Some(add_delete_resources_finalizer(&existing));
            info!("staging cleanup finalizer");
            return Ok(());
        }

        let mut seen = BTreeSet::new();
        for res in &self.bundle.spec.resources {
            if !seen.insert(res.name.as_str()) {
                return Err(Error::invalid_spec_for(
                    self.bundle.name_any(),
                    format!("bundle contains two resources with the same name {:?}", res.name),
                ));
            }
        }

        let sorted = graph::sort_resources(&self.bundle.spec.resources)?;

        // GVKs from a previous pass's deletion list must stay visible to the
        // controlled-object scan even after an operator restart.
        if let Some(old_status) = self.bundle.status.as_ref() {
            for pending in &old_status.objects_to_delete {
                self.ctx.store.track(&GroupVersionKind::gvk(
                    &pending.group,
                    &pending.version,
                    &pending.kind,
                ));
            }
        }

        let resources = self.bundle.spec.resources.clone();
        let by_name: BTreeMap<&str, &Resource> =
            resources.iter().map(|r| (r.name.as_str(), r)).collect();

        for name in &sorted {
            let res = by_name
                .get(name.as_str())
                .expect("sorted names come from the spec");
            let resource_info = {
                let task = ResourceSyncTask {
                    bundle: &self.bundle,
                    processed: &self.processed,
                    store: self.ctx.store.as_ref(),
                    smart_client: self.ctx.smart_client.as_ref(),
                    ready_checker: self.ctx.ready_checker.as_ref(),
                    plugins: self.ctx.plugins.as_ref(),
                };
                task.process(res).await
            };
            match resource_info.error() {
                Some(err) if err.is_conflict() => {
                    // Short circuit on conflict
                    warn!(resource = %name, error = %err, "conflict, aborting pass");
                    let ResourceOutcome::Failed { error } = resource_info.outcome else {
                        unreachable!("error() returned Some");
                    };
                    return Err(error);
                }
                Some(err) => {
                    warn!(resource = %name, ready = resource_info.is_ready(), error = %err, "done processing resource");
                }
                None => {
                    info!(resource = %name, ready = resource_info.is_ready(), "done processing resource");
                }
            }
            self.processed.insert(name.clone(), resource_info);
        }

        self.find_objects_to_delete().await?;
        if self.is_bundle_ready() {
            // Delete objects which were removed from the bundle
            let pending = self.objects_to_delete.clone().unwrap_or_default();
            self.delete_objects(&pending).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Deletion path
    // =========================================================================

    /// Process a bundle marked with a deletion timestamp.
    ///
    /// When the platform's foreground finalizer is absent, cascade manually:
    /// by the time the cleanup finalizer is removed every controlled object
    /// must be deleted or actively being deleted.
    async fn process_deleted(&mut self) -> Result<(), Error> {
        if !self.bundle.has_delete_resources_finalizer() {
            return Ok(());
        }
        if !self.bundle.has_foreground_deletion_finalizer() {
            self.delete_all_objects().await?;
        }
        let existing = self.bundle.metadata.finalizers.clone().unwrap_or_default();
        self.new_finalizers = Some(remove_delete_resources_finalizer(&existing));
        info!("staging cleanup finalizer removal");
        Ok(())
    }

    async fn delete_all_objects(&mut self) -> Result<(), Error> {
        let namespace = self.namespace()?;
        let uid = self.uid()?;
        let objects = self
            .ctx
            .store
            .objects_controlled_by(&namespace, &uid)
            .await?;
        let mut pending = BTreeMap::new();
        for object in objects {
            match ObjectRef::from_object(&object) {
                Some(reference) => {
                    pending.insert(reference, object);
                }
                None => warn!(object = %object.name_any(), "controlled object has no type information"),
            }
        }
        self.objects_to_delete = Some(pending.clone());
        self.delete_objects(&pending).await
    }

    // =========================================================================
    // Deletion sweep
    // =========================================================================

    /// Controlled objects minus everything the spec still names.
    async fn find_objects_to_delete(&mut self) -> Result<(), Error> {
        let namespace = self.namespace()?;
        let uid = self.uid()?;
        let objects = self
            .ctx
            .store
            .objects_controlled_by(&namespace, &uid)
            .await?;

        let mut pending = BTreeMap::new();
        for object in objects {
            match ObjectRef::from_object(&object) {
                Some(reference) => {
                    pending.insert(reference, object);
                }
                None => warn!(object = %object.name_any(), "controlled object has no type information"),
            }
        }

        for res in &self.bundle.spec.resources {
            let identity = if let Some(object) = &res.object {
                // A malformed object was already reported while processing
                // this resource; it cannot name a controlled object.
                desired_identity(object)
                    .ok()
                    .map(|(gvk, name)| ObjectRef::from_gvk(&gvk, name))
            } else if let Some(invocation) = &res.plugin {
                self.ctx.plugins.lookup(&invocation.name).map(|plugin| {
                    ObjectRef::from_gvk(&plugin.describe().gvk, invocation.object_name.clone())
                })
            } else {
                None
            };
            if let Some(reference) = identity {
                pending.remove(&reference);
            }
        }

        self.objects_to_delete = Some(pending);
        Ok(())
    }

    /// Issue foreground deletions with UID preconditions. NotFound and
    /// Conflict mean the object is already gone or was replaced; both are
    /// success. The first other error wins, later ones are logged.
    async fn delete_objects(
        &self,
        objects: &BTreeMap<ObjectRef, DynamicObject>,
    ) -> Result<(), Error> {
        let namespace = self.namespace()?;
        let mut first_err: Option<Error> = None;

        for (reference, object) in objects {
            if object.metadata.deletion_timestamp.is_some() {
                debug!(kind = %reference.kind, name = %reference.name, "object is marked for deletion already");
                continue;
            }
            let Some(uid) = object.uid() else {
                warn!(kind = %reference.kind, name = %reference.name, "object has no uid, skipping");
                continue;
            };

            info!(kind = %reference.kind, name = %reference.name, "deleting object");
            let client = match self.ctx.smart_client.for_gvk(&reference.gvk(), &namespace).await {
                Ok(client) => client,
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    } else {
                        error!(kind = %reference.kind, error = %err, "failed to get client for object");
                    }
                    continue;
                }
            };
            if let Err(err) = client.delete(&reference.name, &uid).await {
                if err.is_not_found() || err.is_conflict() {
                    continue;
                }
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(kind = %reference.kind, name = %reference.name, error = %err, "failed to delete object");
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Status aggregation and the single bundle write
    // =========================================================================

    async fn finish(&mut self, result: Result<(), Error>) -> Result<(), Error> {
        // A conflict on a managed object stops the walk but the status is
        // still written; only a conflict on the bundle's own write (below)
        // leaves the pass with nothing persisted.
        let mut pass_error = result.err();

        let now = Utc::now();
        let mut bundle_updated = false;
        let old_status = self.bundle.status.clone().unwrap_or_default();

        if let Some(finalizers) = self.new_finalizers.take() {
            self.bundle.metadata.finalizers = Some(finalizers);
            // One more pass will follow the finalizer write and compute the
            // real per-resource status.
            let mut conditions = Vec::with_capacity(3);
            for next in [
                Condition::of(condition_types::IN_PROGRESS, ConditionStatus::True),
                Condition::of(condition_types::READY, ConditionStatus::False),
                Condition::of(condition_types::ERROR, ConditionStatus::False),
            ] {
                let (merged, _) =
                    status::merge_condition(old_status.get_condition(&next.type_), next, now);
                conditions.push(merged);
            }
            self.bundle
                .status
                .get_or_insert_with(Default::default)
                .conditions = conditions;
            if let Err(err) = self.update_objects_to_delete_status().await {
                // The bundle is reprocessed anyway; log and continue.
                error!(error = %err, "error updating objectsToDelete status field");
            }
            bundle_updated = true;
        } else if self.bundle.metadata.deletion_timestamp.is_none() {
            let resources = self.bundle.spec.resources.clone();
            let mut resource_statuses = Vec::with_capacity(resources.len());
            let mut failed: Vec<ResourceName> = Vec::new();
            let mut all_retriable = true;

            for res in &resources {
                let fresh = status::resource_conditions(&self.processed, res);
                if fresh[3].status == ConditionStatus::True {
                    failed.push(res.name.clone());
                    // Must not retry if at least one error is terminal
                    all_retriable =
                        all_retriable && fresh[3].reason == condition_reasons::RETRIABLE_ERROR;
                }
                let old_resource = old_status.get_resource_status(&res.name);
                let mut conditions = Vec::with_capacity(4);
                for next in fresh {
                    let old_condition =
                        old_resource.and_then(|s| s.get_condition(&next.type_));
                    let (merged, changed) = status::merge_condition(old_condition, next, now);
                    bundle_updated |= changed;
                    conditions.push(merged);
                }
                resource_statuses.push(ResourceStatus {
                    name: res.name.clone(),
                    conditions,
                });
            }

            if pass_error.is_none() && !failed.is_empty() {
                pass_error = Some(Error::ResourceFailures {
                    resources: failed,
                    retriable: all_retriable,
                });
            }

            let mut in_progress =
                Condition::of(condition_types::IN_PROGRESS, ConditionStatus::False);
            let mut ready = Condition::of(condition_types::READY, ConditionStatus::False);
            let mut error_cond = Condition::of(condition_types::ERROR, ConditionStatus::False);
            match &pass_error {
                None => {
                    if self.is_bundle_ready() {
                        ready.status = ConditionStatus::True;
                    } else {
                        in_progress.status = ConditionStatus::True;
                    }
                }
                Some(err) => {
                    error_cond.status = ConditionStatus::True;
                    error_cond.message = err.to_string();
                    if err.is_retriable() {
                        error_cond.reason = condition_reasons::RETRIABLE_ERROR.to_string();
                        in_progress.status = ConditionStatus::True;
                    } else {
                        error_cond.reason = condition_reasons::TERMINAL_ERROR.to_string();
                    }
                }
            }
            let mut conditions = Vec::with_capacity(3);
            for next in [in_progress, ready, error_cond] {
                let (merged, changed) =
                    status::merge_condition(old_status.get_condition(&next.type_), next, now);
                bundle_updated |= changed;
                conditions.push(merged);
            }

            let plugin_statuses =
                status::plugin_statuses(&self.bundle.spec, self.ctx.plugins.as_ref());
            bundle_updated |= plugin_statuses != old_status.plugin_statuses;

            let bundle_status = self.bundle.status.get_or_insert_with(Default::default);
            bundle_status.conditions = conditions;
            bundle_status.resource_statuses = resource_statuses;
            bundle_status.plugin_statuses = plugin_statuses;

            match self.update_objects_to_delete_status().await {
                Ok(changed) => bundle_updated |= changed,
                Err(err) => {
                    error!(error = %err, "error updating objectsToDelete status field");
                }
            }
        }

        if bundle_updated {
            match self.ctx.bundle_client.update(&self.bundle).await {
                Ok(updated) => {
                    debug!("bundle updated");
                    self.bundle = updated;
                }
                Err(err) => {
                    // The write failure becomes the pass error so the bundle
                    // is re-enqueued and the status retried.
                    let err = if err.is_retriable() {
                        err
                    } else {
                        Error::internal("bundle-sync", format!("failed to update bundle: {err}"))
                    };
                    if pass_error.is_none() {
                        pass_error = Some(err);
                    } else {
                        error!(error = %err, "failed to update bundle");
                    }
                }
            }
        }

        match pass_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Refresh `status.objectsToDelete`, sorted by (group, version, kind,
    /// name) so map iteration order never leaks into the status.
    async fn update_objects_to_delete_status(&mut self) -> Result<bool, Error> {
        if self.objects_to_delete.is_none() {
            self.find_objects_to_delete().await?;
        }
        let pending = self
            .objects_to_delete
            .as_ref()
            .expect("just computed above");
        let mut list: Vec<ObjectToDelete> = pending.keys().map(ObjectRef::to_status).collect();
        list.sort();

        let bundle_status = self.bundle.status.get_or_insert_with(Default::default);
        if bundle_status.objects_to_delete != list {
            bundle_status.objects_to_delete = list;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn is_bundle_ready(&self) -> bool {
        self.bundle
            .spec
            .resources
            .iter()
            .all(|res| self.processed.get(&res.name).is_some_and(ResourceInfo::is_ready))
    }

    fn namespace(&self) -> Result<String, Error> {
        self.bundle
            .namespace()
            .ok_or_else(|| Error::internal("bundle-sync", "bundle has no namespace"))
    }

    fn uid(&self) -> Result<String, Error> {
        self.bundle
            .uid()
            .ok_or_else(|| Error::internal("bundle-sync", "bundle has no uid"))
    }
}
