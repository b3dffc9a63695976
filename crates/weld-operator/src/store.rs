//! Observed-object store
//!
//! Resource sync reads live objects through the [`Store`] trait; bundle sync
//! additionally asks it for every object controlled by a bundle when
//! computing the deletion sweep. The API-backed implementation keeps a
//! registry of group/version/kinds it has been asked about, and the
//! controlled-object scan lists exactly those kinds. Bundle sync registers
//! every GVK named by the spec and by a previous pass's `objectsToDelete`
//! status before scanning.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DynamicObject, ListParams, TypeMeta};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

use weld_common::Error;

use crate::client::resolve_api_resource;

/// Read access to observed cluster state
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a kind for the controlled-object scan
    fn track(&self, gvk: &GroupVersionKind);

    /// Get one live object, `None` when it does not exist
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Every tracked object in `namespace` whose controller owner reference
    /// carries `bundle_uid`
    async fn objects_controlled_by(
        &self,
        namespace: &str,
        bundle_uid: &str,
    ) -> Result<Vec<DynamicObject>, Error>;
}

/// Whether the object names `bundle_uid` as its controller owner
pub fn is_controlled_by(object: &DynamicObject, bundle_uid: &str) -> bool {
    object
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == bundle_uid)
}

/// [`Store`] that reads through to the API server
pub struct ApiStore {
    client: Client,
    tracked: DashMap<String, GroupVersionKind>,
    resources: DashMap<String, ApiResource>,
}

impl ApiStore {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            tracked: DashMap::new(),
            resources: DashMap::new(),
        }
    }

    async fn api_for(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<(Api<DynamicObject>, ApiResource), Error> {
        let ar = resolve_api_resource(&self.client, &self.resources, gvk).await?;
        let api = Api::namespaced_with(self.client.clone(), namespace, &ar);
        Ok((api, ar))
    }
}

#[async_trait]
impl Store for ApiStore {
    fn track(&self, gvk: &GroupVersionKind) {
        let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        self.tracked.entry(key).or_insert_with(|| gvk.clone());
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>, Error> {
        let (api, ar) = self.api_for(gvk, namespace).await?;
        let mut object = api.get_opt(name).await?;
        if let Some(obj) = object.as_mut() {
            stamp_types(obj, &ar);
        }
        Ok(object)
    }

    async fn objects_controlled_by(
        &self,
        namespace: &str,
        bundle_uid: &str,
    ) -> Result<Vec<DynamicObject>, Error> {
        let tracked: Vec<GroupVersionKind> =
            self.tracked.iter().map(|e| e.value().clone()).collect();
        let mut controlled = Vec::new();
        for gvk in tracked {
            let (api, ar) = match self.api_for(&gvk, namespace).await {
                Ok(pair) => pair,
                Err(err) if !err.is_retriable() => {
                    // A tracked kind whose CRD was uninstalled cannot have
                    // surviving objects; skip it.
                    warn!(kind = %gvk.kind, error = %err, "skipping unresolvable tracked kind");
                    continue;
                }
                Err(err) => return Err(err),
            };
            let list = api.list(&ListParams::default()).await?;
            for mut object in list.items {
                // List items come back without type information
                stamp_types(&mut object, &ar);
                if is_controlled_by(&object, bundle_uid) {
                    controlled.push(object);
                }
            }
        }
        Ok(controlled)
    }
}

fn stamp_types(object: &mut DynamicObject, ar: &ApiResource) {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: ar.api_version.clone(),
            kind: ar.kind.clone(),
        });
    }
}
