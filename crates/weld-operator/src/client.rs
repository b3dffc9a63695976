//! Typed client seams over the Kubernetes API
//!
//! The reconciliation core talks to the cluster through three narrow traits:
//! `SmartClient` resolves a group/version/kind to a REST client for one
//! namespace, `ObjectClient` mutates objects of that kind, and
//! `BundleClient` writes the Bundle itself. The traits exist so tests can
//! mock the cluster; the `Kube*` implementations are the real thing.

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams, Preconditions, PropagationPolicy};
use kube::core::{ApiResource, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use weld_common::crd::Bundle;
use weld_common::{Error, CONTROLLER_NAME};

/// Client for objects of one group/version/kind in one namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// Create the object
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace the object; the object's resourceVersion is the precondition
    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Delete by name with a UID precondition and foreground propagation
    async fn delete(&self, name: &str, uid: &str) -> Result<(), Error>;
}

/// Resolves a group/version/kind plus namespace to an [`ObjectClient`]
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SmartClient: Send + Sync {
    /// Build a client for the given kind in the given namespace
    async fn for_gvk(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Box<dyn ObjectClient>, Error>;
}

/// Writes the Bundle resource itself
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BundleClient: Send + Sync {
    /// Update the bundle (finalizers and status together, one write per pass)
    async fn update(&self, bundle: &Bundle) -> Result<Bundle, Error>;
}

// =============================================================================
// Kubernetes-backed implementations
// =============================================================================

/// Resolve a GVK to an [`ApiResource`] via API discovery, with a cache.
///
/// When discovery itself is unreachable the ApiResource is constructed from
/// the GVK with conventional pluralization, so a flaky discovery endpoint
/// degrades to a guess instead of an outage. A kind discovery positively
/// does not know stays an error.
pub(crate) async fn resolve_api_resource(
    client: &Client,
    cache: &DashMap<String, ApiResource>,
    gvk: &GroupVersionKind,
) -> Result<ApiResource, Error> {
    let key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
    if let Some(ar) = cache.get(&key) {
        return Ok(ar.value().clone());
    }
    let ar = match kube::discovery::pinned_kind(client, gvk).await {
        Ok((ar, _caps)) => ar,
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            return Err(Error::unknown_kind(format!(
                "{}/{}, Kind={}",
                gvk.group, gvk.version, gvk.kind
            )));
        }
        Err(e) => {
            warn!(
                group = %gvk.group,
                kind = %gvk.kind,
                error = %e,
                "API discovery failed, falling back to conventional plural"
            );
            ApiResource::from_gvk_with_plural(gvk, &pluralize(&gvk.kind))
        }
    };
    cache.insert(key, ar.clone());
    Ok(ar)
}

/// Simple pluralization for Kubernetes resource kinds
pub(crate) fn pluralize(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') {
        format!("{}es", lower)
    } else if lower.ends_with('y') {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// [`SmartClient`] backed by a kube client and API discovery
pub struct KubeSmartClient {
    client: Client,
    resources: DashMap<String, ApiResource>,
}

impl KubeSmartClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resources: DashMap::new(),
        }
    }
}

#[async_trait]
impl SmartClient for KubeSmartClient {
    async fn for_gvk(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Box<dyn ObjectClient>, Error> {
        let ar = resolve_api_resource(&self.client, &self.resources, gvk).await?;
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        Ok(Box::new(KubeObjectClient { api }))
    }
}

struct KubeObjectClient {
    api: Api<DynamicObject>,
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let created = self.api.create(&post_params(), object).await?;
        debug!(name = %created.name_any(), "created object");
        Ok(created)
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let name = object.name_any();
        let updated = self.api.replace(&name, &post_params(), object).await?;
        debug!(name = %name, "updated object");
        Ok(updated)
    }

    async fn delete(&self, name: &str, uid: &str) -> Result<(), Error> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            preconditions: Some(Preconditions {
                uid: Some(uid.to_string()),
                resource_version: None,
            }),
            ..Default::default()
        };
        let _ = self.api.delete(name, &params).await?;
        Ok(())
    }
}

/// [`BundleClient`] backed by a kube client
pub struct KubeBundleClient {
    client: Client,
}

impl KubeBundleClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BundleClient for KubeBundleClient {
    async fn update(&self, bundle: &Bundle) -> Result<Bundle, Error> {
        let namespace = bundle
            .namespace()
            .ok_or_else(|| Error::internal("bundle-client", "bundle has no namespace"))?;
        let api: Api<Bundle> = Api::namespaced(self.client.clone(), &namespace);
        let name = bundle.name_any();
        let updated = api.replace(&name, &post_params(), bundle).await?;
        debug!(bundle = %name, "updated bundle");
        Ok(updated)
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(CONTROLLER_NAME.to_string()),
        ..Default::default()
    }
}
