//! Bundle controller entry points
//!
//! `reconcile` runs one full pass for one bundle. The controller harness
//! guarantees passes for the same bundle never overlap; within a pass the
//! code runs top to bottom and owns its working copy of the bundle.

mod bundle_sync;
mod resource_sync;
mod status;

pub use resource_sync::{ResourceInfo, ResourceOutcome};

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{error, info, instrument, warn};

use weld_common::crd::Bundle;
use weld_common::Error;

use crate::client::{BundleClient, KubeBundleClient, KubeSmartClient, SmartClient};
use crate::plugin::PluginRegistry;
use crate::ready::{DefaultReadyChecker, ReadyChecker};
use crate::store::{ApiStore, Store};

/// Shared controller state, cheap to clone behind Arcs
pub struct Context {
    /// Writes the bundle itself
    pub bundle_client: Arc<dyn BundleClient>,
    /// Resolves group/version/kinds to object clients
    pub smart_client: Arc<dyn SmartClient>,
    /// Observed cluster state
    pub store: Arc<dyn Store>,
    /// Readiness rules for live objects
    pub ready_checker: Arc<dyn ReadyChecker>,
    /// Registered plugins, immutable after startup
    pub plugins: Arc<PluginRegistry>,
}

impl Context {
    /// Assemble a context from explicit collaborators (tests use mocks here)
    pub fn new(
        bundle_client: Arc<dyn BundleClient>,
        smart_client: Arc<dyn SmartClient>,
        store: Arc<dyn Store>,
        ready_checker: Arc<dyn ReadyChecker>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            bundle_client,
            smart_client,
            store,
            ready_checker,
            plugins,
        }
    }

    /// Production context backed by a kube client
    pub fn from_client(client: Client, plugins: Arc<PluginRegistry>) -> Self {
        Self {
            bundle_client: Arc::new(KubeBundleClient::new(client.clone())),
            smart_client: Arc::new(KubeSmartClient::new(client.clone())),
            store: Arc::new(ApiStore::new(client)),
            ready_checker: Arc::new(DefaultReadyChecker),
            plugins,
        }
    }
}

/// Reconcile one bundle
///
/// Retriable failures propagate to [`error_policy`] for re-enqueue with
/// back-off. Terminal failures are already reflected in the bundle status,
/// so the controller waits for a spec change instead of spinning.
#[instrument(skip(bundle, ctx), fields(bundle = %bundle.name_any()))]
pub async fn reconcile(bundle: Arc<Bundle>, ctx: Arc<Context>) -> Result<Action, Error> {
    info!("reconciling bundle");
    let mut task = bundle_sync::BundleSyncTask::new(ctx.as_ref(), (*bundle).clone());
    match task.run().await {
        Ok(()) => Ok(Action::await_change()),
        Err(err) if err.is_retriable() => Err(err),
        Err(err) => {
            warn!(error = %err, "terminal error, awaiting spec change");
            Ok(Action::await_change())
        }
    }
}

/// Requeue strategy when reconciliation fails
pub fn error_policy(bundle: Arc<Bundle>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        bundle = %bundle.name_any(),
        retriable = error.is_retriable(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(15))
}
