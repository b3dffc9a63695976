//! Controller runner - starts the bundle controller and runs it to shutdown

use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing::{debug, error, info};

use weld_common::crd::Bundle;

use crate::controller::{error_policy, reconcile, Context};

/// Run the bundle controller until shutdown
pub async fn run_controller(client: Client, ctx: Arc<Context>) {
    let bundles: Api<Bundle> = Api::all(client);

    info!("starting bundle controller");
    Controller::new(bundles, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => debug!(?action, "bundle reconciliation completed"),
                Err(e) => error!(error = ?e, "bundle reconciliation error"),
            }
        })
        .await;
    info!("bundle controller stopped");
}
