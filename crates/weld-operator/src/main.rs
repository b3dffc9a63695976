//! Weld operator - declarative bundles of Kubernetes objects

use std::sync::Arc;

use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use weld_common::crd::Bundle;
use weld_operator::controller::Context;
use weld_operator::controller_runner;
use weld_operator::plugin::PluginRegistry;

/// Weld - reconciles Bundle resources into live cluster objects
#[derive(Parser, Debug)]
#[command(name = "weld", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bundle controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        print!("{}", serde_yaml::to_string(&Bundle::crd())?);
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = Client::try_default().await?;

    // Plugins are compiled in and registered here; the registry is immutable
    // once the controller starts.
    let plugins = Arc::new(PluginRegistry::new());
    let ctx = Arc::new(Context::from_client(client.clone(), plugins));

    controller_runner::run_controller(client, ctx).await;
    Ok(())
}
