//! cloudengine operator - remote cluster health and hosted experiments

use std::sync::Arc;

use clap::Parser;
use cloudengine_common::kube_utils::create_client;
use cloudengine_common::lifecycle::LifecycleBus;
use cloudengine_common::store::KubeApi;
use cloudengine_common::telemetry::init_tracing;
use k8s_openapi::api::core::v1::PersistentVolume;

use cloudengine_operator::cli::{Cli, Commands};
use cloudengine_operator::controller_runner::{
    build_cluster_controllers, build_deletion_watchers, build_experiment_controllers,
    build_heartbeat_server,
};
use cloudengine_operator::lifecycle_listener;
use cloudengine_operator::startup::{crd_manifests, ensure_crds_installed, register_meta_cluster};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_manifests()?);
        return Ok(());
    }

    init_tracing(cli.log_json)?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(cli.settings.operator_config()?);
    tracing::info!(?config, "starting cloudengine controller");

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;
    register_meta_cluster(&client, &config.meta_cluster).await?;

    let lifecycle = LifecycleBus::default();
    tokio::spawn(lifecycle_listener::run(
        lifecycle.subscribe(),
        Arc::new(KubeApi::<PersistentVolume>::cluster(client.clone())),
    ));

    tracing::info!("Starting controllers:");
    let mut controllers = Vec::new();
    controllers.extend(build_cluster_controllers(
        client.clone(),
        config.clone(),
        lifecycle.clone(),
    ));
    controllers.extend(build_experiment_controllers(
        client.clone(),
        config.clone(),
        lifecycle.clone(),
    ));
    let watchers = build_deletion_watchers(client.clone(), lifecycle);
    let heartbeat = build_heartbeat_server(client, &config);

    // Controllers stop on SIGTERM/SIGINT; watchers and the heartbeat server
    // only stop on error.
    tokio::select! {
        _ = futures::future::join_all(controllers) => {
            tracing::info!("Controllers completed");
        }
        _ = futures::future::join_all(watchers) => {
            tracing::warn!("Deletion watchers stopped");
        }
        _ = heartbeat => {
            tracing::warn!("Heartbeat server stopped");
        }
    }

    tracing::info!("cloudengine controller shutting down");
    Ok(())
}
