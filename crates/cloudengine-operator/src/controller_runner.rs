//! Controller runner - builds the long-running futures of the operator
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller. This keeps controller construction pure and testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use cloudengine_cluster::heartbeat::{serve, HeartbeatIngest};
use cloudengine_common::crd::{Cluster, Experiment};
use cloudengine_common::lifecycle::{LifecycleBus, LifecycleEvent};
use cloudengine_common::store::{KubeApi, ObjectApi};
use cloudengine_common::OperatorConfig;
use cloudengine_experiment::datavolume::release_orphaned_volumes;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};

/// Boxed long-running future
pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build cluster controller futures
pub fn build_cluster_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
    lifecycle: LifecycleBus,
) -> Vec<Task> {
    let ctx = Arc::new(cloudengine_cluster::Context::from_client(
        client.clone(),
        config,
        lifecycle,
    ));
    let clusters: Api<Cluster> = Api::all(client);

    tracing::info!("- Cluster controller");

    vec![Box::pin(
        Controller::new(clusters, watcher_config())
            .shutdown_on_signal()
            .run(
                cloudengine_cluster::reconcile,
                cloudengine_cluster::error_policy,
                ctx,
            )
            .for_each(log_reconcile_result("Cluster")),
    )]
}

/// Build experiment controller futures
///
/// Experiments are reconciled again when an owned pod, claim or Service
/// changes, and when the Cluster they are bound to changes.
pub fn build_experiment_controllers(
    client: Client,
    config: Arc<OperatorConfig>,
    lifecycle: LifecycleBus,
) -> Vec<Task> {
    let ctx = Arc::new(cloudengine_experiment::Context::from_client(
        client.clone(),
        config,
        lifecycle,
    ));
    let experiments: Api<Experiment> = Api::all(client.clone());

    tracing::info!("- Experiment controller");

    let controller = Controller::new(experiments, watcher_config());
    let store = controller.store();
    let ctrl = controller
        .owns(Api::<Pod>::all(client.clone()), watcher_config())
        .owns(Api::<PersistentVolumeClaim>::all(client.clone()), watcher_config())
        .owns(Api::<Service>::all(client.clone()), watcher_config())
        .watches(Api::<Cluster>::all(client), watcher_config(), move |cluster| {
            let namespace = cluster.namespace();
            let name = cluster.name_any();
            store
                .state()
                .into_iter()
                .filter(|exp| exp.namespace() == namespace && exp.spec.cluster_name == name)
                .map(|exp| ObjectRef::from_obj(exp.as_ref()))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(
            cloudengine_experiment::reconcile,
            cloudengine_experiment::error_policy,
            ctx,
        )
        .for_each(log_reconcile_result("Experiment"));

    vec![Box::pin(ctrl)]
}

/// Build watchers that turn object removal into lifecycle notifications
///
/// Objects without finalizers vanish before a reconcile pass can see their
/// deletion timestamp, so removal is observed on the watch stream. A deletion
/// that happens while the watch re-lists produces no `Delete` event; every
/// completed Experiment list therefore sweeps data volumes left without an
/// Experiment. Missed Cluster deletions are not reported.
pub fn build_deletion_watchers(client: Client, lifecycle: LifecycleBus) -> Vec<Task> {
    let clusters: Api<Cluster> = Api::all(client.clone());
    let experiments: Api<Experiment> = Api::all(client.clone());
    let experiment_store: Arc<dyn ObjectApi<Experiment>> =
        Arc::new(KubeApi::<Experiment>::namespaced(client.clone()));
    let volume_store: Arc<dyn ObjectApi<PersistentVolume>> =
        Arc::new(KubeApi::<PersistentVolume>::cluster(client));

    let bus = lifecycle.clone();
    let cluster_watch = watcher::watcher(clusters, watcher_config())
        .default_backoff()
        .for_each(move |event| {
            match event {
                Ok(watcher::Event::Delete(cluster)) => bus.publish(cluster_deleted(&cluster)),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Cluster deletion watch error"),
            }
            std::future::ready(())
        });

    let experiment_watch = watcher::watcher(experiments, watcher_config())
        .default_backoff()
        .for_each(move |event| {
            match event {
                Ok(watcher::Event::Delete(experiment)) => {
                    lifecycle.publish(experiment_deleted(&experiment))
                }
                Ok(watcher::Event::InitDone) => {
                    tokio::spawn(sweep_orphaned_volumes(
                        volume_store.clone(),
                        experiment_store.clone(),
                    ));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Experiment deletion watch error"),
            }
            std::future::ready(())
        });

    vec![Box::pin(cluster_watch), Box::pin(experiment_watch)]
}

/// Build the heartbeat endpoint future
pub fn build_heartbeat_server(client: Client, config: &OperatorConfig) -> Task {
    let ingest = Arc::new(HeartbeatIngest::new(Arc::new(
        KubeApi::<Cluster>::namespaced(client),
    )));
    let addr = config.heartbeat_addr;
    Box::pin(async move {
        if let Err(e) = serve(addr, ingest).await {
            tracing::error!(error = %e, %addr, "heartbeat server failed");
        }
    })
}

async fn sweep_orphaned_volumes(
    volumes: Arc<dyn ObjectApi<PersistentVolume>>,
    experiments: Arc<dyn ObjectApi<Experiment>>,
) {
    match release_orphaned_volumes(volumes.as_ref(), experiments.as_ref()).await {
        Ok(0) => {}
        Ok(released) => tracing::info!(released, "released orphaned data volumes"),
        Err(e) => tracing::warn!(error = %e, "orphaned data volume sweep failed"),
    }
}

fn cluster_deleted(cluster: &Cluster) -> LifecycleEvent {
    LifecycleEvent::ClusterDeleted {
        namespace: cluster.namespace().unwrap_or_default(),
        name: cluster.name_any(),
        cluster_id: cluster.cluster_id().map(str::to_string),
    }
}

fn experiment_deleted(experiment: &Experiment) -> LifecycleEvent {
    LifecycleEvent::ExperimentDeleted {
        namespace: experiment.namespace().unwrap_or_default(),
        name: experiment.name_any(),
    }
}

/// Create a closure that logs reconciliation results for a named controller.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
