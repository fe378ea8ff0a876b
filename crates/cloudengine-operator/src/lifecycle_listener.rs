//! Reacts to lifecycle notifications published by the controllers

use std::sync::Arc;

use cloudengine_common::lifecycle::LifecycleEvent;
use cloudengine_common::store::ObjectApi;
use cloudengine_experiment::datavolume::release_volumes;
use k8s_openapi::api::core::v1::PersistentVolume;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;

/// Consume notifications until the bus closes
pub async fn run(
    mut notifications: Receiver<LifecycleEvent>,
    volumes: Arc<dyn ObjectApi<PersistentVolume>>,
) {
    loop {
        match notifications.recv().await {
            Ok(event) => {
                if let Err(e) = handle(&event, volumes.as_ref()).await {
                    tracing::warn!(error = %e, ?event, "lifecycle handler failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "lifecycle listener fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!("lifecycle listener stopped");
}

/// Handle one notification
pub async fn handle(
    event: &LifecycleEvent,
    volumes: &dyn ObjectApi<PersistentVolume>,
) -> cloudengine_common::Result<()> {
    match event {
        LifecycleEvent::ClusterDeleted {
            namespace,
            name,
            cluster_id,
        } => {
            tracing::info!(%namespace, %name, cluster_id = ?cluster_id, "cluster deleted");
        }
        LifecycleEvent::ExperimentDeleted { namespace, name } => {
            tracing::info!(%namespace, %name, "experiment deleted");
            let released = release_volumes(volumes, namespace, name).await?;
            if released > 0 {
                tracing::info!(%namespace, %name, released, "released data volumes");
            }
        }
    }
    Ok(())
}
