//! Meta cluster registration

use cloudengine_cluster::ensure_meta_cluster;
use cloudengine_common::config::MetaClusterConfig;
use cloudengine_common::crd::Cluster;
use cloudengine_common::store::KubeApi;
use k8s_openapi::api::core::v1::Node;
use kube::Client;

/// Register the cluster the operator runs in, if enabled
pub async fn register_meta_cluster(client: &Client, config: &MetaClusterConfig) -> anyhow::Result<()> {
    if !config.enabled {
        tracing::info!("meta cluster disabled");
        return Ok(());
    }
    let clusters = KubeApi::<Cluster>::namespaced(client.clone());
    let nodes = KubeApi::<Node>::cluster(client.clone());
    ensure_meta_cluster(&clusters, &nodes, config)
        .await
        .map_err(|e| anyhow::anyhow!("failed to register meta cluster {}: {}", config.name, e))?;
    Ok(())
}
