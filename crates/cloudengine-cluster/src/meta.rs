//! Meta cluster bootstrap
//!
//! The meta cluster stands for the platform's own compute. It is created at
//! startup from the addresses of the platform's nodes and never heartbeats.

use std::collections::BTreeMap;

use cloudengine_common::config::MetaClusterConfig;
use cloudengine_common::crd::{Cluster, ClusterSpec};
use cloudengine_common::kube_utils::{node_addresses, NodeAddresses};
use cloudengine_common::store::ObjectApi;
use cloudengine_common::{
    Result, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CLOUDENGINE, META_CLUSTER_LABEL,
};
use k8s_openapi::api::core::v1::Node;
use kube::api::ObjectMeta;
use tracing::info;

/// Build the meta Cluster object for the given node addresses
pub fn build_meta_cluster(addresses: &NodeAddresses, config: &MetaClusterConfig) -> Cluster {
    Cluster {
        metadata: ObjectMeta {
            name: Some(config.name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(BTreeMap::from([
                (META_CLUSTER_LABEL.to_string(), "true".to_string()),
                (
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_CLOUDENGINE.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: ClusterSpec {
            cluster_timeout_seconds: config.timeout.as_secs(),
            publish_ips: addresses.public.clone(),
            private_ips: addresses.private.clone(),
            enable_private_ip: true,
        },
        status: None,
    }
}

/// Create the meta cluster unless it already exists
///
/// Returns `true` if a Cluster was created.
pub async fn ensure_meta_cluster(
    clusters: &dyn ObjectApi<Cluster>,
    nodes: &dyn ObjectApi<Node>,
    config: &MetaClusterConfig,
) -> Result<bool> {
    if clusters
        .get_opt(Some(&config.namespace), &config.name)
        .await?
        .is_some()
    {
        info!(name = %config.name, "meta cluster already registered");
        return Ok(false);
    }

    let addresses = node_addresses(&nodes.list(None, None).await?);
    let meta = build_meta_cluster(&addresses, config);
    match clusters.create(&meta).await {
        Ok(_) => {
            info!(
                name = %config.name,
                public = addresses.public.len(),
                private = addresses.private.len(),
                "meta cluster registered"
            );
            Ok(true)
        }
        // Lost a race with another replica.
        Err(cloudengine_common::Error::AlreadyExists { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}
