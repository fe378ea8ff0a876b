//! Kubernetes helpers shared by the controllers and the operator binary

use std::path::Path;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from an optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// True if the pod reports a `Ready=True` condition
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Addresses advertised by a set of nodes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeAddresses {
    /// `ExternalIP` addresses
    pub public: Vec<String>,
    /// `InternalIP` addresses
    pub private: Vec<String>,
}

/// Collect external and internal IPs of `nodes`, without duplicates
pub fn node_addresses(nodes: &[Node]) -> NodeAddresses {
    let mut out = NodeAddresses::default();
    let addresses = nodes
        .iter()
        .filter_map(|n| n.status.as_ref())
        .filter_map(|s| s.addresses.as_ref())
        .flatten();
    for address in addresses {
        let bucket = match address.type_.as_str() {
            "ExternalIP" => &mut out.public,
            "InternalIP" => &mut out.private,
            _ => continue,
        };
        if !bucket.contains(&address.address) {
            bucket.push(address.address.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress, NodeStatus, PodCondition, PodStatus};

    fn pod_with_ready(status: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: status.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn node(addresses: &[(&str, &str)]) -> Node {
        Node {
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(t, a)| NodeAddress {
                            type_: t.to_string(),
                            address: a.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_pod_readiness() {
        assert!(is_pod_ready(&pod_with_ready("True")));
        assert!(!is_pod_ready(&pod_with_ready("False")));
        assert!(!is_pod_ready(&Pod::default()));
    }

    #[test]
    fn story_node_addresses_split_public_and_private() {
        let nodes = vec![
            node(&[("ExternalIP", "1.2.3.4"), ("InternalIP", "10.0.0.1"), ("Hostname", "n1")]),
            node(&[("InternalIP", "10.0.0.2"), ("InternalIP", "10.0.0.1")]),
        ];
        let addresses = node_addresses(&nodes);
        assert_eq!(addresses.public, vec!["1.2.3.4"]);
        assert_eq!(addresses.private, vec!["10.0.0.1", "10.0.0.2"]);
    }
}
