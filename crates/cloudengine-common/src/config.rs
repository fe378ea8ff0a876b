//! Operator configuration
//!
//! Built once at startup and shared by reference with every controller.

use std::net::SocketAddr;
use std::time::Duration;

use crate::{Error, Result};

/// Default heartbeat timeout when a Cluster does not override it
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default heartbeat interval advertised to agents
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default name of the meta cluster
pub const DEFAULT_META_CLUSTER_NAME: &str = "meta-cluster";

/// Default host directory backing experiment data volumes
pub const DEFAULT_DATA_HOST_PATH: &str = "/opt/open-hackathon/cloud-engine/data";

/// Meta cluster settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaClusterConfig {
    /// Create the meta cluster at startup
    pub enabled: bool,
    /// Meta cluster name
    pub name: String,
    /// Meta cluster namespace
    pub namespace: String,
    /// Heartbeat timeout, also the meta cluster's re-check interval
    pub timeout: Duration,
}

impl Default for MetaClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: DEFAULT_META_CLUSTER_NAME.to_string(),
            namespace: "default".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Experiment data volume settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataVolumeConfig {
    /// Host directory under which per-experiment directories are created
    pub host_path: String,
    /// Requested capacity as a Kubernetes quantity
    pub capacity: String,
    /// Mount path inside the experiment container
    pub mount_path: String,
}

impl Default for DataVolumeConfig {
    fn default() -> Self {
        Self {
            host_path: DEFAULT_DATA_HOST_PATH.to_string(),
            capacity: "10Gi".to_string(),
            mount_path: "/data".to_string(),
        }
    }
}

/// Runtime configuration for the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Heartbeat timeout used when a Cluster sets none
    pub heartbeat_timeout: Duration,
    /// Heartbeat interval advertised to agents
    pub heartbeat_interval: Duration,
    /// Delay used for "requeue soon" requests
    pub requeue_soon: Duration,
    /// Delay before a failed pass is retried
    pub error_backoff: Duration,
    /// Meta cluster settings
    pub meta_cluster: MetaClusterConfig,
    /// Listen address of the heartbeat endpoint
    pub heartbeat_addr: SocketAddr,
    /// Data volume settings
    pub data_volume: DataVolumeConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            requeue_soon: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            meta_cluster: MetaClusterConfig::default(),
            heartbeat_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
            data_volume: DataVolumeConfig::default(),
        }
    }
}

impl OperatorConfig {
    /// Reject settings the controllers cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout.is_zero() {
            return Err(Error::configuration("config", "heartbeat timeout must be positive"));
        }
        if self.heartbeat_interval >= self.heartbeat_timeout {
            return Err(Error::configuration(
                "config",
                "heartbeat interval must be shorter than the heartbeat timeout",
            ));
        }
        if self.meta_cluster.enabled && self.meta_cluster.name.is_empty() {
            return Err(Error::configuration("config", "meta cluster name is empty"));
        }
        if !self.data_volume.mount_path.starts_with('/') {
            return Err(Error::configuration(
                "config",
                format!("mount path {} is not absolute", self.data_volume.mount_path),
            ));
        }
        Ok(())
    }
}
