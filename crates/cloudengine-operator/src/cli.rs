//! Command line interface
//!
//! Every setting can also be given through the environment, which is how
//! the in-cluster Deployment configures the operator.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use cloudengine_common::config::{
    DataVolumeConfig, MetaClusterConfig, DEFAULT_DATA_HOST_PATH, DEFAULT_META_CLUSTER_NAME,
};
use cloudengine_common::OperatorConfig;

/// cloudengine - operator for remote clusters and hosted experiments
#[derive(Parser, Debug)]
#[command(name = "cloudengine", version, about, long_about = None)]
pub struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "CLOUDENGINE_LOG_JSON")]
    pub log_json: bool,

    /// Path to a kubeconfig; in-cluster config is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub settings: Settings,

    #[command(subcommand)]
    #[allow(missing_docs)]
    pub command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Run the Cluster and Experiment controllers (default mode)
    Controller,
}

/// Controller settings
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// Heartbeat timeout in seconds for Clusters that set none
    #[arg(long, env = "CLOUDENGINE_HEARTBEAT_TIMEOUT", default_value_t = 30)]
    pub heartbeat_timeout_secs: u64,

    /// Heartbeat interval in seconds advertised to cluster agents
    #[arg(long, env = "CLOUDENGINE_HEARTBEAT_INTERVAL", default_value_t = 10)]
    pub heartbeat_interval_secs: u64,

    /// Delay in seconds before a pass that asked to be retried soon
    #[arg(long, env = "CLOUDENGINE_REQUEUE_SOON", default_value_t = 1)]
    pub requeue_soon_secs: u64,

    /// Delay in seconds before a failed pass is retried
    #[arg(long, env = "CLOUDENGINE_ERROR_BACKOFF", default_value_t = 5)]
    pub error_backoff_secs: u64,

    /// Do not register the cluster the operator runs in
    #[arg(long, env = "CLOUDENGINE_DISABLE_META_CLUSTER")]
    pub disable_meta_cluster: bool,

    /// Name of the meta cluster
    #[arg(long, env = "CLOUDENGINE_META_CLUSTER_NAME", default_value = DEFAULT_META_CLUSTER_NAME)]
    pub meta_cluster_name: String,

    /// Namespace of the meta cluster
    #[arg(long, env = "CLOUDENGINE_META_CLUSTER_NAMESPACE", default_value = "default")]
    pub meta_cluster_namespace: String,

    /// Heartbeat timeout in seconds of the meta cluster
    #[arg(long, env = "CLOUDENGINE_META_CLUSTER_TIMEOUT", default_value_t = 60)]
    pub meta_cluster_timeout_secs: u64,

    /// Listen address of the heartbeat endpoint
    #[arg(long, env = "CLOUDENGINE_HEARTBEAT_ADDR", default_value = "0.0.0.0:8081")]
    pub heartbeat_addr: SocketAddr,

    /// Host directory backing experiment data volumes
    #[arg(long, env = "CLOUDENGINE_DATA_HOST_PATH", default_value = DEFAULT_DATA_HOST_PATH)]
    pub data_host_path: String,

    /// Capacity requested for each data volume
    #[arg(long, env = "CLOUDENGINE_DATA_CAPACITY", default_value = "10Gi")]
    pub data_capacity: String,

    /// Mount path of the data volume inside experiment containers
    #[arg(long, env = "CLOUDENGINE_DATA_MOUNT_PATH", default_value = "/data")]
    pub data_mount_path: String,
}

impl Settings {
    /// Build and validate the operator configuration
    pub fn operator_config(&self) -> cloudengine_common::Result<OperatorConfig> {
        let config = OperatorConfig {
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            requeue_soon: Duration::from_secs(self.requeue_soon_secs),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            meta_cluster: MetaClusterConfig {
                enabled: !self.disable_meta_cluster,
                name: self.meta_cluster_name.clone(),
                namespace: self.meta_cluster_namespace.clone(),
                timeout: Duration::from_secs(self.meta_cluster_timeout_secs),
            },
            heartbeat_addr: self.heartbeat_addr,
            data_volume: DataVolumeConfig {
                host_path: self.data_host_path.clone(),
                capacity: self.data_capacity.clone(),
                mount_path: self.data_mount_path.clone(),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
