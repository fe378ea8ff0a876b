//! Cluster Custom Resource Definition
//!
//! A Cluster is a registered compute target whose health is tracked through
//! periodic heartbeats from an agent running on it. The meta cluster, marked
//! with [`crate::META_CLUSTER_LABEL`], stands for the platform's own compute.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Conditions;

/// Condition types recorded on a Cluster
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ClusterConditionType {
    /// The controller has observed the cluster and assigned an ID
    Init,
    /// The first heartbeat has arrived
    FirstConnect,
    /// Heartbeats are arriving within the timeout
    Heartbeat,
    /// Resources reported by the agent are in sync
    ResourceSync,
    /// The last command sent to the agent applied cleanly
    CommandApply,
}

impl ClusterConditionType {
    /// Every cluster condition type, in ledger order
    pub const ALL: [ClusterConditionType; 5] = [
        Self::Init,
        Self::FirstConnect,
        Self::Heartbeat,
        Self::ResourceSync,
        Self::CommandApply,
    ];
}

/// Cluster lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Not yet observed by the controller
    #[default]
    Unknown,
    /// Initialized, waiting for the first heartbeat
    Created,
    /// Heartbeats are current and all conditions are healthy
    Ready,
    /// Heartbeats stopped arriving
    Lost,
    /// Heartbeats arrive but resource sync or command apply is failing
    OutOfControl,
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Created => write!(f, "Created"),
            Self::Ready => write!(f, "Ready"),
            Self::Lost => write!(f, "Lost"),
            Self::OutOfControl => write!(f, "OutOfControl"),
        }
    }
}

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudengine.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    shortname = "cec",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"ClusterID","type":"string","jsonPath":".status.clusterId"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Heartbeat timeout override in seconds. Zero means the operator default.
    #[serde(default)]
    pub cluster_timeout_seconds: u64,

    /// Public IPs advertised by the cluster
    #[serde(default, rename = "publishIPs")]
    pub publish_ips: Vec<String>,

    /// Private IPs advertised by the cluster
    #[serde(default, rename = "privateIPs")]
    pub private_ips: Vec<String>,

    /// Allow private IPs to be used for ingress when no public IP exists
    #[serde(default, rename = "enablePrivateIP")]
    pub enable_private_ip: bool,
}

impl ClusterSpec {
    /// Timeout override, if one is configured
    pub fn timeout_override(&self) -> Option<std::time::Duration> {
        (self.cluster_timeout_seconds > 0)
            .then(|| std::time::Duration::from_secs(self.cluster_timeout_seconds))
    }

    /// IPs to expose on ingress services bound to this cluster
    ///
    /// Public IPs win; private IPs are used only when enabled and no public
    /// IP is advertised.
    pub fn ingress_ips(&self) -> Vec<String> {
        if self.publish_ips.is_empty() && self.enable_private_ip {
            self.private_ips.clone()
        } else {
            self.publish_ips.clone()
        }
    }

    /// Non-fatal findings about this spec
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.enable_private_ip && self.private_ips.is_empty() {
            warnings.push("enablePrivateIP is set but no privateIPs are listed".to_string());
        }
        if self.ingress_ips().is_empty() {
            warnings.push("cluster advertises no reachable IPs; ingress will have none".to_string());
        }
        warnings
    }
}

/// Status for a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Current lifecycle phase
    #[serde(default, rename = "status")]
    pub phase: ClusterPhase,

    /// Opaque identifier assigned once at first initialization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,

    /// Condition ledger
    #[serde(default)]
    pub conditions: Conditions<ClusterConditionType>,
}

impl Cluster {
    /// True if this is the implicit meta cluster
    pub fn is_meta(&self) -> bool {
        self.labels().contains_key(crate::META_CLUSTER_LABEL)
    }

    /// Assigned cluster ID, if any
    pub fn cluster_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.cluster_id.as_deref())
            .filter(|id| !id.is_empty())
    }
}
