//! Experiment Custom Resource Definition
//!
//! An Experiment is a workload bound to a Cluster. It is realized as a pod
//! with a data volume and an ingress Service, all owned by the Experiment.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::template::{SshConfig, VncConfig};
use super::types::Conditions;

/// Condition types recorded on an Experiment
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ExperimentConditionType {
    /// The controller has observed the experiment
    Initialized,
    /// The workload pod reports ready
    PodReady,
    /// The data volume and claim exist
    VolumeCreated,
    /// Pod is ready and the volume exists
    Ready,
}

/// Experiment lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExperimentPhase {
    /// Observed, workload not yet ready
    #[default]
    Created,
    /// Workload pod is ready
    Running,
    /// Paused by the user; no pod runs
    Stopped,
    /// Workload pod stopped being ready after running
    Error,
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Stopped => write!(f, "Stopped"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Specification for an Experiment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudengine.io",
    version = "v1",
    kind = "Experiment",
    plural = "experiments",
    shortname = "cee",
    status = "ExperimentStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Template","type":"string","jsonPath":".spec.template"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Stop the workload pod while keeping storage and ingress
    #[serde(default)]
    pub pause: bool,

    /// Name of the Template in the same namespace
    pub template: String,

    /// Name of the Cluster in the same namespace
    pub cluster_name: String,
}

/// Status for an Experiment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// Current lifecycle phase
    #[serde(default, rename = "status")]
    pub phase: ExperimentPhase,

    /// Name of the bound Cluster
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,

    /// Reserved: whether the experiment is mirrored on a remote cluster
    #[serde(default)]
    pub cluster_sync: bool,

    /// Condition ledger
    #[serde(default)]
    pub conditions: Conditions<ExperimentConditionType>,

    /// External IPs of the ingress Service
    #[serde(default, rename = "ingressIPs", skip_serializing_if = "Vec::is_empty")]
    pub ingress_ips: Vec<String>,

    /// Node port of the ingress Service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_port: Option<i32>,

    /// Ingress protocol copied from the Template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// VNC credentials copied from the Template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc: Option<VncConfig>,

    /// SSH credentials copied from the Template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
}
