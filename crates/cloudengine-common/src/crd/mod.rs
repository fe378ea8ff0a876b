//! Custom Resource Definitions for cloudengine
//!
//! This module contains the Cluster, Experiment and Template CRDs and the
//! condition model they share.

mod cluster;
mod experiment;
mod template;
mod types;

pub use cluster::{Cluster, ClusterConditionType, ClusterPhase, ClusterSpec, ClusterStatus};
pub use experiment::{
    Experiment, ExperimentConditionType, ExperimentPhase, ExperimentSpec, ExperimentStatus,
};
pub use template::{IngressProtocol, PodTemplate, SshConfig, Template, TemplateSpec, VncConfig};
pub use types::{Condition, ConditionStatus, ConditionType, Conditions};

/// A resource whose status sub-object is reconciled by this operator
pub trait WithStatus: kube::Resource + Clone {
    /// The status type
    type Status: Clone + Default + PartialEq + std::fmt::Debug + Send + Sync;

    /// Borrow the status, if set
    fn status(&self) -> Option<&Self::Status>;

    /// Replace the status
    fn set_status(&mut self, status: Self::Status);
}

impl WithStatus for Cluster {
    type Status = ClusterStatus;

    fn status(&self) -> Option<&ClusterStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ClusterStatus) {
        self.status = Some(status);
    }
}

impl WithStatus for Experiment {
    type Status = ExperimentStatus;

    fn status(&self) -> Option<&ExperimentStatus> {
        self.status.as_ref()
    }

    fn set_status(&mut self, status: ExperimentStatus) {
        self.status = Some(status);
    }
}
