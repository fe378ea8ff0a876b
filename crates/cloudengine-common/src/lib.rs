//! Common types for cloudengine: CRDs, the condition model and the
//! reconciliation primitives shared by the cluster and experiment controllers

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod lifecycle;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
pub mod reconciler;
pub mod results;
pub mod status;
pub mod store;
pub mod telemetry;

pub use config::OperatorConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "cloudengine-operator";

/// Label marking the implicit meta cluster
pub const META_CLUSTER_LABEL: &str = "cloudengine.io/meta-cluster";

/// Annotation carrying a Cluster's assigned ID
pub const CLUSTER_ID_ANNOTATION: &str = "cloudengine.io/cluster-id";

/// Label carrying the owning Experiment's name on dependent resources
pub const LABEL_EXPERIMENT_NAME: &str = "cloudengine.io/experiment-name";

/// Label carrying the bound Cluster's name on dependent resources
pub const LABEL_CLUSTER_NAME: &str = "cloudengine.io/cluster-name";

/// Label identifying the component that manages a resource
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on resources created by this operator
pub const LABEL_MANAGED_BY_CLOUDENGINE: &str = "cloudengine";
