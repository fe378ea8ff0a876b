//! Per-pass snapshot of everything an Experiment depends on

use std::collections::BTreeMap;

use cloudengine_common::crd::{Cluster, Experiment, Template};
use cloudengine_common::{
    Error, Result, LABEL_CLUSTER_NAME, LABEL_EXPERIMENT_NAME, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_CLOUDENGINE,
};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use tracing::debug;

use crate::controller::Stores;

/// Name of the Experiment's data PersistentVolume
///
/// Volumes are cluster-scoped, so the name is keyed by the Experiment's UID
/// rather than its namespaced name.
pub fn data_volume_name(experiment: &Experiment) -> Result<String> {
    match experiment.uid() {
        Some(uid) if !uid.is_empty() => Ok(format!("pv-{uid}")),
        _ => Err(Error::configuration(
            "data-volume",
            format!("experiment {} has no uid", experiment.name_any()),
        )),
    }
}

/// Name of the Experiment's data PersistentVolumeClaim
pub fn data_claim_name(experiment: &Experiment) -> String {
    format!("data-{}", experiment.name_any())
}

/// Name of the ingress Service for `protocol`
pub fn ingress_service_name(experiment_name: &str, protocol: &str) -> String {
    format!("{experiment_name}-{protocol}-service")
}

/// Label selector matching the Experiment's dependents
pub fn experiment_selector(experiment: &Experiment) -> String {
    format!("{}={}", LABEL_EXPERIMENT_NAME, experiment.name_any())
}

/// Labels selecting the Experiment's workload pod
pub fn workload_labels(experiment: &Experiment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            LABEL_CLUSTER_NAME.to_string(),
            experiment.spec.cluster_name.clone(),
        ),
        (LABEL_EXPERIMENT_NAME.to_string(), experiment.name_any()),
    ])
}

/// Labels stamped on every dependent the Experiment creates
pub fn dependent_labels(experiment: &Experiment) -> BTreeMap<String, String> {
    let mut labels = workload_labels(experiment);
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_CLOUDENGINE.to_string(),
    );
    labels
}

/// Objects observed for one Experiment during a single pass
///
/// Never persisted. Each reconcile step replaces the fields it owns with the
/// re-fetched objects so later steps see what is actually stored.
#[derive(Clone, Debug)]
pub struct ResourceState {
    /// Bound Cluster
    pub cluster: Cluster,
    /// Referenced Template
    pub template: Template,
    /// Pods carrying the experiment-name label
    pub pods: Vec<Pod>,
    /// Data volume, if it exists
    pub volume: Option<PersistentVolume>,
    /// Data volume claim, if it exists
    pub claim: Option<PersistentVolumeClaim>,
    /// Ingress Service, if it exists
    pub ingress: Option<Service>,
}

impl ResourceState {
    /// Fetch the Experiment's dependencies and dependents.
    ///
    /// A missing Cluster or Template fails with `DependencyMissing`; missing
    /// dependents are simply absent.
    pub async fn resolve(stores: &Stores, experiment: &Experiment) -> Result<Self> {
        let namespace = experiment.namespace();
        let ns = namespace.as_deref();

        let cluster = stores
            .clusters
            .get_opt(ns, &experiment.spec.cluster_name)
            .await?
            .ok_or_else(|| Error::dependency_missing("Cluster", &experiment.spec.cluster_name))?;
        let template = stores
            .templates
            .get_opt(ns, &experiment.spec.template)
            .await?
            .ok_or_else(|| Error::dependency_missing("Template", &experiment.spec.template))?;

        let volume = stores
            .volumes
            .get_opt(None, &data_volume_name(experiment)?)
            .await?;
        let claim = stores
            .claims
            .get_opt(ns, &data_claim_name(experiment))
            .await?;
        let service_name =
            ingress_service_name(&experiment.name_any(), &template.spec.protocol_name());
        let ingress = stores.services.get_opt(ns, &service_name).await?;
        let pods = stores
            .pods
            .list(ns, Some(&experiment_selector(experiment)))
            .await?;

        debug!(
            pods = pods.len(),
            volume = volume.is_some(),
            claim = claim.is_some(),
            ingress = ingress.is_some(),
            "experiment resources resolved"
        );

        Ok(Self {
            cluster,
            template,
            pods,
            volume,
            claim,
            ingress,
        })
    }
}
