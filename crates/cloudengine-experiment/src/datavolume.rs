//! Data volume reconciliation
//!
//! Every Experiment gets a host-path PersistentVolume statically bound to a
//! claim in the Experiment's namespace. Volumes are never recreated; only a
//! changed host path is written back.

use std::collections::BTreeMap;

use cloudengine_common::config::DataVolumeConfig;
use cloudengine_common::crd::Experiment;
use cloudengine_common::events::{reasons, EventSeverity};
use cloudengine_common::reconciler::{reconcile_resource, ResourceAction, ResourceConfig};
use cloudengine_common::results::{ReconcileResults, Requeue};
use cloudengine_common::status::StatusAccumulator;
use cloudengine_common::store::{DeletePreconditions, ObjectApi};
use cloudengine_common::{
    Result, LABEL_EXPERIMENT_NAME, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CLOUDENGINE,
};
use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::info;

use crate::controller::Context;
use crate::resources::{data_claim_name, data_volume_name, dependent_labels, ResourceState};

const ACCESS_MODE: &str = "ReadWriteOnce";

/// Expected PersistentVolume for `experiment`
pub fn build_volume(experiment: &Experiment, config: &DataVolumeConfig) -> Result<PersistentVolume> {
    let name = data_volume_name(experiment)?;
    let uid = experiment.uid().unwrap_or_default();
    Ok(PersistentVolume {
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(dependent_labels(experiment)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            capacity: Some(BTreeMap::from([(
                "storage".to_string(),
                Quantity(config.capacity.clone()),
            )])),
            access_modes: Some(vec![ACCESS_MODE.to_string()]),
            persistent_volume_reclaim_policy: Some("Retain".to_string()),
            storage_class_name: Some(String::new()),
            host_path: Some(HostPathVolumeSource {
                path: format!("{}/{}", config.host_path.trim_end_matches('/'), uid),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("PersistentVolumeClaim".to_string()),
                namespace: experiment.namespace(),
                name: Some(data_claim_name(experiment)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Expected PersistentVolumeClaim for `experiment`
pub fn build_claim(experiment: &Experiment, config: &DataVolumeConfig) -> Result<PersistentVolumeClaim> {
    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(data_claim_name(experiment)),
            namespace: experiment.namespace(),
            labels: Some(dependent_labels(experiment)),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![ACCESS_MODE.to_string()]),
            storage_class_name: Some(String::new()),
            volume_name: Some(data_volume_name(experiment)?),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(config.capacity.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn host_path(volume: &PersistentVolume) -> Option<&HostPathVolumeSource> {
    volume.spec.as_ref().and_then(|s| s.host_path.as_ref())
}

/// Reconcile the volume and its claim, recording them in `state`
pub async fn reconcile(
    ctx: &Context,
    acc: &mut StatusAccumulator<Experiment>,
    state: &mut ResourceState,
) -> ReconcileResults {
    let mut results = ReconcileResults::new();
    let experiment = acc.object().clone();
    let config = &ctx.config.data_volume;

    match build_volume(&experiment, config) {
        Ok(volume) => {
            let name = volume.name_any();
            let (outcome, object) = reconcile_resource(
                ctx.stores.volumes.as_ref(),
                ResourceConfig::new(volume)
                    .owned_by(&experiment)
                    .need_update(|expected, actual| host_path(expected) != host_path(actual))
                    .pre_update(|persisted, actual| {
                        let source = persisted.spec.as_ref().and_then(|s| s.host_path.clone());
                        let mut merged = actual.clone();
                        if let Some(spec) = merged.spec.as_mut() {
                            spec.host_path = source;
                        }
                        *persisted = merged;
                        Ok(())
                    }),
            )
            .await
            .into_parts();
            if matches!(outcome, Ok(ResourceAction::Created)) {
                acc.add_event(
                    EventSeverity::Normal,
                    reasons::CREATED,
                    format!("create data volume {name}"),
                );
            }
            state.volume = object;
            results.with("data-volume", outcome.map(|_| Requeue::None));
        }
        Err(e) => {
            results.with_error("data-volume", e);
        }
    }

    match build_claim(&experiment, config) {
        Ok(claim) => {
            let (outcome, object) = reconcile_resource(
                ctx.stores.claims.as_ref(),
                ResourceConfig::new(claim).owned_by(&experiment),
            )
            .await
            .into_parts();
            state.claim = object;
            results.with("data-volume-claim", outcome.map(|_| Requeue::None));
        }
        Err(e) => {
            results.with_error("data-volume-claim", e);
        }
    }

    results
}

/// Delete the data volumes left behind by a deleted Experiment.
///
/// Volumes are cluster-scoped and retained, so garbage collection through
/// the claim does not remove them. Returns the number of volumes deleted.
pub async fn release_volumes(
    volumes: &dyn ObjectApi<PersistentVolume>,
    namespace: &str,
    experiment_name: &str,
) -> Result<usize> {
    let selector = format!("{LABEL_EXPERIMENT_NAME}={experiment_name}");
    let mut released = 0;
    for volume in volumes.list(None, Some(&selector)).await? {
        let bound_here = volume
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| r.namespace.as_deref())
            == Some(namespace);
        if !bound_here {
            continue;
        }
        let name = volume.name_any();
        match volumes
            .delete(None, &name, Some(DeletePreconditions::same_object(&volume)))
            .await
        {
            Ok(()) => {
                info!(volume = %name, experiment = %experiment_name, "data volume released");
                released += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(released)
}

/// Delete data volumes whose Experiment no longer exists.
///
/// Covers deletions a watch missed, e.g. while it was re-listing or the
/// operator was down. Returns the number of volumes deleted.
pub async fn release_orphaned_volumes(
    volumes: &dyn ObjectApi<PersistentVolume>,
    experiments: &dyn ObjectApi<Experiment>,
) -> Result<usize> {
    let selector = format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_CLOUDENGINE}");
    let mut released = 0;
    for volume in volumes.list(None, Some(&selector)).await? {
        let Some(experiment_name) = volume.labels().get(LABEL_EXPERIMENT_NAME).cloned() else {
            continue;
        };
        let Some(namespace) = volume
            .spec
            .as_ref()
            .and_then(|s| s.claim_ref.as_ref())
            .and_then(|r| r.namespace.clone())
        else {
            continue;
        };
        if experiments
            .get_opt(Some(&namespace), &experiment_name)
            .await?
            .is_some()
        {
            continue;
        }
        let name = volume.name_any();
        match volumes
            .delete(None, &name, Some(DeletePreconditions::same_object(&volume)))
            .await
        {
            Ok(()) => {
                info!(volume = %name, experiment = %experiment_name, %namespace, "orphaned data volume released");
                released += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(released)
}
