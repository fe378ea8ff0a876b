//! Workload pod reconciliation

use chrono::Utc;
use cloudengine_common::config::DataVolumeConfig;
use cloudengine_common::crd::{
    ConditionStatus, Experiment, ExperimentConditionType, ExperimentPhase, Template,
};
use cloudengine_common::events::{reasons, EventSeverity};
use cloudengine_common::kube_utils::is_pod_ready;
use cloudengine_common::reconciler::{reconcile_resource, ResourceAction, ResourceConfig};
use cloudengine_common::results::{ReconcileResults, Requeue};
use cloudengine_common::status::StatusAccumulator;
use cloudengine_common::store::DeletePreconditions;
use cloudengine_common::{Error, Result};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::controller::Context;
use crate::resources::{data_claim_name, dependent_labels, ResourceState};

/// Name of the workload container
pub const CONTAINER_NAME: &str = "experiment";

/// Name of the data volume inside the pod
pub const DATA_VOLUME_NAME: &str = "data-volume";

/// Expected workload pod for `experiment`
pub fn build_pod(experiment: &Experiment, template: &Template, volume: &DataVolumeConfig) -> Result<Pod> {
    let pod_template = &template.spec.pod_template;
    if pod_template.image.is_empty() {
        return Err(Error::configuration(
            "experiment-pod",
            format!("template {} has no image", template.name_any()),
        ));
    }
    let env = pod_template
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(experiment.name_any()),
            namespace: experiment.namespace(),
            labels: Some(dependent_labels(experiment)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(pod_template.image.clone()),
                command: (!pod_template.command.is_empty()).then(|| pod_template.command.clone()),
                env: Some(env),
                volume_mounts: Some(vec![VolumeMount {
                    name: DATA_VOLUME_NAME.to_string(),
                    mount_path: volume.mount_path.clone(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: DATA_VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: data_claim_name(experiment),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Reconcile the workload pod and derive the phase from it
pub async fn reconcile(
    ctx: &Context,
    acc: &mut StatusAccumulator<Experiment>,
    state: &mut ResourceState,
) -> ReconcileResults {
    let mut results = ReconcileResults::new();
    let now = Utc::now();

    if acc.object().spec.pause {
        if acc.status.phase != ExperimentPhase::Stopped {
            info!("pausing experiment");
            acc.status.phase = ExperimentPhase::Stopped;
            acc.add_event(
                EventSeverity::Normal,
                reasons::STATE_CHANGE,
                "pause experiment",
            );
            acc.status.conditions.set(
                ExperimentConditionType::PodReady,
                ConditionStatus::False,
                "PauseExperiment",
                "",
                now,
            );
        }
        for pod in std::mem::take(&mut state.pods) {
            let name = pod.name_any();
            let deleted = ctx
                .stores
                .pods
                .delete(
                    pod.namespace().as_deref(),
                    &name,
                    Some(DeletePreconditions::same_object(&pod)),
                )
                .await;
            match deleted {
                Ok(()) => debug!(pod = %name, "workload pod deleted"),
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!(pod = %name, error = %e, "failed to delete workload pod");
                    results.with_error("delete-env-pod", e);
                }
            }
        }
        return results;
    }

    let Some(pod) = state.pods.first().cloned() else {
        let experiment = acc.object().clone();
        let expected = match build_pod(&experiment, &state.template, &ctx.config.data_volume) {
            Ok(pod) => pod,
            Err(e) => {
                results.with_error("build-env-pod", e);
                return results;
            }
        };
        let (outcome, object) = reconcile_resource(
            ctx.stores.pods.as_ref(),
            ResourceConfig::new(expected).owned_by(&experiment),
        )
        .await
        .into_parts();
        if matches!(outcome, Ok(ResourceAction::Created)) {
            acc.add_event(EventSeverity::Normal, reasons::CREATED, "create env pod");
        }
        state.pods = object.into_iter().collect();
        results.with("create-env-pod", outcome.map(|_| Requeue::None));
        return results;
    };

    debug!(pod = %pod.name_any(), phase = ?pod.status.as_ref().and_then(|s| s.phase.as_deref()), "found env pod");
    if is_pod_ready(&pod) {
        acc.status.phase = ExperimentPhase::Running;
        acc.status.conditions.ensure(
            ExperimentConditionType::PodReady,
            ConditionStatus::True,
            "",
            "",
            now,
        );
    } else {
        if acc.status.phase == ExperimentPhase::Running {
            acc.status.phase = ExperimentPhase::Error;
            acc.add_event(
                EventSeverity::Warning,
                reasons::UNHEALTHY,
                format!("pod {} not ready", pod.name_any()),
            );
        }
        acc.status.conditions.ensure(
            ExperimentConditionType::PodReady,
            ConditionStatus::False,
            "PodNotReady",
            "",
            now,
        );
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::{experiment, template, Harness};

    #[test]
    fn test_pod_mounts_claim_and_copies_template() {
        let pod = build_pod(&experiment(false), &template("vnc"), &DataVolumeConfig::default())
            .expect("pod");
        assert_eq!(pod.name_any(), "exp-1");
        let spec = pod.spec.expect("spec");
        let container = &spec.containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("cloudengine/desktop:1.0"));
        assert_eq!(container.command, Some(vec!["/start.sh".to_string()]));
        let env = container.env.clone().unwrap_or_default();
        assert_eq!(env[0].name, "LANG");
        let mount = &container.volume_mounts.clone().unwrap_or_default()[0];
        assert_eq!(mount.mount_path, "/data");
        let claim = spec.volumes.unwrap_or_default()[0]
            .persistent_volume_claim
            .clone()
            .expect("claim source");
        assert_eq!(claim.claim_name, "data-exp-1");
    }

    #[test]
    fn test_template_without_image_is_rejected() {
        let mut t = template("vnc");
        t.spec.pod_template.image.clear();
        let err = build_pod(&experiment(false), &t, &DataVolumeConfig::default())
            .expect_err("no image");
        assert!(matches!(err, Error::Configuration { .. }));
    }

    /// Story: a pod status update between resolve and delete does not
    /// block pausing
    #[tokio::test]
    async fn story_pause_deletes_pod_updated_since_resolve() {
        let h = Harness::seeded(false);
        h.pass().await.expect("first pass");
        h.set_pause(true);

        let exp = h.experiment();
        let mut acc = StatusAccumulator::new(&exp);
        let mut state = ResourceState::resolve(&h.ctx.stores, &exp)
            .await
            .expect("resolved");
        assert_eq!(state.pods.len(), 1);
        h.set_pods_ready(true);

        let results = reconcile(&h.ctx, &mut acc, &mut state).await;
        assert!(results.is_ok());
        assert!(h.pods().is_empty());
        assert_eq!(h.pods.counts().conflicts, 0);
        assert_eq!(acc.status.phase, ExperimentPhase::Stopped);
    }
}
