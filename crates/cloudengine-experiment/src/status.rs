//! Connection status derived from the reconciled dependents

use chrono::{DateTime, Utc};
use cloudengine_common::crd::{
    ConditionStatus, Experiment, ExperimentConditionType, IngressProtocol,
};
use cloudengine_common::events::{reasons, EventSeverity};
use cloudengine_common::status::StatusAccumulator;

use crate::resources::ResourceState;

/// Copy ingress and credential details into the working status and derive
/// the `VolumeCreated` and `Ready` conditions.
pub fn update_connection_status(
    acc: &mut StatusAccumulator<Experiment>,
    state: &ResourceState,
    now: DateTime<Utc>,
) {
    let node_port_spec = state
        .ingress
        .as_ref()
        .and_then(|svc| svc.spec.as_ref())
        .filter(|spec| spec.type_.as_deref() == Some("NodePort"));
    if let Some(spec) = node_port_spec {
        acc.status.ingress_ips = spec.external_ips.clone().unwrap_or_default();
        let ports = spec.ports.as_deref().unwrap_or_default();
        if ports.len() == 1 {
            acc.status.ingress_port = ports[0].node_port;
        } else {
            acc.add_event(
                EventSeverity::Warning,
                reasons::NO_INGRESS_PORT_FOUND,
                format!("got ingress port: {}", ports.len()),
            );
        }
    }

    let spec = &state.template.spec;
    acc.status.protocol = Some(spec.protocol_name());
    match spec.protocol() {
        Some(IngressProtocol::Vnc) => acc.status.vnc = spec.vnc.clone(),
        Some(IngressProtocol::Ssh) => acc.status.ssh = spec.ssh.clone(),
        None => acc.add_event(
            EventSeverity::Warning,
            reasons::NO_INGRESS_CONFIG,
            format!("ingress protocol {} not supported", spec.ingress_protocol),
        ),
    }

    acc.status.cluster = acc.object().spec.cluster_name.clone();
    acc.status.cluster_sync = false;

    let volume_ready = state.volume.is_some() && state.claim.is_some();
    if volume_ready {
        acc.status.conditions.ensure(
            ExperimentConditionType::VolumeCreated,
            ConditionStatus::True,
            "",
            "",
            now,
        );
    } else {
        acc.status.conditions.ensure(
            ExperimentConditionType::VolumeCreated,
            ConditionStatus::False,
            "VolumeMissing",
            "data volume or claim does not exist",
            now,
        );
    }

    let ready = volume_ready
        && acc
            .status
            .conditions
            .is_true(ExperimentConditionType::PodReady);
    if ready {
        acc.status.conditions.ensure(
            ExperimentConditionType::Ready,
            ConditionStatus::True,
            "",
            "",
            now,
        );
    } else {
        acc.status.conditions.ensure(
            ExperimentConditionType::Ready,
            ConditionStatus::False,
            "NotReady",
            "",
            now,
        );
    }
}
