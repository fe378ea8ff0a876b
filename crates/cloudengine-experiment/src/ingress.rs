//! Ingress Service reconciliation
//!
//! The Service exposes the workload's ingress port as a NodePort and pins
//! the Cluster's reachable IPs as external IPs. An existing Service is
//! patched in place so the node port the API server allocated survives.

use cloudengine_common::crd::{Experiment, Template};
use cloudengine_common::events::{reasons, EventSeverity};
use cloudengine_common::reconciler::{reconcile_resource, ResourceAction, ResourceConfig};
use cloudengine_common::results::{ReconcileResults, Requeue};
use cloudengine_common::status::StatusAccumulator;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use tracing::debug;

use crate::controller::Context;
use crate::resources::{dependent_labels, ingress_service_name, workload_labels, ResourceState};

const SERVICE_TYPE: &str = "NodePort";
const PROTOCOL_TCP: &str = "TCP";

/// Expected ingress Service for `experiment`
pub fn build_service(experiment: &Experiment, template: &Template, external_ips: Vec<String>) -> Service {
    let protocol = template.spec.protocol_name();
    Service {
        metadata: ObjectMeta {
            name: Some(ingress_service_name(&experiment.name_any(), &protocol)),
            namespace: experiment.namespace(),
            labels: Some(dependent_labels(experiment)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(SERVICE_TYPE.to_string()),
            external_ips: Some(external_ips),
            ports: Some(vec![ServicePort {
                name: Some(protocol),
                protocol: Some(PROTOCOL_TCP.to_string()),
                port: template.spec.ingress_port,
                target_port: Some(IntOrString::Int(template.spec.ingress_port)),
                ..Default::default()
            }]),
            selector: Some(workload_labels(experiment)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn external_ips(svc: &Service) -> &[String] {
    svc.spec
        .as_ref()
        .and_then(|s| s.external_ips.as_deref())
        .unwrap_or_default()
}

fn service_type(svc: &Service) -> Option<&str> {
    svc.spec.as_ref().and_then(|s| s.type_.as_deref())
}

fn named_port<'s>(svc: &'s Service, name: &str) -> Option<&'s ServicePort> {
    svc.spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.name.as_deref() == Some(name)))
}

/// True if `actual` lacks the type, external IPs or port `expected` asks for
fn needs_patch(expected: &Service, actual: &Service) -> bool {
    if service_type(expected) != service_type(actual) || external_ips(expected) != external_ips(actual)
    {
        return true;
    }
    let Some(want) = expected
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.first())
    else {
        return false;
    };
    match named_port(actual, want.name.as_deref().unwrap_or_default()) {
        Some(have) => {
            have.port != want.port
                || have.target_port != want.target_port
                || have.protocol != want.protocol
        }
        // Ports under other names are left to whoever added them.
        None => false,
    }
}

/// Patch `actual` towards `expected`, keeping allocated node ports
fn patch_service(expected: &Service, actual: &Service) -> Service {
    let mut patched = actual.clone();
    let want = expected.spec.as_ref();
    let spec = patched.spec.get_or_insert_with(Default::default);
    spec.type_ = Some(SERVICE_TYPE.to_string());
    spec.external_ips = want.and_then(|s| s.external_ips.clone());
    if let Some(want_port) = want.and_then(|s| s.ports.as_ref()).and_then(|p| p.first()) {
        for port in spec.ports.iter_mut().flatten() {
            if port.name == want_port.name {
                port.protocol = want_port.protocol.clone();
                port.port = want_port.port;
                port.target_port = want_port.target_port.clone();
            }
        }
    }
    patched
}

/// Reconcile the ingress Service, recording it in `state`
pub async fn reconcile(
    ctx: &Context,
    acc: &mut StatusAccumulator<Experiment>,
    state: &mut ResourceState,
) -> ReconcileResults {
    let mut results = ReconcileResults::new();
    let experiment = acc.object().clone();
    let ips = state.cluster.spec.ingress_ips();
    if state.cluster.spec.publish_ips.is_empty() && !ips.is_empty() {
        debug!("cluster private ip enabled, using private ips as external ips");
    }

    let expected = build_service(&experiment, &state.template, ips.clone());
    let existed = state.ingress.is_some();
    let (outcome, object) = reconcile_resource(
        ctx.stores.services.as_ref(),
        ResourceConfig::new(expected)
            .owned_by(&experiment)
            .need_update(needs_patch)
            .pre_update(|persisted, actual| {
                *persisted = patch_service(persisted, actual);
                Ok(())
            }),
    )
    .await
    .into_parts();

    match &outcome {
        Ok(ResourceAction::Created) => {
            acc.add_event(
                EventSeverity::Normal,
                reasons::DISCOVER_EXTERNAL_IP,
                format!("use external ip: {}", ips.join(",")),
            );
            acc.add_event(
                EventSeverity::Normal,
                reasons::CREATED,
                "create ingress service",
            );
        }
        Err(e) if !existed => {
            acc.add_event(
                EventSeverity::Warning,
                reasons::CREATED,
                format!("create ingress service failed: {e}"),
            );
        }
        _ => {}
    }

    state.ingress = object;
    results.with("ingress-service", outcome.map(|_| Requeue::None));
    results
}
