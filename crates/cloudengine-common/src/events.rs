//! Kubernetes Event recording for cloudengine controllers.
//!
//! Events accumulated during a reconcile pass are published through the
//! [`EventPublisher`] trait so they show up in `kubectl describe`.
//!
//! Publishing is **fire-and-forget**: failures are logged as warnings and
//! never propagate. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Severity of a status event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSeverity {
    /// Informational
    Normal,
    /// Something needs attention
    Warning,
}

impl From<EventSeverity> for EventType {
    fn from(value: EventSeverity) -> Self {
        match value {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        }
    }
}

/// An event recorded during a pass, waiting to be published
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEvent {
    /// Normal or Warning
    pub severity: EventSeverity,
    /// Machine-readable reason (see [`reasons`])
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

impl PendingEvent {
    /// Create a pending event
    pub fn new(
        severity: EventSeverity,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Trait for publishing Kubernetes Events.
///
/// Implementations log failures instead of returning them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `severity` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Created")
    /// * `action` - What action was taken (e.g. "Reconcile")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publish every pending event against `resource_ref`
pub async fn publish_all(
    publisher: &dyn EventPublisher,
    resource_ref: &ObjectReference,
    events: &[PendingEvent],
) {
    for event in events {
        publisher
            .publish(
                resource_ref,
                event.severity,
                &event.reason,
                actions::RECONCILE,
                Some(event.message.clone()),
            )
            .await;
    }
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "cloudengine-cluster-controller").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        severity: EventSeverity,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_: severity.into(),
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for contexts that do not record events.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _severity: EventSeverity,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Resource observed for the first time
    pub const CREATED: &str = "Created";
    /// Resource deleted
    pub const DELETED: &str = "Deleted";
    /// Health degraded (lost heartbeat, pod not ready)
    pub const UNHEALTHY: &str = "Unhealthy";
    /// Something the controller did not expect (missing dependency)
    pub const UNEXPECTED: &str = "Unexpected";
    /// Spec contains a non-fatal problem
    pub const VALIDATION: &str = "Validation";
    /// Lifecycle phase changed at the user's request
    pub const STATE_CHANGE: &str = "StateChange";
    /// Ingress external IPs resolved from the cluster
    pub const DISCOVER_EXTERNAL_IP: &str = "DiscoverExternalIp";
    /// Ingress service does not expose exactly one port
    pub const NO_INGRESS_PORT_FOUND: &str = "NoIngressPortFound";
    /// Template protocol has no credential block
    pub const NO_INGRESS_CONFIG: &str = "NoIngressConfig";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}
