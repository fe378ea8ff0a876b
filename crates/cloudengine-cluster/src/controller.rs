//! Cluster controller implementation
//!
//! Each pass stamps the assigned cluster ID onto the object's annotations,
//! runs the [`ClusterDriver`] over a working copy of the status, publishes the
//! events it raised and writes the status back only when it changed.

use std::sync::Arc;

use chrono::Utc;
use cloudengine_common::crd::Cluster;
use cloudengine_common::events::{
    publish_all, reasons, EventPublisher, EventSeverity, KubeEventPublisher, NoopEventPublisher,
};
use cloudengine_common::lifecycle::{LifecycleBus, LifecycleEvent};
use cloudengine_common::store::{persist_status, KubeApi, ManagedObject, ObjectApi};
use cloudengine_common::status::StatusAccumulator;
use cloudengine_common::{Error, OperatorConfig, CLUSTER_ID_ANNOTATION};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument};

use crate::driver::ClusterDriver;

/// Name reported on Events emitted by this controller
pub const CONTROLLER_NAME: &str = "cloudengine-cluster-controller";

/// Controller context shared by every reconcile pass
pub struct Context {
    /// Cluster store
    pub clusters: Arc<dyn ObjectApi<Cluster>>,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Deletion notifications
    pub lifecycle: LifecycleBus,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
}

impl Context {
    /// Create a builder around a cluster store
    pub fn builder(clusters: Arc<dyn ObjectApi<Cluster>>) -> ContextBuilder {
        ContextBuilder::new(clusters)
    }

    /// Context backed by the API server
    pub fn from_client(client: Client, config: Arc<OperatorConfig>, lifecycle: LifecycleBus) -> Self {
        Self::builder(Arc::new(KubeApi::<Cluster>::namespaced(client.clone())))
            .events(Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)))
            .lifecycle(lifecycle)
            .config(config)
            .build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    clusters: Arc<dyn ObjectApi<Cluster>>,
    events: Option<Arc<dyn EventPublisher>>,
    lifecycle: Option<LifecycleBus>,
    config: Option<Arc<OperatorConfig>>,
}

impl ContextBuilder {
    fn new(clusters: Arc<dyn ObjectApi<Cluster>>) -> Self {
        Self {
            clusters,
            events: None,
            lifecycle: None,
            config: None,
        }
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Override the lifecycle bus
    pub fn lifecycle(mut self, lifecycle: LifecycleBus) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Override the operator configuration
    pub fn config(mut self, config: Arc<OperatorConfig>) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the context, filling unset parts with defaults
    pub fn build(self) -> Context {
        Context {
            clusters: self.clusters,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            lifecycle: self.lifecycle.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }
}

/// Reconcile a Cluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    if cluster.metadata.deletion_timestamp.is_some() {
        info!("cluster is being deleted");
        ctx.lifecycle.publish(LifecycleEvent::ClusterDeleted {
            namespace: cluster.namespace().unwrap_or_default(),
            name: cluster.name_any(),
            cluster_id: cluster.cluster_id().map(str::to_string),
        });
        return Ok(Action::await_change());
    }

    let observed = stamp_cluster_id(&cluster, ctx.clusters.as_ref()).await?;

    let mut acc = StatusAccumulator::new(&observed);
    for warning in observed.spec.warnings() {
        acc.add_event(EventSeverity::Warning, reasons::VALIDATION, warning);
    }

    let driver = ClusterDriver::new(ctx.config.clone());
    let mut results = driver.reconcile(&mut acc, Utc::now());

    let change = acc.apply();
    publish_all(
        ctx.events.as_ref(),
        &observed.event_reference(),
        &change.events,
    )
    .await;

    if let Some(updated) = change.persist {
        let phase = updated
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default();
        match persist_status(ctx.clusters.as_ref(), &updated).await {
            Ok(_) => debug!(%phase, "cluster status updated"),
            Err(e) => {
                results.with_error("persist-status", e);
            }
        }
    }

    results.aggregate(ctx.config.requeue_soon)
}

/// Copy the assigned cluster ID into the object's annotations.
///
/// Returns the object to continue the pass with: the written copy when the
/// annotation changed, otherwise the observed one.
async fn stamp_cluster_id(cluster: &Cluster, api: &dyn ObjectApi<Cluster>) -> Result<Cluster, Error> {
    let Some(id) = cluster.cluster_id() else {
        return Ok(cluster.clone());
    };
    if cluster.annotations().get(CLUSTER_ID_ANNOTATION).map(String::as_str) == Some(id) {
        return Ok(cluster.clone());
    }
    let mut annotated = cluster.clone();
    annotated
        .annotations_mut()
        .insert(CLUSTER_ID_ANNOTATION.to_string(), id.to_string());
    let written = api.replace(&annotated).await?;
    debug!(cluster_id = %id, "cluster ID annotation stamped");
    Ok(written)
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use cloudengine_common::crd::{
        ClusterConditionType, ClusterPhase, ClusterSpec, ClusterStatus, ConditionStatus,
    };
    use cloudengine_common::memory::{MemoryApi, RecordingEventPublisher};
    use std::time::Duration;

    struct Harness {
        clusters: Arc<MemoryApi<Cluster>>,
        events: Arc<RecordingEventPublisher>,
        lifecycle: LifecycleBus,
        ctx: Arc<Context>,
    }

    fn harness() -> Harness {
        let clusters = MemoryApi::<Cluster>::shared();
        let events = Arc::new(RecordingEventPublisher::new());
        let lifecycle = LifecycleBus::default();
        let ctx = Arc::new(
            Context::builder(clusters.clone())
                .events(events.clone())
                .lifecycle(lifecycle.clone())
                .build(),
        );
        Harness {
            clusters,
            events,
            lifecycle,
            ctx,
        }
    }

    fn edge(ips: &[&str]) -> Cluster {
        let mut cluster = Cluster::new(
            "edge-1",
            ClusterSpec {
                publish_ips: ips.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster
    }

    fn stored(h: &Harness) -> Cluster {
        h.clusters
            .stored(Some("default"), "edge-1")
            .expect("cluster stored")
    }

    /// Story: a new cluster gets an ID, an annotation and a Created event
    #[tokio::test]
    async fn story_new_cluster_is_initialized_and_annotated() {
        let h = harness();
        h.clusters.insert(edge(&["1.2.3.4"]));

        let action = reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("first pass");
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));

        let after_first = stored(&h);
        let status = after_first.status.clone().expect("status written");
        assert_eq!(status.phase, ClusterPhase::Created);
        let id = status.cluster_id.clone().expect("id assigned");
        assert_eq!(h.events.reasons(), vec![reasons::CREATED.to_string()]);

        // Second pass stamps the annotation and writes no status.
        let writes = h.clusters.counts().status_writes;
        let action = reconcile(Arc::new(after_first), h.ctx.clone())
            .await
            .expect("second pass");
        assert_eq!(action, Action::await_change());
        let after_second = stored(&h);
        assert_eq!(
            after_second.annotations().get(CLUSTER_ID_ANNOTATION),
            Some(&id)
        );
        assert_eq!(h.clusters.counts().status_writes, writes);
    }

    #[tokio::test]
    async fn story_unchanged_status_is_not_rewritten() {
        let h = harness();
        h.clusters.insert(edge(&["1.2.3.4"]));
        reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("init");
        reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("annotate");

        let before = h.clusters.counts();
        reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("steady state");
        assert_eq!(h.clusters.counts().total(), before.total());
    }

    /// Story: the meta cluster writes its status once, then only rechecks
    #[tokio::test]
    async fn story_meta_cluster_status_settles_after_first_pass() {
        let h = harness();
        let mut meta = edge(&["1.2.3.4"]);
        meta.labels_mut().insert(
            cloudengine_common::META_CLUSTER_LABEL.to_string(),
            "true".to_string(),
        );
        h.clusters.insert(meta);

        let mut actions = Vec::new();
        for _ in 0..4 {
            actions.push(
                reconcile(Arc::new(stored(&h)), h.ctx.clone())
                    .await
                    .expect("pass"),
            );
        }
        assert_eq!(h.clusters.counts().status_writes, 1);
        assert!(actions
            .iter()
            .all(|a| *a == Action::requeue(Duration::from_secs(60))));
        assert_eq!(stored(&h).status.expect("status").phase, ClusterPhase::Ready);
    }

    /// Story: a connected cluster whose heartbeat goes stale is marked Lost
    #[tokio::test]
    async fn story_stale_heartbeat_marks_cluster_lost() {
        let h = harness();
        let mut cluster = edge(&["1.2.3.4"]);
        let probe = Utc::now() - ChronoDuration::seconds(120);
        let mut status = ClusterStatus {
            phase: ClusterPhase::Ready,
            cluster_id: Some("id-1".into()),
            ..Default::default()
        };
        for type_ in ClusterConditionType::ALL {
            status
                .conditions
                .set(type_, ConditionStatus::True, "", "", probe);
        }
        cluster.status = Some(status);
        cluster
            .annotations_mut()
            .insert(CLUSTER_ID_ANNOTATION.to_string(), "id-1".to_string());
        h.clusters.insert(cluster);

        let action = reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("pass");
        assert_eq!(action, Action::await_change());
        let status = stored(&h).status.expect("status");
        assert_eq!(status.phase, ClusterPhase::Lost);
        assert_eq!(h.events.reasons(), vec![reasons::UNHEALTHY.to_string()]);
    }

    #[tokio::test]
    async fn story_spec_warnings_are_published() {
        let h = harness();
        h.clusters.insert(edge(&[]));
        reconcile(Arc::new(stored(&h)), h.ctx.clone())
            .await
            .expect("pass");
        let emitted = h.events.reasons();
        assert_eq!(emitted.first().map(String::as_str), Some(reasons::VALIDATION));
        assert!(emitted.contains(&reasons::CREATED.to_string()));
    }

    #[tokio::test]
    async fn story_deleted_cluster_notifies_subscribers() {
        let h = harness();
        let mut rx = h.lifecycle.subscribe();
        let mut cluster = edge(&["1.2.3.4"]);
        cluster.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );
        cluster.status = Some(ClusterStatus {
            cluster_id: Some("id-9".into()),
            ..Default::default()
        });
        let cluster = h.clusters.insert(cluster);

        let action = reconcile(Arc::new(cluster), h.ctx.clone())
            .await
            .expect("pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(
            rx.try_recv().expect("notification"),
            LifecycleEvent::ClusterDeleted {
                namespace: "default".into(),
                name: "edge-1".into(),
                cluster_id: Some("id-9".into()),
            }
        );
        assert_eq!(h.clusters.counts().total(), 0);
    }

    #[tokio::test]
    async fn test_missing_cluster_surfaces_error() {
        let h = harness();
        let mut cluster = edge(&["1.2.3.4"]);
        cluster.status = Some(ClusterStatus {
            cluster_id: Some("id-1".into()),
            ..Default::default()
        });
        // Never stored: the annotation write fails.
        let result = reconcile(Arc::new(cluster), h.ctx.clone()).await;
        assert!(matches!(result, Err(e) if e.is_not_found()));
    }

    #[test]
    fn test_error_policy_uses_configured_backoff() {
        let h = harness();
        let action = error_policy(
            Arc::new(edge(&[])),
            &Error::internal("boom"),
            h.ctx.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
