//! Experiment controller implementation
//!
//! A pass resolves everything the experiment depends on, then reconciles
//! the data volume, the ingress Service and the workload pod in that order.
//! Each step feeds the freshly reconciled objects to the next through the
//! [`ResourceState`]. A failing step does not stop the later ones; its error
//! becomes the pass's error once status and events have been written.

use std::sync::Arc;

use chrono::Utc;
use cloudengine_common::crd::{
    Cluster, ConditionStatus, Experiment, ExperimentConditionType, ExperimentPhase, Template,
};
use cloudengine_common::events::{
    publish_all, reasons, EventPublisher, EventSeverity, KubeEventPublisher, NoopEventPublisher,
};
use cloudengine_common::lifecycle::{LifecycleBus, LifecycleEvent};
use cloudengine_common::results::ReconcileResults;
use cloudengine_common::status::StatusAccumulator;
use cloudengine_common::store::{persist_status, KubeApi, ManagedObject, ObjectApi};
use cloudengine_common::{Error, OperatorConfig};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod, Service};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::resources::ResourceState;
use crate::{datavolume, ingress, pod, status};

/// Name reported on Events emitted by this controller
pub const CONTROLLER_NAME: &str = "cloudengine-experiment-controller";

/// Store access for every kind an experiment touches
#[derive(Clone)]
pub struct Stores {
    /// Experiments
    pub experiments: Arc<dyn ObjectApi<Experiment>>,
    /// Templates (read-only)
    pub templates: Arc<dyn ObjectApi<Template>>,
    /// Clusters (read-only)
    pub clusters: Arc<dyn ObjectApi<Cluster>>,
    /// Workload pods
    pub pods: Arc<dyn ObjectApi<Pod>>,
    /// Cluster-scoped data volumes
    pub volumes: Arc<dyn ObjectApi<PersistentVolume>>,
    /// Data volume claims
    pub claims: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
    /// Ingress services
    pub services: Arc<dyn ObjectApi<Service>>,
}

impl Stores {
    /// Stores backed by the API server
    pub fn from_client(client: Client) -> Self {
        Self {
            experiments: Arc::new(KubeApi::<Experiment>::namespaced(client.clone())),
            templates: Arc::new(KubeApi::<Template>::namespaced(client.clone())),
            clusters: Arc::new(KubeApi::<Cluster>::namespaced(client.clone())),
            pods: Arc::new(KubeApi::<Pod>::namespaced(client.clone())),
            volumes: Arc::new(KubeApi::<PersistentVolume>::cluster(client.clone())),
            claims: Arc::new(KubeApi::<PersistentVolumeClaim>::namespaced(client.clone())),
            services: Arc::new(KubeApi::<Service>::namespaced(client)),
        }
    }
}

/// Controller context shared by every reconcile pass
pub struct Context {
    /// Store access
    pub stores: Stores,
    /// Event sink
    pub events: Arc<dyn EventPublisher>,
    /// Deletion notifications
    pub lifecycle: LifecycleBus,
    /// Operator configuration
    pub config: Arc<OperatorConfig>,
}

impl Context {
    /// Create a builder around the given stores
    pub fn builder(stores: Stores) -> ContextBuilder {
        ContextBuilder::new(stores)
    }

    /// Context backed by the API server
    pub fn from_client(client: Client, config: Arc<OperatorConfig>, lifecycle: LifecycleBus) -> Self {
        Self::builder(Stores::from_client(client.clone()))
            .events(Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)))
            .lifecycle(lifecycle)
            .config(config)
            .build()
    }
}

/// Builder for [`Context`]
pub struct ContextBuilder {
    stores: Stores,
    events: Option<Arc<dyn EventPublisher>>,
    lifecycle: Option<LifecycleBus>,
    config: Option<Arc<OperatorConfig>>,
}

impl ContextBuilder {
    fn new(stores: Stores) -> Self {
        Self {
            stores,
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
            stores: self.stores,
            events: self.events.unwrap_or_else(|| Arc::new(NoopEventPublisher)),
            lifecycle: self.lifecycle.unwrap_or_default(),
            config: self.config.unwrap_or_default(),
        }
    }
}

/// Reconcile an Experiment
#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
pub async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action, Error> {
    if experiment.metadata.deletion_timestamp.is_some() {
        info!("experiment is being deleted");
        ctx.lifecycle.publish(LifecycleEvent::ExperimentDeleted {
            namespace: experiment.namespace().unwrap_or_default(),
            name: experiment.name_any(),
        });
        return Ok(Action::await_change());
    }

    let mut acc = StatusAccumulator::new(experiment.as_ref());
    let results = run_pass(&ctx, &mut acc).await;
    finish_pass(&ctx, acc, results).await
}

async fn run_pass(ctx: &Context, acc: &mut StatusAccumulator<Experiment>) -> ReconcileResults {
    let mut results = ReconcileResults::new();
    let now = Utc::now();

    if !acc
        .status
        .conditions
        .is_true(ExperimentConditionType::Initialized)
    {
        info!("initializing experiment");
        acc.status.phase = ExperimentPhase::Created;
        acc.status.conditions.set(
            ExperimentConditionType::Initialized,
            ConditionStatus::True,
            "",
            "",
            now,
        );
        acc.add_event(EventSeverity::Normal, reasons::CREATED, "init experiment");
    }

    let mut state = match ResourceState::resolve(&ctx.stores, acc.object()).await {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "resolving experiment dependencies failed");
            acc.add_event(EventSeverity::Warning, reasons::UNEXPECTED, e.to_string());
            results.with_error("resolve", e);
            return results;
        }
    };

    results.with_result(datavolume::reconcile(ctx, acc, &mut state).await);
    results.with_result(ingress::reconcile(ctx, acc, &mut state).await);
    results.with_result(pod::reconcile(ctx, acc, &mut state).await);
    status::update_connection_status(acc, &state, now);

    results
}

async fn finish_pass(
    ctx: &Context,
    acc: StatusAccumulator<Experiment>,
    mut results: ReconcileResults,
) -> Result<Action, Error> {
    let resource_ref = acc.object().event_reference();
    let change = acc.apply();
    publish_all(ctx.events.as_ref(), &resource_ref, &change.events).await;

    if let Some(updated) = change.persist {
        let phase = updated
            .status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or_default();
        match persist_status(ctx.stores.experiments.as_ref(), &updated).await {
            Ok(_) => debug!(%phase, "experiment status updated"),
            Err(e) => {
                results.with_error("persist-status", e);
            }
        }
    }

    results.aggregate(ctx.config.requeue_soon)
}

/// Error policy for the controller
pub fn error_policy(experiment: Arc<Experiment>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        experiment = %experiment.name_any(),
        "reconciliation failed"
    );
    Action::requeue(ctx.config.error_backoff)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cloudengine_common::crd::{
        ClusterSpec, ExperimentSpec, ExperimentStatus, PodTemplate, TemplateSpec, VncConfig,
    };
    use cloudengine_common::kube_utils::is_pod_ready;
    use cloudengine_common::memory::{MemoryApi, RecordingEventPublisher};
    use cloudengine_common::LABEL_EXPERIMENT_NAME;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus, ServicePort};
    use std::collections::BTreeMap;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub experiments: Arc<MemoryApi<Experiment>>,
        pub templates: Arc<MemoryApi<Template>>,
        pub clusters: Arc<MemoryApi<Cluster>>,
        pub pods: Arc<MemoryApi<Pod>>,
        pub volumes: Arc<MemoryApi<PersistentVolume>>,
        pub claims: Arc<MemoryApi<PersistentVolumeClaim>>,
        pub services: Arc<MemoryApi<Service>>,
        pub events: Arc<RecordingEventPublisher>,
        pub lifecycle: LifecycleBus,
        pub ctx: Arc<Context>,
    }

    impl Harness {
        pub(crate) fn new() -> Self {
            let experiments = MemoryApi::<Experiment>::shared();
            let templates = MemoryApi::<Template>::shared();
            let clusters = MemoryApi::<Cluster>::shared();
            let pods = MemoryApi::<Pod>::shared();
            let volumes = MemoryApi::<PersistentVolume>::shared();
            let claims = MemoryApi::<PersistentVolumeClaim>::shared();
            let services = MemoryApi::<Service>::shared();
            let events = Arc::new(RecordingEventPublisher::new());
            let lifecycle = LifecycleBus::default();
            let stores = Stores {
                experiments: experiments.clone(),
                templates: templates.clone(),
                clusters: clusters.clone(),
                pods: pods.clone(),
                volumes: volumes.clone(),
                claims: claims.clone(),
                services: services.clone(),
            };
            let ctx = Arc::new(
                Context::builder(stores)
                    .events(events.clone())
                    .lifecycle(lifecycle.clone())
                    .build(),
            );
            Self {
                experiments,
                templates,
                clusters,
                pods,
                volumes,
                claims,
                services,
                events,
                lifecycle,
                ctx,
            }
        }

        /// Seed a Cluster, a VNC Template and an Experiment
        pub(crate) fn seeded(pause: bool) -> Self {
            let h = Self::new();
            h.clusters.insert(cluster());
            h.templates.insert(template("vnc"));
            h.experiments.insert(experiment(pause));
            h
        }

        pub(crate) fn experiment(&self) -> Experiment {
            self.experiments
                .stored(Some("default"), "exp-1")
                .expect("experiment stored")
        }

        pub(crate) fn status(&self) -> ExperimentStatus {
            self.experiment().status.unwrap_or_default()
        }

        pub(crate) async fn pass(&self) -> Result<Action, Error> {
            reconcile(Arc::new(self.experiment()), self.ctx.clone()).await
        }

        pub(crate) fn pods(&self) -> Vec<Pod> {
            self.pods.all()
        }

        /// Mark every stored pod ready or not ready, as the kubelet would
        pub(crate) fn set_pods_ready(&self, ready: bool) {
            for pod in self.pods.all() {
                let name = pod.name_any();
                self.pods
                    .mutate(Some("default"), &name, |p| {
                        p.status = Some(PodStatus {
                            conditions: Some(vec![PodCondition {
                                type_: "Ready".into(),
                                status: if ready { "True" } else { "False" }.into(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        });
                    })
                    .expect("pod exists");
            }
        }

        /// Assign a node port to the ingress service, as the API server would
        pub(crate) fn assign_node_port(&self, port: i32) {
            for svc in self.services.all() {
                let name = svc.name_any();
                self.services
                    .mutate(Some("default"), &name, |s| {
                        if let Some(ports) = s.spec.as_mut().and_then(|spec| spec.ports.as_mut()) {
                            for p in ports.iter_mut() {
                                p.node_port = Some(port);
                            }
                        }
                    })
                    .expect("service exists");
            }
        }

        pub(crate) fn set_pause(&self, pause: bool) {
            self.experiments
                .mutate(Some("default"), "exp-1", |e| e.spec.pause = pause)
                .expect("experiment exists");
        }
    }

    pub(crate) fn cluster() -> Cluster {
        let mut c = Cluster::new(
            "edge-1",
            ClusterSpec {
                publish_ips: vec!["1.2.3.4".into()],
                private_ips: vec!["10.0.0.1".into()],
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".into());
        c
    }

    pub(crate) fn template(protocol: &str) -> Template {
        let mut t = Template::new(
            "desktop",
            TemplateSpec {
                pod_template: PodTemplate {
                    image: "cloudengine/desktop:1.0".into(),
                    env: BTreeMap::from([("LANG".to_string(), "C.UTF-8".to_string())]),
                    command: vec!["/start.sh".into()],
                },
                ingress_protocol: protocol.into(),
                ingress_port: 5901,
                vnc: Some(VncConfig {
                    username: "user".into(),
                    password: "secret".into(),
                }),
                ssh: None,
            },
        );
        t.metadata.namespace = Some("default".into());
        t
    }

    pub(crate) fn experiment(pause: bool) -> Experiment {
        let mut e = Experiment::new(
            "exp-1",
            ExperimentSpec {
                pause,
                template: "desktop".into(),
                cluster_name: "edge-1".into(),
            },
        );
        e.metadata.namespace = Some("default".into());
        e.metadata.uid = Some("exp-uid".into());
        e
    }

    /// Story: a new experiment gets storage, ingress and a pod, then runs
    #[tokio::test]
    async fn story_experiment_converges_to_running() {
        let h = Harness::seeded(false);

        h.pass().await.expect("first pass");
        let status = h.status();
        assert_eq!(status.phase, ExperimentPhase::Created);
        assert!(status
            .conditions
            .is_true(ExperimentConditionType::Initialized));
        assert!(status
            .conditions
            .is_true(ExperimentConditionType::VolumeCreated));
        assert!(!status.conditions.is_true(ExperimentConditionType::Ready));
        assert_eq!(h.volumes.all().len(), 1);
        assert_eq!(h.claims.all().len(), 1);
        assert_eq!(h.services.all().len(), 1);
        assert_eq!(h.pods().len(), 1);
        assert_eq!(status.protocol.as_deref(), Some("vnc"));
        assert_eq!(status.vnc.as_ref().map(|v| v.username.as_str()), Some("user"));
        assert_eq!(status.ingress_ips, vec!["1.2.3.4"]);
        assert_eq!(status.cluster, "edge-1");
        assert!(h.events.reasons().contains(&reasons::CREATED.to_string()));

        h.assign_node_port(30901);
        h.set_pods_ready(true);
        h.pass().await.expect("second pass");
        let status = h.status();
        assert_eq!(status.phase, ExperimentPhase::Running);
        assert!(status.conditions.is_true(ExperimentConditionType::PodReady));
        assert!(status.conditions.is_true(ExperimentConditionType::Ready));
        assert_eq!(status.ingress_port, Some(30901));
    }

    /// Service store whose writes always fail
    struct UnavailableServices;

    #[async_trait::async_trait]
    impl ObjectApi<Service> for UnavailableServices {
        async fn get(&self, _namespace: Option<&str>, name: &str) -> Result<Service, Error> {
            Err(Error::not_found("Service", name))
        }

        async fn list(
            &self,
            _namespace: Option<&str>,
            _label_selector: Option<&str>,
        ) -> Result<Vec<Service>, Error> {
            Ok(vec![])
        }

        async fn create(&self, _obj: &Service) -> Result<Service, Error> {
            Err(Error::internal("down"))
        }

        async fn replace(&self, _obj: &Service) -> Result<Service, Error> {
            Err(Error::internal("down"))
        }

        async fn replace_status(&self, _obj: &Service) -> Result<Service, Error> {
            Err(Error::internal("down"))
        }

        async fn delete(
            &self,
            _namespace: Option<&str>,
            _name: &str,
            _preconditions: Option<cloudengine_common::store::DeletePreconditions>,
        ) -> Result<(), Error> {
            Err(Error::internal("down"))
        }
    }

    /// Story: a failing ingress step does not stop the volume and pod steps,
    /// and its error is what the pass reports once status is written
    #[tokio::test]
    async fn story_failed_step_does_not_block_the_others() {
        let h = Harness::seeded(false);
        let stores = Stores {
            services: Arc::new(UnavailableServices),
            ..h.ctx.stores.clone()
        };
        let ctx = Arc::new(
            Context::builder(stores)
                .events(h.events.clone())
                .lifecycle(h.lifecycle.clone())
                .build(),
        );

        let err = reconcile(Arc::new(h.experiment()), ctx)
            .await
            .expect_err("ingress failure surfaces");
        assert!(matches!(err, Error::Internal { ref message, .. } if message == "down"));

        assert_eq!(h.volumes.all().len(), 1);
        assert_eq!(h.claims.all().len(), 1);
        assert_eq!(h.pods().len(), 1);
        assert_eq!(h.experiments.counts().status_writes, 1);
        let status = h.status();
        assert!(status
            .conditions
            .is_true(ExperimentConditionType::Initialized));
        assert!(status
            .conditions
            .is_true(ExperimentConditionType::VolumeCreated));
        assert!(h.events.events().iter().any(|e| {
            e.severity == EventSeverity::Warning && e.message.starts_with("create ingress service failed")
        }));
    }

    #[tokio::test]
    async fn story_steady_state_pass_writes_nothing() {
        let h = Harness::seeded(false);
        h.pass().await.expect("first pass");
        h.assign_node_port(30901);
        h.set_pods_ready(true);
        h.pass().await.expect("second pass");

        let volumes = h.volumes.counts().total();
        let claims = h.claims.counts().total();
        let services = h.services.counts().total();
        let pods = h.pods.counts().total();
        let experiments = h.experiments.counts().total();
        h.events.clear();

        let action = h.pass().await.expect("steady pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(h.volumes.counts().total(), volumes);
        assert_eq!(h.claims.counts().total(), claims);
        assert_eq!(h.services.counts().total(), services);
        assert_eq!(h.pods.counts().total(), pods);
        assert_eq!(h.experiments.counts().total(), experiments);
        assert!(h.events.events().is_empty());
    }

    /// Story: pausing deletes the pod, unpausing brings it back to Running
    #[tokio::test]
    async fn story_pause_unpause_round_trip() {
        let h = Harness::seeded(false);
        h.pass().await.expect("create");
        h.set_pods_ready(true);
        h.pass().await.expect("running");
        assert_eq!(h.status().phase, ExperimentPhase::Running);

        h.set_pause(true);
        h.events.clear();
        h.pass().await.expect("pause");
        assert_eq!(h.status().phase, ExperimentPhase::Stopped);
        assert!(h.pods().is_empty());
        assert_eq!(h.events.reasons(), vec![reasons::STATE_CHANGE.to_string()]);
        assert!(!h
            .status()
            .conditions
            .is_true(ExperimentConditionType::PodReady));

        // Staying paused raises no further state change.
        h.events.clear();
        h.pass().await.expect("still paused");
        assert!(h.events.events().is_empty());

        h.set_pause(false);
        h.pass().await.expect("unpause");
        let pods = h.pods();
        assert_eq!(pods.len(), 1);
        assert!(!is_pod_ready(&pods[0]));

        h.set_pods_ready(true);
        h.pass().await.expect("running again");
        assert_eq!(h.status().phase, ExperimentPhase::Running);
        assert!(h.status().conditions.is_true(ExperimentConditionType::PodReady));
    }

    #[tokio::test]
    async fn story_pod_losing_readiness_is_an_error() {
        let h = Harness::seeded(false);
        h.pass().await.expect("create");
        h.set_pods_ready(true);
        h.pass().await.expect("running");

        h.set_pods_ready(false);
        h.events.clear();
        h.pass().await.expect("unhealthy pass");
        let status = h.status();
        assert_eq!(status.phase, ExperimentPhase::Error);
        assert!(!status.conditions.is_true(ExperimentConditionType::PodReady));
        assert_eq!(h.events.reasons(), vec![reasons::UNHEALTHY.to_string()]);
    }

    /// Story: a missing template stops the pass with an error and a warning
    #[tokio::test]
    async fn story_missing_template_is_a_dependency_error() {
        let h = Harness::new();
        h.clusters.insert(cluster());
        h.experiments.insert(experiment(false));

        let result = h.pass().await;
        assert!(matches!(result, Err(Error::DependencyMissing { .. })));
        let events = h.events.events();
        let warning = events
            .iter()
            .find(|e| e.severity == EventSeverity::Warning)
            .expect("warning event");
        assert_eq!(warning.reason, reasons::UNEXPECTED);
        assert!(warning.message.contains("desktop"));

        // Nothing dependent was created, but the experiment was initialized.
        assert!(h.pods().is_empty());
        assert!(h.services.all().is_empty());
        assert!(h.volumes.all().is_empty());
        assert!(h
            .status()
            .conditions
            .is_true(ExperimentConditionType::Initialized));
    }

    #[tokio::test]
    async fn story_deleted_experiment_notifies_subscribers() {
        let h = Harness::seeded(false);
        let mut rx = h.lifecycle.subscribe();
        let mut exp = h.experiment();
        exp.metadata.deletion_timestamp = Some(
            k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(Utc::now()),
        );

        let action = reconcile(Arc::new(exp), h.ctx.clone())
            .await
            .expect("pass");
        assert_eq!(action, Action::await_change());
        assert_eq!(
            rx.try_recv().expect("notification"),
            LifecycleEvent::ExperimentDeleted {
                namespace: "default".into(),
                name: "exp-1".into(),
            }
        );
        assert!(h.pods().is_empty());
    }

    #[tokio::test]
    async fn test_dependents_are_labelled_and_owned() {
        let h = Harness::seeded(false);
        h.pass().await.expect("pass");

        let pod = &h.pods()[0];
        assert_eq!(
            pod.labels().get(LABEL_EXPERIMENT_NAME).map(String::as_str),
            Some("exp-1")
        );
        assert_eq!(pod.owners()[0].uid, "exp-uid");
        let svc = &h.services.all()[0];
        assert_eq!(svc.owners()[0].uid, "exp-uid");
        let ports: Vec<ServicePort> = svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.clone())
            .unwrap_or_default();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].name.as_deref(), Some("vnc"));
    }

    #[test]
    fn test_error_policy_uses_configured_backoff() {
        let h = Harness::new();
        let action = error_policy(
            Arc::new(experiment(false)),
            &Error::internal("boom"),
            h.ctx.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }
}
