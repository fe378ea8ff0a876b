//! Cluster health state machine
//!
//! The driver is pure status computation: it reads the working status held by
//! a [`StatusAccumulator`], mutates it, and reports when the next pass is due.
//! Heartbeat conditions are written by the heartbeat ingest path; the driver
//! only consumes them.
//!
//! ```text
//! Unknown -> Created -> Ready <-> Lost
//!                         |
//!                         v
//!                    OutOfControl
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cloudengine_common::crd::{
    Cluster, ClusterConditionType, ClusterPhase, ConditionStatus, Conditions,
};
use cloudengine_common::events::{reasons, EventSeverity};
use cloudengine_common::results::ReconcileResults;
use cloudengine_common::status::StatusAccumulator;
use cloudengine_common::OperatorConfig;
use tracing::{debug, info};

/// Slack added to the timeout before re-checking a Ready cluster
const NEXT_CHECK_SLACK: Duration = Duration::from_secs(1);

const META_READY_REASON: &str = "Ready";
const META_READY_MESSAGE: &str = "meta cluster ready";

/// Evaluates a Cluster's phase from its conditions
pub struct ClusterDriver {
    config: Arc<OperatorConfig>,
}

impl ClusterDriver {
    /// Create a driver using the operator's timeouts
    pub fn new(config: Arc<OperatorConfig>) -> Self {
        Self { config }
    }

    /// Heartbeat timeout for `cluster`: its override or the operator default
    pub fn timeout_for(&self, cluster: &Cluster) -> Duration {
        cluster
            .spec
            .timeout_override()
            .unwrap_or(self.config.heartbeat_timeout)
    }

    /// Run one pass of the state machine at wall-clock time `now`
    pub fn reconcile(
        &self,
        acc: &mut StatusAccumulator<Cluster>,
        now: DateTime<Utc>,
    ) -> ReconcileResults {
        if acc.object().is_meta() {
            return self.reconcile_meta(acc, now);
        }

        let timeout = self.timeout_for(acc.object());
        let mut results = ReconcileResults::new();
        let status = &mut acc.status;

        if !status.conditions.is_true(ClusterConditionType::Init) {
            status.phase = ClusterPhase::Created;
            if status.cluster_id.as_deref().unwrap_or_default().is_empty() {
                status.cluster_id = Some(uuid::Uuid::new_v4().to_string());
            }
            status
                .conditions
                .set(ClusterConditionType::Init, ConditionStatus::True, "", "", now);
            info!(cluster_id = ?status.cluster_id, "cluster initialized, waiting for first heartbeat");
            acc.add_event(
                EventSeverity::Normal,
                reasons::CREATED,
                "wait for first heartbeat",
            );
            results.with_requeue();
            return results;
        }

        if status
            .conditions
            .check(ClusterConditionType::FirstConnect, ConditionStatus::False)
        {
            debug!("waiting for first heartbeat");
            return results;
        }

        status.phase = ClusterPhase::Unknown;
        let probe = match status.conditions.query(ClusterConditionType::Heartbeat) {
            Some(hb) if hb.status != ConditionStatus::False => hb.last_probe_time,
            _ => {
                status.phase = ClusterPhase::Lost;
                debug!("cluster lost");
                return results;
            }
        };

        // A probe time in the future counts as just received.
        let elapsed = (now - probe).to_std().unwrap_or(Duration::ZERO);
        if elapsed > timeout {
            status.phase = ClusterPhase::Lost;
            status.conditions.set(
                ClusterConditionType::Heartbeat,
                ConditionStatus::False,
                reasons::UNHEALTHY,
                "time out",
                now,
            );
            info!(
                elapsed_secs = elapsed.as_secs(),
                timeout_secs = timeout.as_secs(),
                "cluster heartbeat timeout"
            );
            acc.add_event(
                EventSeverity::Warning,
                reasons::UNHEALTHY,
                "cluster heartbeat timeout",
            );
            return results;
        }

        status.phase = ClusterPhase::Ready;
        let failing = failing_message(&status.conditions, ClusterConditionType::ResourceSync)
            .map(|m| format!("resource sync error: {m}"))
            .into_iter()
            .chain(
                failing_message(&status.conditions, ClusterConditionType::CommandApply)
                    .map(|m| format!("cluster command apply error: {m}")),
            )
            .collect::<Vec<_>>();
        if !failing.is_empty() {
            status.phase = ClusterPhase::OutOfControl;
        }
        for message in failing {
            acc.add_event(EventSeverity::Warning, reasons::UNEXPECTED, message);
        }

        results.requeue_after((timeout + NEXT_CHECK_SLACK).saturating_sub(elapsed));
        results
    }

    fn reconcile_meta(
        &self,
        acc: &mut StatusAccumulator<Cluster>,
        now: DateTime<Utc>,
    ) -> ReconcileResults {
        debug!("reconciling meta cluster");
        let timeout = acc
            .object()
            .spec
            .timeout_override()
            .unwrap_or(self.config.meta_cluster.timeout);
        acc.status.phase = ClusterPhase::Ready;
        for type_ in ClusterConditionType::ALL {
            acc.status.conditions.ensure(
                type_,
                ConditionStatus::True,
                META_READY_REASON,
                META_READY_MESSAGE,
                now,
            );
        }
        let mut results = ReconcileResults::new();
        results.requeue_after(timeout);
        results
    }
}

/// Message of a condition that is explicitly False
fn failing_message(
    conditions: &Conditions<ClusterConditionType>,
    type_: ClusterConditionType,
) -> Option<String> {
    conditions
        .query(type_)
        .filter(|c| c.status == ConditionStatus::False)
        .map(|c| c.message.clone())
}
