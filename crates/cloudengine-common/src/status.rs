//! Status accumulation for a single reconcile pass
//!
//! A [`StatusAccumulator`] holds the observed object, a private working copy
//! of its status and the events raised during the pass. [`StatusAccumulator::apply`]
//! decides whether anything needs persisting.

use crate::crd::WithStatus;
use crate::events::{EventSeverity, PendingEvent};

/// Outcome of [`StatusAccumulator::apply`]
#[derive(Debug)]
pub struct StatusChange<K> {
    /// Events raised during the pass, in order
    pub events: Vec<PendingEvent>,
    /// Object carrying the new status, or `None` when nothing changed
    pub persist: Option<K>,
}

/// Working status plus event log for one reconcile pass
#[derive(Debug)]
pub struct StatusAccumulator<K: WithStatus> {
    original: K,
    /// Mutable working copy of the status
    pub status: K::Status,
    events: Vec<PendingEvent>,
}

impl<K: WithStatus> StatusAccumulator<K> {
    /// Start a pass from the observed object
    pub fn new(observed: &K) -> Self {
        Self {
            status: observed.status().cloned().unwrap_or_default(),
            original: observed.clone(),
            events: Vec::new(),
        }
    }

    /// The object as observed at the start of the pass
    pub fn object(&self) -> &K {
        &self.original
    }

    /// Record an event for publication at the end of the pass
    pub fn add_event(
        &mut self,
        severity: EventSeverity,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.events.push(PendingEvent::new(severity, reason, message));
    }

    /// Events recorded so far
    pub fn events(&self) -> &[PendingEvent] {
        &self.events
    }

    /// Compare the working status with the original and finish the pass.
    ///
    /// A missing original status compares as the default status, so a pass
    /// that leaves a fresh object at its defaults does not write.
    pub fn apply(self) -> StatusChange<K> {
        let original = self.original.status().cloned().unwrap_or_default();
        let persist = if original == self.status {
            None
        } else {
            let mut updated = self.original;
            updated.set_status(self.status);
            Some(updated)
        };
        StatusChange {
            events: self.events,
            persist,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ClusterConditionType, ClusterPhase, ClusterSpec, ClusterStatus, ConditionStatus,
        Experiment, ExperimentPhase, ExperimentSpec,
    };
    use crate::crd::Cluster;
    use crate::events::reasons;

    fn cluster_with_status(status: Option<ClusterStatus>) -> Cluster {
        let mut cluster = Cluster::new("c1", ClusterSpec::default());
        cluster.status = status;
        cluster
    }

    /// Story: a pass that only emits events does not write the object
    #[test]
    fn story_unchanged_status_suppresses_write_but_keeps_events() {
        let status = ClusterStatus {
            phase: ClusterPhase::Ready,
            cluster_id: Some("abc".into()),
            ..Default::default()
        };
        let cluster = cluster_with_status(Some(status));
        let mut acc = StatusAccumulator::new(&cluster);
        acc.add_event(EventSeverity::Warning, reasons::VALIDATION, "no ips");

        let change = acc.apply();
        assert!(change.persist.is_none());
        assert_eq!(change.events.len(), 1);
        assert_eq!(change.events[0].reason, reasons::VALIDATION);
    }

    #[test]
    fn story_changed_status_is_returned_for_persisting() {
        let cluster = cluster_with_status(None);
        let mut acc = StatusAccumulator::new(&cluster);
        acc.status.phase = ClusterPhase::Created;
        acc.status.conditions.set(
            ClusterConditionType::Init,
            ConditionStatus::True,
            "",
            "",
            chrono::Utc::now(),
        );

        let change = acc.apply();
        let persisted = change.persist.expect("status changed");
        let status = persisted.status.expect("status set");
        assert_eq!(status.phase, ClusterPhase::Created);
        assert!(status.conditions.is_true(ClusterConditionType::Init));
        assert_eq!(persisted.spec, ClusterSpec::default());
    }

    #[test]
    fn test_absent_status_left_at_default_does_not_write() {
        let experiment = Experiment::new(
            "e1",
            ExperimentSpec {
                pause: false,
                template: "t".into(),
                cluster_name: "c".into(),
            },
        );
        let acc = StatusAccumulator::new(&experiment);
        assert_eq!(acc.status.phase, ExperimentPhase::Created);
        assert!(acc.apply().persist.is_none());
    }

    #[test]
    fn test_working_copy_is_private() {
        let cluster = cluster_with_status(Some(ClusterStatus::default()));
        let mut acc = StatusAccumulator::new(&cluster);
        acc.status.phase = ClusterPhase::Lost;
        assert_eq!(
            acc.object().status.as_ref().map(|s| s.phase),
            Some(ClusterPhase::Unknown)
        );
    }
}
