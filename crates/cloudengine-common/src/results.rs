//! Folding sub-step outcomes of a reconcile pass into one controller action

use std::time::Duration;

use kube::runtime::controller::Action;
use tracing::debug;

use crate::Error;

/// Requeue hint returned by a reconcile sub-step
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Requeue {
    /// Event-driven; nothing scheduled
    #[default]
    None,
    /// Come back as soon as possible
    Soon,
    /// Come back after the given delay
    After(Duration),
}

/// Accumulated outcome of a multi-step reconcile pass
///
/// Keeps the first error, a requeue-soon flag and the smallest
/// requeue-after hint. Recording an error does not stop accumulation.
#[derive(Debug, Default)]
pub struct ReconcileResults {
    error: Option<Error>,
    failed_step: Option<String>,
    requeue: bool,
    requeue_after: Option<Duration>,
}

impl ReconcileResults {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of a named step
    pub fn with(&mut self, step: &str, outcome: Result<Requeue, Error>) -> &mut Self {
        match outcome {
            Ok(Requeue::None) => {}
            Ok(Requeue::Soon) => self.requeue = true,
            Ok(Requeue::After(delay)) => {
                self.requeue_after(delay);
            }
            Err(e) => {
                self.with_error(step, e);
            }
        }
        self
    }

    /// Record an error; only the first one is kept
    pub fn with_error(&mut self, step: &str, error: Error) -> &mut Self {
        if self.error.is_none() {
            debug!(step, error = %error, "reconcile step failed");
            self.error = Some(error);
            self.failed_step = Some(step.to_string());
        } else {
            debug!(step, error = %error, "additional reconcile step failure");
        }
        self
    }

    /// Ask for a requeue as soon as possible
    pub fn with_requeue(&mut self) -> &mut Self {
        self.requeue = true;
        self
    }

    /// Ask for a requeue after `delay`; the smallest hint wins
    pub fn requeue_after(&mut self, delay: Duration) -> &mut Self {
        self.requeue_after = Some(match self.requeue_after {
            Some(current) => current.min(delay),
            None => delay,
        });
        self
    }

    /// Merge a child accumulator into this one
    pub fn with_result(&mut self, other: ReconcileResults) -> &mut Self {
        if let Some(error) = other.error {
            let step = other.failed_step.unwrap_or_default();
            self.with_error(&step, error);
        }
        self.requeue |= other.requeue;
        if let Some(delay) = other.requeue_after {
            self.requeue_after(delay);
        }
        self
    }

    /// True if no error has been recorded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Name of the step that produced the recorded error
    pub fn failed_step(&self) -> Option<&str> {
        self.failed_step.as_deref()
    }

    /// Delay until the next pass, or `None` if the pass is purely event-driven
    ///
    /// A requeue-soon flag counts as a hint of `requeue_soon`.
    pub fn next_requeue(&self, requeue_soon: Duration) -> Option<Duration> {
        let soon = self.requeue.then_some(requeue_soon);
        match (soon, self.requeue_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Terminal decision for the pass
    pub fn aggregate(self, requeue_soon: Duration) -> Result<Action, Error> {
        let next = self.next_requeue(requeue_soon);
        match self.error {
            Some(error) => Err(error),
            None => Ok(match next {
                Some(delay) => Action::requeue(delay),
                None => Action::await_change(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOON: Duration = Duration::from_secs(1);

    #[test]
    fn story_smallest_requeue_hint_wins() {
        let mut results = ReconcileResults::new();
        results
            .with("volume", Ok(Requeue::After(Duration::from_secs(30))))
            .with("ingress", Ok(Requeue::None))
            .with("pod", Ok(Requeue::After(Duration::from_secs(12))));

        assert_eq!(results.next_requeue(SOON), Some(Duration::from_secs(12)));
        let action = results.aggregate(SOON).expect("no error");
        assert_eq!(action, Action::requeue(Duration::from_secs(12)));
    }

    #[test]
    fn story_no_hints_means_event_driven() {
        let mut results = ReconcileResults::new();
        results.with("pod", Ok(Requeue::None));
        assert_eq!(results.next_requeue(SOON), None);
        assert_eq!(results.aggregate(SOON).expect("ok"), Action::await_change());
    }

    #[test]
    fn story_first_error_wins_and_later_steps_still_count() {
        let mut results = ReconcileResults::new();
        results
            .with("volume", Ok(Requeue::None))
            .with("ingress", Err(Error::dependency_missing("Cluster", "c1")))
            .with("pod", Err(Error::internal("second")))
            .with("status", Ok(Requeue::Soon));

        assert!(!results.is_ok());
        assert_eq!(results.failed_step(), Some("ingress"));
        assert_eq!(results.next_requeue(SOON), Some(SOON));
        let err = results.aggregate(SOON).expect_err("error recorded");
        assert!(matches!(err, Error::DependencyMissing { .. }));
    }

    #[test]
    fn story_child_results_merge_into_parent() {
        let mut child = ReconcileResults::new();
        child.with_requeue().requeue_after(Duration::from_secs(3));

        let mut parent = ReconcileResults::new();
        parent.requeue_after(Duration::from_secs(60));
        parent.with_result(child);

        assert_eq!(parent.next_requeue(SOON), Some(SOON));
        assert_eq!(
            parent.next_requeue(Duration::from_secs(5)),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_child_error_keeps_step_name() {
        let mut child = ReconcileResults::new();
        child.with_error("data-volume", Error::internal("boom"));
        let mut parent = ReconcileResults::new();
        parent.with_result(child);
        assert_eq!(parent.failed_step(), Some("data-volume"));
    }
}
