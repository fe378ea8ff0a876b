//! Lifecycle notifications
//!
//! A [`LifecycleBus`] is created once at startup and handed to every
//! component that reports or reacts to resource deletion.

use tokio::sync::broadcast;
use tracing::trace;

/// Default channel capacity; slow subscribers lose the oldest notifications
pub const DEFAULT_CAPACITY: usize = 256;

/// A resource lifecycle notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A Cluster was deleted
    ClusterDeleted {
        /// Namespace of the Cluster
        namespace: String,
        /// Name of the Cluster
        name: String,
        /// Assigned cluster ID, if one was assigned
        cluster_id: Option<String>,
    },
    /// An Experiment was deleted
    ExperimentDeleted {
        /// Namespace of the Experiment
        namespace: String,
        /// Name of the Experiment
        name: String,
    },
}

/// Broadcast channel for [`LifecycleEvent`]s
#[derive(Clone, Debug)]
pub struct LifecycleBus {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl Default for LifecycleBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LifecycleBus {
    /// Create a bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a notification. Having no subscriber is not an error.
    pub fn publish(&self, event: LifecycleEvent) {
        if self.sender.send(event).is_err() {
            trace!("lifecycle event dropped: no subscribers");
        }
    }

    /// Subscribe to notifications published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }
}
