//! Cluster health tracking for cloudengine
//!
//! Registered clusters report in through the heartbeat endpoint; the
//! controller turns those reports into a lifecycle phase and requeues itself
//! so a silent cluster is noticed once its timeout passes.

#![deny(missing_docs)]

pub mod controller;
pub mod driver;
pub mod heartbeat;
pub mod meta;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use driver::ClusterDriver;
pub use heartbeat::{heartbeat_routes, Heartbeat, HeartbeatIngest, HeartbeatResponse};
pub use meta::ensure_meta_cluster;
