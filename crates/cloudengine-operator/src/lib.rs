//! cloudengine operator - wires the Cluster and Experiment controllers, the
//! heartbeat endpoint and startup steps into one process

#![deny(missing_docs)]

pub mod cli;
pub mod controller_runner;
pub mod lifecycle_listener;
pub mod startup;
