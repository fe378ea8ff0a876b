//! Experiment lifecycle for cloudengine
//!
//! An Experiment is realized as a workload pod with a data volume and an
//! ingress Service. The controller converges those dependents every pass and
//! derives the experiment's phase and connection details from them.

#![deny(missing_docs)]

pub mod controller;
pub mod datavolume;
pub mod ingress;
pub mod pod;
pub mod resources;
pub mod status;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, Stores};
pub use resources::ResourceState;
