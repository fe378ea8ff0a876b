//! Startup and initialization steps run before the controllers start

mod crds;
mod meta;

pub use crds::{crd_manifests, ensure_crds_installed};
pub use meta::register_meta_cluster;
