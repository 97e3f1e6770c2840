//! Startup utilities for the Galera operator

mod crds;

pub use crds::ensure_crds_installed;
