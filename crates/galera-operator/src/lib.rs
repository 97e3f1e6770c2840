//! Galera Kubernetes operator
//!
//! Reconciles `GaleraCluster` resources into a database tier plus optional
//! HAProxy and ProxySQL routing tiers.

#![deny(missing_docs)]

/// Contracts for user sync, secrets, backups and crash recovery
pub mod collaborators;
/// Operator flags and environment settings
pub mod config;
/// GaleraCluster reconciliation
pub mod controller;
/// Controller construction
pub mod controller_runner;
/// Desired manifests per tier
pub mod manifests;
/// Startup utilities (CRD install)
pub mod startup;
/// Status reporting
pub mod status;
/// Object store seam over the Kubernetes API
pub mod store;
/// Version service client
pub mod version;
