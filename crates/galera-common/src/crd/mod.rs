//! Custom Resource Definitions for the Galera operator

mod cluster;
mod types;

pub use cluster::{
    BackupSpec, DatabaseSpec, GaleraCluster, GaleraClusterSpec, GaleraClusterStatus,
    LogCollectorSpec, PitrSpec, ProxyTierSpec, UpgradeOptions, UpgradeStrategy,
    DEFAULT_CHECK_INTERVAL_SECS,
};
pub use types::{
    merge_conditions, AppState, Condition, ConditionStatus, IntOrPercent,
    PodDisruptionBudgetSpec, PodResources, ResourceList, Tier, TierStatus,
};
