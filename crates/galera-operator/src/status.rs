//! Status reporting for GaleraCluster
//!
//! Runs once at the end of every pass that got past the precondition gate,
//! whether or not the pass succeeded. Writes are skipped when the computed
//! status equals the stored one.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use galera_common::crd::{
    merge_conditions, AppState, Condition, ConditionStatus, GaleraCluster, GaleraClusterStatus,
    Tier, TierStatus,
};
use galera_common::Error;

use crate::store::{get_opt, ObjectStore};

/// Condition type summarising readiness of every tier
pub const CONDITION_READY: &str = "Ready";

/// Reports observed state back onto the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusHook: Send + Sync {
    /// Record the outcome of a pass; `last_error` is the pass's error, if any
    async fn update_status(
        &self,
        cluster: &GaleraCluster,
        last_error: Option<String>,
    ) -> Result<(), Error>;
}

/// Derives status from the tier StatefulSets
pub struct StatefulSetStatusHook {
    clusters: Arc<dyn ObjectStore<GaleraCluster>>,
    stateful_sets: Arc<dyn ObjectStore<StatefulSet>>,
}

impl StatefulSetStatusHook {
    /// Create a hook reading workloads from `stateful_sets`
    pub fn new(
        clusters: Arc<dyn ObjectStore<GaleraCluster>>,
        stateful_sets: Arc<dyn ObjectStore<StatefulSet>>,
    ) -> Self {
        Self {
            clusters,
            stateful_sets,
        }
    }

    async fn tier_status(
        &self,
        cluster: &GaleraCluster,
        tier: Tier,
        previous: Option<&TierStatus>,
    ) -> Result<TierStatus, Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let workload = get_opt(
            self.stateful_sets.as_ref(),
            &namespace,
            &tier.workload_name(&cluster.name_any()),
        )
        .await?;
        let ready = workload
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0);
        let size = cluster.tier_size(tier);
        Ok(TierStatus {
            size,
            ready,
            status: tier_state(size, ready),
            version: previous.map(|p| p.version.clone()).unwrap_or_default(),
            image: cluster.tier_image(tier).to_string(),
        })
    }
}

fn tier_state(size: i32, ready: i32) -> AppState {
    if size > 0 && ready >= size {
        AppState::Ready
    } else {
        AppState::Initializing
    }
}

/// Overall state from the tier states and the pass outcome
pub fn overall_state(
    cluster: &GaleraCluster,
    tiers: &[&TierStatus],
    last_error: Option<&str>,
) -> AppState {
    if cluster.is_deleting() {
        AppState::Stopping
    } else if last_error.is_some() {
        AppState::Error
    } else if tiers.iter().all(|t| t.status == AppState::Ready) {
        AppState::Ready
    } else {
        AppState::Initializing
    }
}

fn ready_condition(state: AppState, last_error: Option<&str>) -> Condition {
    let (status, reason) = match state {
        AppState::Ready => (ConditionStatus::True, "AllTiersReady"),
        AppState::Error => (ConditionStatus::False, "ReconcileError"),
        AppState::Stopping => (ConditionStatus::False, "Deleting"),
        _ => (ConditionStatus::False, "TiersNotReady"),
    };
    Condition::new(
        CONDITION_READY,
        status,
        reason,
        last_error.unwrap_or_default(),
    )
}

#[async_trait]
impl StatusHook for StatefulSetStatusHook {
    async fn update_status(
        &self,
        cluster: &GaleraCluster,
        last_error: Option<String>,
    ) -> Result<(), Error> {
        let previous = cluster.status.clone().unwrap_or_default();

        let database = self
            .tier_status(cluster, Tier::Database, Some(&previous.database))
            .await?;
        let mut haproxy = None;
        let mut proxysql = None;
        for (tier, slot, prev) in [
            (Tier::HaProxy, &mut haproxy, previous.haproxy.as_ref()),
            (Tier::ProxySql, &mut proxysql, previous.proxysql.as_ref()),
        ] {
            if cluster.tier_enabled(tier) {
                *slot = Some(self.tier_status(cluster, tier, prev).await?);
            }
        }

        let tiers: Vec<&TierStatus> = std::iter::once(&database)
            .chain(haproxy.as_ref())
            .chain(proxysql.as_ref())
            .collect();
        let state = overall_state(cluster, &tiers, last_error.as_deref());
        let conditions = merge_conditions(
            &previous.conditions,
            vec![ready_condition(state, last_error.as_deref())],
        );

        let next = GaleraClusterStatus {
            state,
            database,
            haproxy,
            proxysql,
            message: last_error,
            conditions,
            observed_generation: cluster.metadata.generation.or(previous.observed_generation),
        };
        if next == previous {
            debug!(cluster = %cluster.name_any(), "status unchanged");
            return Ok(());
        }

        let mut updated = cluster.clone();
        updated.status = Some(next);
        self.clusters.update_status(&updated).await
    }
}
