//! Full cluster crash detection
//!
//! A full crash is when every database pod has restarted and none is ready,
//! so no node can act as a donor and the cluster will not form on its own.

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::warn;

use galera_common::crd::{GaleraCluster, Tier};
use galera_common::events::{actions, reasons};
use galera_common::kube_utils::{pod_is_ready, pod_restart_count, tier_labels};
use galera_common::Error;

use super::Context;

/// True when every expected database pod is down after restarting
pub fn is_full_cluster_crash(pods: &[Pod], size: i32) -> bool {
    if size <= 0 || pods.len() < size as usize {
        return false;
    }
    pods.iter()
        .all(|p| !pod_is_ready(p) && pod_restart_count(p) > 0)
}

/// Hand a fully crashed database tier to the recovery action
///
/// Returns whether recovery ran.
pub async fn check_full_cluster_crash(
    cluster: &GaleraCluster,
    ctx: &Context,
) -> Result<bool, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let pods = ctx
        .stores
        .pods
        .list(&namespace, &tier_labels(&cluster.name_any(), Tier::Database))
        .await?;
    if !is_full_cluster_crash(&pods, cluster.spec.database.size) {
        return Ok(false);
    }

    let mut names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
    names.sort();
    warn!(pods = ?names, "full cluster crash detected");
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            EventType::Warning,
            reasons::FULL_CLUSTER_CRASH,
            actions::RECOVER,
            Some(format!("all {} database pods crashed", names.len())),
        )
        .await;

    ctx.recovery.recover(cluster, &names).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockRecoveryAction;
    use crate::controller::testing::{
        database_pod, fixed_user_sync, fixed_versions, sample_cluster,
    };
    use crate::store::memory::MemoryStores;
    use std::sync::Arc;

    #[test]
    fn crash_needs_every_pod_down_and_restarted() {
        let cluster = sample_cluster();
        let crashed: Vec<Pod> = (0..3).map(|i| database_pod(&cluster, i, false, 2)).collect();
        assert!(is_full_cluster_crash(&crashed, 3));

        let mut one_ready = crashed.clone();
        one_ready[1] = database_pod(&cluster, 1, true, 2);
        assert!(!is_full_cluster_crash(&one_ready, 3));

        let mut never_started = crashed.clone();
        never_started[2] = database_pod(&cluster, 2, false, 0);
        assert!(!is_full_cluster_crash(&never_started, 3));
    }

    #[test]
    fn missing_pods_are_not_a_crash() {
        let cluster = sample_cluster();
        let pods: Vec<Pod> = (0..2).map(|i| database_pod(&cluster, i, false, 1)).collect();
        assert!(!is_full_cluster_crash(&pods, 3));
        assert!(!is_full_cluster_crash(&[], 0));
    }

    #[tokio::test]
    async fn story_crashed_cluster_is_recovered_with_sorted_pods() {
        let stores = MemoryStores::new();
        let cluster = sample_cluster();
        for i in [2, 0, 1] {
            stores.pods.seed(database_pod(&cluster, i, false, 4));
        }
        let mut recovery = MockRecoveryAction::new();
        recovery
            .expect_recover()
            .withf(|_, pods| pods == ["prod-db-0", "prod-db-1", "prod-db-2"])
            .times(1)
            .returning(|_, _| Ok(()));
        let ctx = Context::for_testing(
            stores.stores(),
            Arc::new(fixed_user_sync()),
            Arc::new(fixed_versions()),
            Arc::new(recovery),
        );

        assert!(check_full_cluster_crash(&cluster, &ctx).await.unwrap());
    }

    #[tokio::test]
    async fn healthy_cluster_is_left_alone() {
        let stores = MemoryStores::new();
        let cluster = sample_cluster();
        for i in 0..3 {
            stores.pods.seed(database_pod(&cluster, i, true, 0));
        }
        let ctx = crate::controller::testing::test_context(&stores);

        assert!(!check_full_cluster_crash(&cluster, &ctx).await.unwrap());
    }
}
