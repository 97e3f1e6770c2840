//! Fixtures shared by the controller tests

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{
    ContainerStatus, PersistentVolumeClaim, Pod, PodCondition, PodStatus, Secret,
};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;

use galera_common::crd::{
    DatabaseSpec, GaleraCluster, GaleraClusterSpec, ProxyTierSpec, Tier, UpgradeOptions,
};
use galera_common::kube_utils::tier_labels;

use super::Context;
use crate::collaborators::{MockRecoveryAction, MockUserSync, TierAnnotations};
use crate::store::memory::MemoryStores;
use crate::version::MockVersionResolver;

/// Version the mocked version service hands out
pub const RESOLVED_VERSION: &str = "8.0.36-28.1";

/// Three-node cluster `db/prod` with defaults applied and a uid assigned
pub fn sample_cluster() -> GaleraCluster {
    let mut cluster = GaleraCluster::new(
        "prod",
        GaleraClusterSpec {
            cr_version: "1.8.0".to_string(),
            secrets_name: String::new(),
            ssl_secret_name: String::new(),
            ssl_internal_secret_name: String::new(),
            vault_secret_name: String::new(),
            allow_unsafe_configurations: false,
            database: DatabaseSpec {
                size: 3,
                image: "galera/mysql:8.0.36".to_string(),
                ..Default::default()
            },
            haproxy: None,
            proxysql: None,
            log_collector: None,
            backup: None,
            upgrade_options: UpgradeOptions::default(),
        },
    );
    cluster.metadata.namespace = Some("db".to_string());
    cluster.metadata.uid = Some("cluster-uid-1".to_string());
    cluster
        .check_and_set_defaults("1.8.0")
        .expect("sample cluster is valid");
    cluster
}

fn routing_tier(image: &str) -> ProxyTierSpec {
    ProxyTierSpec {
        enabled: true,
        size: 2,
        image: image.to_string(),
        ..Default::default()
    }
}

/// Enable the HAProxy tier with two replicas
pub fn with_haproxy(mut cluster: GaleraCluster) -> GaleraCluster {
    cluster.spec.haproxy = Some(routing_tier("galera/haproxy:2.8"));
    cluster
}

/// Enable the ProxySQL tier with two replicas
pub fn with_proxysql(mut cluster: GaleraCluster) -> GaleraCluster {
    cluster.spec.proxysql = Some(routing_tier("galera/proxysql:2.5"));
    cluster
}

/// Secret `name` in namespace `db`
pub fn secret(name: &str, data: &[(&str, &str)]) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("db".to_string()),
            ..Default::default()
        },
        data: Some(
            data.iter()
                .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Default::default()
    }
}

/// Tier workload reporting `ready` ready replicas
pub fn stateful_set_with_ready(cluster: &GaleraCluster, tier: Tier, ready: i32) -> StatefulSet {
    let mut sts = crate::manifests::stateful_set(cluster, tier).expect("tier is enabled");
    sts.status = Some(StatefulSetStatus {
        replicas: cluster.tier_size(tier),
        ready_replicas: Some(ready),
        ..Default::default()
    });
    sts
}

/// Database pod `<cluster>-db-<ordinal>`
pub fn database_pod(cluster: &GaleraCluster, ordinal: usize, ready: bool, restarts: i32) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(format!("{}-db-{ordinal}", cluster.name_any())),
            namespace: cluster.namespace(),
            labels: Some(tier_labels(&cluster.name_any(), Tier::Database)),
            ..Default::default()
        },
        spec: None,
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(vec![ContainerStatus {
                name: "db".to_string(),
                restart_count: restarts,
                image: cluster.spec.database.image.clone(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

/// Volume claim `data-<workload>-<ordinal>` labelled for the tier
pub fn volume_claim(cluster: &GaleraCluster, tier: Tier, ordinal: usize) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(format!(
                "data-{}-{ordinal}",
                tier.workload_name(&cluster.name_any())
            )),
            namespace: cluster.namespace(),
            labels: Some(tier_labels(&cluster.name_any(), tier)),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Seed the cluster plus the secrets a healthy cluster has
pub fn seed_cluster(stores: &MemoryStores, cluster: &GaleraCluster) {
    stores.clusters.seed(cluster.clone());
    stores.secrets.seed(secret(
        &cluster.spec.ssl_secret_name,
        &[("tls.crt", "client-cert"), ("tls.key", "client-key")],
    ));
    stores.secrets.seed(secret(
        &cluster.spec.ssl_internal_secret_name,
        &[("tls.crt", "peer-cert"), ("tls.key", "peer-key")],
    ));
}

/// User sync that annotates both tiers with a fixed hash
pub fn fixed_user_sync() -> MockUserSync {
    let mut users = MockUserSync::new();
    users.expect_sync_users().returning(|_| {
        let annotations =
            BTreeMap::from([("galera.dev/last-applied-secret".to_string(), "u1".to_string())]);
        Ok(TierAnnotations {
            database: annotations.clone(),
            proxysql: annotations,
        })
    });
    users.expect_resync_proxysql_users().returning(|_| Ok(()));
    users
}

/// Version service that always answers [`RESOLVED_VERSION`]
pub fn fixed_versions() -> MockVersionResolver {
    let mut versions = MockVersionResolver::new();
    versions
        .expect_resolve()
        .returning(|_, _, _| Ok(RESOLVED_VERSION.to_string()));
    versions
}

/// Recovery action that must never run
pub fn no_recovery() -> MockRecoveryAction {
    let mut recovery = MockRecoveryAction::new();
    recovery.expect_recover().never();
    recovery
}

/// Context over `stores` with well-behaved collaborators
pub fn test_context(stores: &MemoryStores) -> Arc<Context> {
    Arc::new(Context::for_testing(
        stores.stores(),
        Arc::new(fixed_user_sync()),
        Arc::new(fixed_versions()),
        Arc::new(no_recovery()),
    ))
}
