//! Narrow contracts for work the controller delegates
//!
//! SQL-level account management, TLS issuance and backup scheduling live
//! behind these traits. The defaults here cover what can be done with the
//! object store alone; deployments that need more plug in their own
//! implementations through [`crate::controller::ContextBuilder`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::ResourceExt;
use rand::Rng;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use galera_common::crd::GaleraCluster;
use galera_common::kube_utils::{controller_owner_ref, hash_secret_data};
use galera_common::Error;

use crate::store::{delete_if_present, get_opt, ObjectStore};

/// Pod template annotation carrying the hash of the users secret
pub const ANNOTATION_USERS_SECRET_HASH: &str = "galera.dev/last-applied-secret";

/// System accounts every cluster needs
pub const SYSTEM_USERS: [&str; 7] = [
    "root",
    "xtrabackup",
    "monitor",
    "clustercheck",
    "proxyadmin",
    "operator",
    "replication",
];

const PASSWORD_LEN: usize = 20;

/// Pod template annotations produced by user synchronisation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TierAnnotations {
    /// Annotations for the database pod template
    pub database: BTreeMap<String, String>,
    /// Annotations for the ProxySQL pod template
    pub proxysql: BTreeMap<String, String>,
}

/// Keeps SQL accounts in line with the users secret
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserSync: Send + Sync {
    /// Apply account changes and return annotations that roll pods when
    /// credentials changed
    async fn sync_users(&self, cluster: &GaleraCluster) -> Result<TierAnnotations, Error>;

    /// Push database accounts into ProxySQL
    ///
    /// Called from a detached task once the cluster is ready, at most one
    /// at a time per cluster. Implementations that can reach the ProxySQL
    /// admin interface load the accounts there; without one, credentials
    /// reach ProxySQL through the rollout driven by the users-secret hash
    /// that [`UserSync::sync_users`] returns.
    async fn resync_proxysql_users(&self, cluster: &GaleraCluster) -> Result<(), Error>;
}

/// Manages credential and TLS material
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretReconciler: Send + Sync {
    /// Make sure the users secret exists
    async fn ensure_users_secret(&self, cluster: &GaleraCluster) -> Result<(), Error>;

    /// Make sure TLS material is present or requested
    async fn reconcile_tls(&self, cluster: &GaleraCluster) -> Result<(), Error>;

    /// Content hash of a secret, `None` if the secret does not exist
    async fn secret_hash(
        &self,
        cluster: &GaleraCluster,
        secret_name: &str,
    ) -> Result<Option<String>, Error>;
}

/// Reconciles backup-related resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BackupReconciler: Send + Sync {
    /// Converge backup resources for the cluster
    async fn reconcile_backups(&self, cluster: &GaleraCluster) -> Result<(), Error>;

    /// Remove the point-in-time-recovery collector
    async fn delete_pitr(&self, cluster: &GaleraCluster) -> Result<(), Error>;
}

/// Brings a fully crashed database tier back
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    /// Recover from a crash in which every pod in `pods` failed
    async fn recover(&self, cluster: &GaleraCluster, pods: &[String]) -> Result<(), Error>;
}

fn generate_password() -> String {
    let mut rng = rand::thread_rng();
    (0..PASSWORD_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..62u8);
            match idx {
                0..=9 => (b'0' + idx) as char,
                10..=35 => (b'a' + idx - 10) as char,
                _ => (b'A' + idx - 36) as char,
            }
        })
        .collect()
}

/// Secret reconciler backed by the secret store
pub struct StoreSecretReconciler {
    secrets: Arc<dyn ObjectStore<Secret>>,
}

impl StoreSecretReconciler {
    /// Create a reconciler over the given secret store
    pub fn new(secrets: Arc<dyn ObjectStore<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl SecretReconciler for StoreSecretReconciler {
    async fn ensure_users_secret(&self, cluster: &GaleraCluster) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = &cluster.spec.secrets_name;
        if get_opt(self.secrets.as_ref(), &namespace, name)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let data = SYSTEM_USERS
            .iter()
            .map(|user| {
                (
                    user.to_string(),
                    ByteString(generate_password().into_bytes()),
                )
            })
            .collect();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![controller_owner_ref(cluster)?]),
                ..Default::default()
            },
            data: Some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        };
        match self.secrets.create(&secret).await {
            Ok(_) => {
                info!(secret = %name, "generated users secret");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_tls(&self, cluster: &GaleraCluster) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        for name in [
            &cluster.spec.ssl_secret_name,
            &cluster.spec.ssl_internal_secret_name,
        ] {
            if get_opt(self.secrets.as_ref(), &namespace, name)
                .await?
                .is_none()
            {
                debug!(secret = %name, "TLS secret not present, expecting an external issuer");
            }
        }
        Ok(())
    }

    async fn secret_hash(
        &self,
        cluster: &GaleraCluster,
        secret_name: &str,
    ) -> Result<Option<String>, Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        Ok(get_opt(self.secrets.as_ref(), &namespace, secret_name)
            .await?
            .map(|s| hash_secret_data(&s.data.unwrap_or_default())))
    }
}

/// User sync that rolls pods whenever the users secret changes
///
/// Account changes themselves are applied by the database entrypoint on
/// restart, so the annotation is all that is needed here. It has no admin
/// connection to ProxySQL, so the ProxySQL resync only checks that the
/// users secret is still there.
pub struct SecretHashUserSync {
    secrets: Arc<dyn SecretReconciler>,
}

impl SecretHashUserSync {
    /// Create a user sync reading hashes through `secrets`
    pub fn new(secrets: Arc<dyn SecretReconciler>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl UserSync for SecretHashUserSync {
    async fn sync_users(&self, cluster: &GaleraCluster) -> Result<TierAnnotations, Error> {
        let hash = self
            .secrets
            .secret_hash(cluster, &cluster.spec.secrets_name)
            .await?
            .ok_or_else(|| {
                Error::collaborator(
                    "user-sync",
                    cluster.name_any(),
                    format!("users secret {} not found", cluster.spec.secrets_name),
                )
            })?;
        let annotations = BTreeMap::from([(ANNOTATION_USERS_SECRET_HASH.to_string(), hash)]);
        Ok(TierAnnotations {
            database: annotations.clone(),
            proxysql: annotations,
        })
    }

    async fn resync_proxysql_users(&self, cluster: &GaleraCluster) -> Result<(), Error> {
        let name = &cluster.spec.secrets_name;
        if self.secrets.secret_hash(cluster, name).await?.is_none() {
            return Err(Error::collaborator(
                "proxysql-resync",
                cluster.name_any(),
                format!("users secret {name} not found"),
            ));
        }
        debug!(cluster = %cluster.name_any(), "proxysql users picked up on next proxysql rollout");
        Ok(())
    }
}

/// Backup reconciler that only manages the PITR collector lifecycle
pub struct PitrBackupReconciler {
    deployments: Arc<dyn ObjectStore<Deployment>>,
}

impl PitrBackupReconciler {
    /// Create a reconciler over the given deployment store
    pub fn new(deployments: Arc<dyn ObjectStore<Deployment>>) -> Self {
        Self { deployments }
    }
}

/// Name of the PITR collector deployment
pub fn pitr_deployment_name(cluster: &GaleraCluster) -> String {
    format!("{}-pitr", cluster.name_any())
}

#[async_trait]
impl BackupReconciler for PitrBackupReconciler {
    async fn reconcile_backups(&self, cluster: &GaleraCluster) -> Result<(), Error> {
        if cluster.pitr_enabled() {
            return Ok(());
        }
        // A collector left over from an earlier spec
        self.delete_pitr(cluster).await
    }

    async fn delete_pitr(&self, cluster: &GaleraCluster) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let name = pitr_deployment_name(cluster);
        if delete_if_present(self.deployments.as_ref(), &namespace, &name).await? {
            info!(deployment = %name, "deleted PITR collector");
        }
        Ok(())
    }
}

/// Recovery that deletes every crashed pod so the StatefulSet recreates them
///
/// The database entrypoint bootstraps from the node with the most advanced
/// sequence number when all peers start together.
pub struct RestartPodsRecovery {
    pods: Arc<dyn ObjectStore<Pod>>,
}

impl RestartPodsRecovery {
    /// Create a recovery action over the given pod store
    pub fn new(pods: Arc<dyn ObjectStore<Pod>>) -> Self {
        Self { pods }
    }
}

#[async_trait]
impl RecoveryAction for RestartPodsRecovery {
    async fn recover(&self, cluster: &GaleraCluster, pods: &[String]) -> Result<(), Error> {
        let namespace = cluster.namespace().unwrap_or_default();
        let mut first_error = None;
        for pod in pods {
            if let Err(e) = delete_if_present(self.pods.as_ref(), &namespace, pod).await {
                warn!(pod = %pod, error = %e, "failed to restart crashed pod");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{sample_cluster, secret};
    use crate::store::memory::MemoryStores;

    #[test]
    fn generated_passwords_are_alphanumeric() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LEN);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(password, generate_password());
    }

    #[tokio::test]
    async fn users_secret_is_generated_once() {
        let stores = MemoryStores::new();
        let reconciler = StoreSecretReconciler::new(stores.secrets.clone());
        let cluster = sample_cluster();

        reconciler.ensure_users_secret(&cluster).await.unwrap();
        reconciler.ensure_users_secret(&cluster).await.unwrap();

        assert_eq!(stores.secrets.creates.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stored = stores.secrets.snapshot("db", "prod-secrets").unwrap();
        assert_eq!(stored.data.unwrap().len(), SYSTEM_USERS.len());
    }

    #[tokio::test]
    async fn secret_hash_is_none_for_missing_secret() {
        let stores = MemoryStores::new();
        let reconciler = StoreSecretReconciler::new(stores.secrets.clone());
        let cluster = sample_cluster();

        assert_eq!(reconciler.secret_hash(&cluster, "prod-ssl").await.unwrap(), None);

        stores.secrets.seed(secret("prod-ssl", &[("tls.crt", "cert")]));
        let hash = reconciler.secret_hash(&cluster, "prod-ssl").await.unwrap();
        assert_eq!(hash.map(|h| h.len()), Some(16));
    }

    #[tokio::test]
    async fn user_sync_annotates_both_tiers() {
        let mut secrets = MockSecretReconciler::new();
        secrets
            .expect_secret_hash()
            .returning(|_, _| Ok(Some("abc123".to_string())));
        let sync = SecretHashUserSync::new(Arc::new(secrets));

        let annotations = sync.sync_users(&sample_cluster()).await.unwrap();
        assert_eq!(annotations.database[ANNOTATION_USERS_SECRET_HASH], "abc123");
        assert_eq!(annotations.database, annotations.proxysql);
    }

    #[tokio::test]
    async fn proxysql_resync_fails_without_users_secret() {
        let stores = MemoryStores::new();
        let sync = SecretHashUserSync::new(Arc::new(StoreSecretReconciler::new(
            stores.secrets.clone(),
        )));
        let cluster = sample_cluster();

        let err = sync.resync_proxysql_users(&cluster).await.unwrap_err();
        assert!(err.to_string().contains("proxysql-resync failed for prod"));

        stores.secrets.seed(secret("prod-secrets", &[("root", "pw")]));
        sync.resync_proxysql_users(&cluster).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_pitr_removes_leftover_collector() {
        use k8s_openapi::api::apps::v1::Deployment;

        let stores = MemoryStores::new();
        stores.deployments.seed(Deployment {
            metadata: ObjectMeta {
                name: Some("prod-pitr".to_string()),
                namespace: Some("db".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        let backups = PitrBackupReconciler::new(stores.deployments.clone());

        backups.reconcile_backups(&sample_cluster()).await.unwrap();
        assert_eq!(stores.deployments.len(), 0);

        // Nothing left to delete is not an error
        backups.reconcile_backups(&sample_cluster()).await.unwrap();
    }
}
