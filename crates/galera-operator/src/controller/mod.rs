//! GaleraCluster controller
//!
//! [`reconcile`] is the per-cluster state machine. It serialises with the
//! scheduled version check through [`locks::LockRegistry`] and then either
//! tears the cluster down ([`teardown`]) or converges every tier
//! ([`converge`]).

pub mod converge;
pub mod locks;
pub mod reconcile;
pub mod recovery;
pub mod scheduler;
pub mod teardown;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dashmap::DashMap;
use kube::Client;

use galera_common::events::{EventPublisher, KubeEventPublisher};
use galera_common::Error;

use crate::collaborators::{
    BackupReconciler, PitrBackupReconciler, RecoveryAction, RestartPodsRecovery,
    SecretHashUserSync, SecretReconciler, StoreSecretReconciler, UserSync,
};
use crate::config::ControllerConfig;
use crate::status::{StatefulSetStatusHook, StatusHook};
use crate::store::Stores;
use crate::version::{HttpVersionResolver, VersionResolver};

pub use locks::{LockRegistry, ReconcileLock, Throttle};
pub use reconcile::{error_policy, reconcile};
pub use scheduler::JobRegistry;

/// Shared context for the GaleraCluster controller
///
/// Holds every collaborator behind a trait object so tests can swap them,
/// plus the process-wide lock and job registries.
///
/// ```text
/// let ctx = Context::builder(client, config)
///     .version_resolver(resolver)
///     .build()?;
/// ```
pub struct Context {
    /// Object stores for the cluster and every child kind
    pub stores: Stores,
    /// Internal account synchronisation
    pub users: Arc<dyn UserSync>,
    /// Users secret and TLS material
    pub secrets: Arc<dyn SecretReconciler>,
    /// Backup resources and the PITR collector
    pub backups: Arc<dyn BackupReconciler>,
    /// Full-crash recovery
    pub recovery: Arc<dyn RecoveryAction>,
    /// Version service client
    pub versions: Arc<dyn VersionResolver>,
    /// End-of-pass status reporting
    pub status: Arc<dyn StatusHook>,
    /// Kubernetes Event publisher
    pub events: Arc<dyn EventPublisher>,
    /// One lock per cluster key, never evicted
    pub locks: LockRegistry,
    /// Scheduled version checks
    pub jobs: JobRegistry,
    /// In-flight ProxySQL resyncs, one flag per cluster key
    pub resyncs: DashMap<String, Arc<AtomicBool>>,
    /// Operator settings
    pub config: ControllerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ControllerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Context wired to in-memory stores and the given collaborators
    #[cfg(test)]
    pub fn for_testing(
        stores: Stores,
        users: Arc<dyn UserSync>,
        versions: Arc<dyn VersionResolver>,
        recovery: Arc<dyn RecoveryAction>,
    ) -> Self {
        use galera_common::events::NoopEventPublisher;

        let secrets: Arc<dyn SecretReconciler> =
            Arc::new(StoreSecretReconciler::new(stores.secrets.clone()));
        Self {
            users,
            secrets,
            backups: Arc::new(PitrBackupReconciler::new(stores.deployments.clone())),
            recovery,
            versions,
            status: Arc::new(StatefulSetStatusHook::new(
                stores.clusters.clone(),
                stores.stateful_sets.clone(),
            )),
            events: Arc::new(NoopEventPublisher),
            locks: LockRegistry::new(),
            jobs: JobRegistry::new(),
            resyncs: DashMap::new(),
            config: ControllerConfig::default(),
            stores,
        }
    }

    /// The resync flag for `key`, created on first use
    pub(crate) fn resync_flag(&self, key: &str) -> Arc<AtomicBool> {
        self.resyncs
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator defaults to the implementation backed by the
/// Kubernetes client; the setters exist to replace them.
pub struct ContextBuilder {
    client: Client,
    config: ControllerConfig,
    stores: Option<Stores>,
    users: Option<Arc<dyn UserSync>>,
    secrets: Option<Arc<dyn SecretReconciler>>,
    backups: Option<Arc<dyn BackupReconciler>>,
    recovery: Option<Arc<dyn RecoveryAction>>,
    versions: Option<Arc<dyn VersionResolver>>,
    status: Option<Arc<dyn StatusHook>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client, config: ControllerConfig) -> Self {
        Self {
            client,
            config,
            stores: None,
            users: None,
            secrets: None,
            backups: None,
            recovery: None,
            versions: None,
            status: None,
            events: None,
        }
    }

    /// Override the object stores
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Override user synchronisation
    pub fn user_sync(mut self, users: Arc<dyn UserSync>) -> Self {
        self.users = Some(users);
        self
    }

    /// Override the secret reconciler
    pub fn secret_reconciler(mut self, secrets: Arc<dyn SecretReconciler>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Override the backup reconciler
    pub fn backup_reconciler(mut self, backups: Arc<dyn BackupReconciler>) -> Self {
        self.backups = Some(backups);
        self
    }

    /// Override the crash recovery action
    pub fn recovery_action(mut self, recovery: Arc<dyn RecoveryAction>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Override the version service client
    pub fn version_resolver(mut self, versions: Arc<dyn VersionResolver>) -> Self {
        self.versions = Some(versions);
        self
    }

    /// Override the status hook
    pub fn status_hook(mut self, status: Arc<dyn StatusHook>) -> Self {
        self.status = Some(status);
        self
    }

    /// Override the event publisher
    pub fn event_publisher(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let stores = self
            .stores
            .unwrap_or_else(|| Stores::from_client(self.client.clone()));
        let secrets = self
            .secrets
            .unwrap_or_else(|| Arc::new(StoreSecretReconciler::new(stores.secrets.clone())));
        let users = self
            .users
            .unwrap_or_else(|| Arc::new(SecretHashUserSync::new(secrets.clone())));
        let versions = match self.versions {
            Some(v) => v,
            None => Arc::new(HttpVersionResolver::new()?),
        };

        Ok(Context {
            users,
            secrets,
            backups: self
                .backups
                .unwrap_or_else(|| Arc::new(PitrBackupReconciler::new(stores.deployments.clone()))),
            recovery: self
                .recovery
                .unwrap_or_else(|| Arc::new(RestartPodsRecovery::new(stores.pods.clone()))),
            versions,
            status: self.status.unwrap_or_else(|| {
                Arc::new(StatefulSetStatusHook::new(
                    stores.clusters.clone(),
                    stores.stateful_sets.clone(),
                ))
            }),
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    galera_common::FIELD_MANAGER,
                ))
            }),
            locks: LockRegistry::new(),
            jobs: JobRegistry::new(),
            resyncs: DashMap::new(),
            config: self.config,
            stores,
        })
    }
}
