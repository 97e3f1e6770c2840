//! In-memory [`ObjectStore`] for tests
//!
//! Mirrors the API server semantics the controller depends on: status is
//! only written through `update_status`, objects with a deletion timestamp
//! disappear once their last finalizer is removed, and every mutating call
//! is counted so tests can assert idempotence.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ObjectStore, Stores};
use galera_common::Error;

/// Operations that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Get,
    Create,
    Update,
    UpdateStatus,
    Delete,
    List,
}

type Key = (String, String);

/// Store holding objects in a map
pub struct MemoryStore<K> {
    kind: &'static str,
    objects: Mutex<BTreeMap<Key, K>>,
    failures: Mutex<Vec<(StoreOp, Option<String>)>>,
    next_uid: AtomicUsize,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub status_updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl<K> MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            failures: Mutex::new(Vec::new()),
            next_uid: AtomicUsize::new(1),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            status_updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        }
    }

    /// Insert an object without counting it as a create
    pub fn seed(&self, mut obj: K) {
        let key = key_of(&obj);
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(self.allocate_uid());
        }
        self.lock().insert(key, obj);
    }

    /// Make every `op` fail, optionally only for object `name`
    pub fn fail(&self, op: StoreOp, name: Option<&str>) {
        self.failures
            .lock()
            .unwrap()
            .push((op, name.map(str::to_string)));
    }

    /// Remove every injected failure
    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn all(&self) -> Vec<K> {
        self.lock().values().cloned().collect()
    }

    /// Create and update calls (status writes excluded)
    pub fn mutations(&self) -> usize {
        self.creates.load(Ordering::SeqCst) + self.updates.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.creates.store(0, Ordering::SeqCst);
        self.updates.store(0, Ordering::SeqCst);
        self.status_updates.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, K>> {
        self.objects.lock().unwrap()
    }

    fn allocate_uid(&self) -> String {
        format!(
            "{}-uid-{}",
            self.kind.to_lowercase(),
            self.next_uid.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn check(&self, op: StoreOp, name: &str) -> Result<(), Error> {
        let failures = self.failures.lock().unwrap();
        let hit = failures
            .iter()
            .any(|(o, n)| *o == op && n.as_deref().map_or(true, |n| n == name));
        if hit {
            return Err(Error::Kube {
                source: kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("injected {op:?} failure on {name}"),
                    reason: "InternalError".to_string(),
                    code: 500,
                }),
            });
        }
        Ok(())
    }

    fn not_found(&self, name: &str) -> Error {
        Error::not_found(self.kind, name)
    }
}

fn key_of<K: Resource>(obj: &K) -> Key {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

/// Copy the `status` field of `from` onto `onto`, going through JSON
fn with_status_of<K: Serialize + DeserializeOwned>(onto: &K, from: &K) -> Result<K, Error> {
    let mut target = serde_json::to_value(onto)?;
    let source = serde_json::to_value(from)?;
    if let Some(map) = target.as_object_mut() {
        match source.get("status") {
            Some(status) => {
                map.insert("status".to_string(), status.clone());
            }
            None => {
                map.remove("status");
            }
        }
    }
    Ok(serde_json::from_value(target)?)
}

#[async_trait]
impl<K> ObjectStore<K> for MemoryStore<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.check(StoreOp::Get, name)?;
        self.snapshot(namespace, name)
            .ok_or_else(|| self.not_found(name))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let key = key_of(obj);
        self.check(StoreOp::Create, &key.1)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock();
        if objects.contains_key(&key) {
            return Err(Error::already_exists(self.kind, &key.1));
        }
        let mut stored = obj.clone();
        stored.meta_mut().uid = Some(self.allocate_uid());
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let key = key_of(obj);
        self.check(StoreOp::Update, &key.1)?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock();
        let current = objects
            .get(&key)
            .ok_or_else(|| self.not_found(&key.1))?;
        let mut stored = with_status_of(obj, current)?;
        stored.meta_mut().uid = current.meta().uid.clone();

        let finalized = stored.meta().deletion_timestamp.is_some()
            && stored.meta().finalizers.as_ref().map_or(true, Vec::is_empty);
        if finalized {
            objects.remove(&key);
        } else {
            objects.insert(key, stored.clone());
        }
        Ok(stored)
    }

    async fn update_status(&self, obj: &K) -> Result<(), Error> {
        let key = key_of(obj);
        self.check(StoreOp::UpdateStatus, &key.1)?;
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        let mut objects = self.lock();
        let current = objects
            .get(&key)
            .ok_or_else(|| self.not_found(&key.1))?;
        let stored = with_status_of(current, obj)?;
        objects.insert(key, stored);
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        self.check(StoreOp::Delete, name)?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.lock()
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| self.not_found(name))
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, Error> {
        self.check(StoreOp::List, namespace)?;
        Ok(self
            .lock()
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|(_, obj)| {
                let labels = obj.meta().labels.clone().unwrap_or_default();
                selector.iter().all(|(k, v)| labels.get(k) == Some(v))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

/// Memory stores for every kind, with typed handles kept for assertions
pub struct MemoryStores {
    pub clusters: Arc<MemoryStore<galera_common::crd::GaleraCluster>>,
    pub stateful_sets: Arc<MemoryStore<k8s_openapi::api::apps::v1::StatefulSet>>,
    pub services: Arc<MemoryStore<k8s_openapi::api::core::v1::Service>>,
    pub config_maps: Arc<MemoryStore<k8s_openapi::api::core::v1::ConfigMap>>,
    pub pdbs: Arc<MemoryStore<k8s_openapi::api::policy::v1::PodDisruptionBudget>>,
    pub pods: Arc<MemoryStore<k8s_openapi::api::core::v1::Pod>>,
    pub pvcs: Arc<MemoryStore<k8s_openapi::api::core::v1::PersistentVolumeClaim>>,
    pub secrets: Arc<MemoryStore<k8s_openapi::api::core::v1::Secret>>,
    pub deployments: Arc<MemoryStore<k8s_openapi::api::apps::v1::Deployment>>,
}

impl Default for MemoryStores {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStores {
    pub fn new() -> Self {
        Self {
            clusters: Arc::new(MemoryStore::new("GaleraCluster")),
            stateful_sets: Arc::new(MemoryStore::new("StatefulSet")),
            services: Arc::new(MemoryStore::new("Service")),
            config_maps: Arc::new(MemoryStore::new("ConfigMap")),
            pdbs: Arc::new(MemoryStore::new("PodDisruptionBudget")),
            pods: Arc::new(MemoryStore::new("Pod")),
            pvcs: Arc::new(MemoryStore::new("PersistentVolumeClaim")),
            secrets: Arc::new(MemoryStore::new("Secret")),
            deployments: Arc::new(MemoryStore::new("Deployment")),
        }
    }

    /// Erase the concrete types for the controller
    pub fn stores(&self) -> Stores {
        Stores {
            clusters: self.clusters.clone(),
            stateful_sets: self.stateful_sets.clone(),
            services: self.services.clone(),
            config_maps: self.config_maps.clone(),
            pdbs: self.pdbs.clone(),
            pods: self.pods.clone(),
            pvcs: self.pvcs.clone(),
            secrets: self.secrets.clone(),
            deployments: self.deployments.clone(),
        }
    }

    /// Create and update calls summed over every child kind
    pub fn child_mutations(&self) -> usize {
        self.stateful_sets.mutations()
            + self.services.mutations()
            + self.config_maps.mutations()
            + self.pdbs.mutations()
            + self.pods.mutations()
            + self.pvcs.mutations()
            + self.deployments.mutations()
    }

    pub fn reset_counters(&self) {
        self.clusters.reset_counters();
        self.stateful_sets.reset_counters();
        self.services.reset_counters();
        self.config_maps.reset_counters();
        self.pdbs.reset_counters();
        self.pods.reset_counters();
        self.pvcs.reset_counters();
        self.secrets.reset_counters();
        self.deployments.reset_counters();
    }
}
