//! Object store seam between the controller and the Kubernetes API
//!
//! Every read and write the controller performs goes through
//! [`ObjectStore`], so reconciliation can run against an in-memory store in
//! tests. Not-found and already-exists surface as their own error variants.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;

use galera_common::crd::GaleraCluster;
use galera_common::kube_utils::label_selector;
use galera_common::{Error, FIELD_MANAGER};

#[cfg(test)]
pub(crate) mod memory;

/// CRUD access to one kind of namespaced object
#[async_trait]
pub trait ObjectStore<K>: Send + Sync {
    /// Fetch an object; [`Error::NotFound`] if absent
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error>;

    /// Create an object; [`Error::AlreadyExists`] if the name is taken
    async fn create(&self, obj: &K) -> Result<K, Error>;

    /// Replace an object's spec and metadata
    async fn update(&self, obj: &K) -> Result<K, Error>;

    /// Write only the status of an object
    async fn update_status(&self, obj: &K) -> Result<(), Error>;

    /// Delete an object; [`Error::NotFound`] if absent
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// List objects whose labels contain every entry of `selector`
    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, Error>;
}

/// [`ObjectStore`] backed by the Kubernetes API
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    /// Create a store for `K` using the given client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

fn object_name<K: Resource>(obj: &K) -> Result<(String, String), Error> {
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or_else(|| Error::internal_with_context("store", "object has no name"))?;
    let namespace = obj
        .meta()
        .namespace
        .clone()
        .ok_or_else(|| Error::internal_with_context("store", format!("{name} has no namespace")))?;
    Ok((namespace, name))
}

#[async_trait]
impl<K> ObjectStore<K> for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), name, e))
    }

    async fn create(&self, obj: &K) -> Result<K, Error> {
        let (namespace, name) = object_name(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), name, e))
    }

    async fn update(&self, obj: &K) -> Result<K, Error> {
        let (namespace, name) = object_name(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        api.replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), name, e))
    }

    async fn update_status(&self, obj: &K) -> Result<(), Error> {
        let (namespace, name) = object_name(obj)?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        let value = serde_json::to_value(obj)?;
        let patch = serde_json::json!({
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null)
        });
        api.patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), name, e))?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), name, e))?;
        Ok(())
    }

    async fn list(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<K>, Error> {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&label_selector(selector));
        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(K::kind(&()), namespace, e))?;
        Ok(list.items)
    }
}

/// The stores the controller works with, one per kind
#[derive(Clone)]
pub struct Stores {
    /// GaleraCluster entities
    pub clusters: Arc<dyn ObjectStore<GaleraCluster>>,
    /// Tier workloads
    pub stateful_sets: Arc<dyn ObjectStore<StatefulSet>>,
    /// Tier network endpoints
    pub services: Arc<dyn ObjectStore<Service>>,
    /// Tier configuration artifacts
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    /// Tier disruption budgets
    pub pdbs: Arc<dyn ObjectStore<PodDisruptionBudget>>,
    /// Tier pods (drain and crash detection)
    pub pods: Arc<dyn ObjectStore<Pod>>,
    /// Tier volumes
    pub pvcs: Arc<dyn ObjectStore<PersistentVolumeClaim>>,
    /// TLS, vault and user secrets
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    /// Auxiliary deployments (PITR collector)
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
}

impl Stores {
    /// Kubernetes-backed stores sharing one client
    pub fn from_client(client: Client) -> Self {
        Self {
            clusters: Arc::new(KubeStore::new(client.clone())),
            stateful_sets: Arc::new(KubeStore::new(client.clone())),
            services: Arc::new(KubeStore::new(client.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone())),
            pdbs: Arc::new(KubeStore::new(client.clone())),
            pods: Arc::new(KubeStore::new(client.clone())),
            pvcs: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            deployments: Arc::new(KubeStore::new(client)),
        }
    }
}

/// Fetch an object, mapping not-found to `None`
pub async fn get_opt<K>(
    store: &dyn ObjectStore<K>,
    namespace: &str,
    name: &str,
) -> Result<Option<K>, Error> {
    match store.get(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Delete an object, treating not-found as success
///
/// Returns whether an object was actually deleted.
pub async fn delete_if_present<K>(
    store: &dyn ObjectStore<K>,
    namespace: &str,
    name: &str,
) -> Result<bool, Error> {
    match store.delete(namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
