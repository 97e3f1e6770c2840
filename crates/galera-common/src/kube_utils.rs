//! Kubernetes utilities shared by the controller and its collaborators
//!
//! Label sets, owner links, and content hashing for managed child resources.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::ByteString;
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::crd::{GaleraCluster, Tier};
use crate::Error;

/// Label: application name
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
/// Label: owning cluster
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
/// Label: tier component (`db`, `haproxy`, `proxysql`)
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
/// Label: managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Label: umbrella application
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Value of [`LABEL_NAME`] on every managed object
pub const APP_NAME: &str = "galera-cluster";

/// The "Ready" condition type for pods
pub const CONDITION_READY: &str = "Ready";
/// The "True" status value for conditions
pub const STATUS_TRUE: &str = "True";

/// Labels identifying the objects of one tier of one cluster
///
/// Used both as object labels and as the workload's pod selector, so the
/// set must never change for an existing tier.
pub fn tier_labels(cluster: &str, tier: Tier) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (LABEL_INSTANCE.to_string(), cluster.to_string()),
        (LABEL_COMPONENT.to_string(), tier.component().to_string()),
        (LABEL_MANAGED_BY.to_string(), crate::FIELD_MANAGER.to_string()),
        (LABEL_PART_OF.to_string(), APP_NAME.to_string()),
    ])
}

/// Render a label map as a `k=v,k=v` selector string
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Controller owner reference pointing at `cluster`
///
/// Fails when the cluster has not been persisted yet (no uid).
pub fn controller_owner_ref(cluster: &GaleraCluster) -> Result<OwnerReference, Error> {
    cluster.controller_owner_ref(&()).ok_or_else(|| {
        Error::internal_with_context(
            "owner_reference",
            format!("cluster {} has no uid", cluster.name_any()),
        )
    })
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Uses truncated SHA-256 for stability across Rust toolchain versions.
/// `DefaultHasher` is NOT guaranteed stable across Rust releases, so this
/// function should be used whenever the hash is persisted (e.g., K8s annotations).
pub fn deterministic_hash(input: &str) -> String {
    hash_bytes(input.as_bytes())
}

fn hash_bytes(input: &[u8]) -> String {
    let digest = Sha256::digest(input);
    digest[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hash a Secret's data map
///
/// Keys are visited in order, and each key and value is length-prefixed
/// so that moving bytes between entries changes the hash.
pub fn hash_secret_data(data: &BTreeMap<String, ByteString>) -> String {
    let mut buf = Vec::new();
    for (key, value) in data {
        buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(value.0.len() as u64).to_be_bytes());
        buf.extend_from_slice(&value.0);
    }
    hash_bytes(&buf)
}

/// Merge `extra` into the pod template annotations, overwriting duplicates
pub fn merge_template_annotations(
    template: &mut PodTemplateSpec,
    extra: &BTreeMap<String, String>,
) {
    if extra.is_empty() {
        return;
    }
    let meta = template.metadata.get_or_insert_with(Default::default);
    let annotations = meta.annotations.get_or_insert_with(BTreeMap::new);
    annotations.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
}

/// True if the pod's Ready condition is True
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == CONDITION_READY && c.status == STATUS_TRUE)
        })
}

/// Total container restarts for the pod
pub fn pod_restart_count(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| cs.iter().map(|c| c.restart_count).sum())
        .unwrap_or(0)
}

/// Image the named container is actually running, as reported by the kubelet
pub fn running_image<'a>(pod: &'a Pod, container: &str) -> Option<&'a str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|c| c.name == container)
        .map(|c| c.image.as_str())
        .filter(|image| !image.is_empty())
}
