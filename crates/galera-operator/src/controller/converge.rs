//! Convergence pipeline
//!
//! Tiers are processed in order Database, HaProxy, ProxySql. An enabled
//! tier runs through the stages config maps, content hashes, workload,
//! services and disruption budget. A disabled routing tier has its
//! workload and services removed.
//!
//! Every stage compares before it writes, so a pass over an unchanged
//! cluster issues no create or update calls.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service, ServicePort};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use galera_common::crd::{GaleraCluster, Tier};
use galera_common::events::{actions, reasons};
use galera_common::kube_utils::merge_template_annotations;
use galera_common::{
    Error, ANNOTATION_CONFIG_HASH, ANNOTATION_SSL_HASH, ANNOTATION_SSL_INTERNAL_HASH,
    ANNOTATION_VAULT_CONFIG_HASH,
};

use super::teardown::{delete_workload, Finalizer};
use super::Context;
use crate::collaborators::TierAnnotations;
use crate::manifests;
use crate::store::{delete_if_present, get_opt};

/// Run every tier through the pipeline
///
/// Store errors stop the pipeline immediately. Any other tier failure is
/// logged, the remaining tiers still run, and the first failure is
/// returned.
pub async fn converge(
    cluster: &GaleraCluster,
    ctx: &Context,
    annotations: &TierAnnotations,
) -> Result<(), Error> {
    let mut first_error = None;
    let no_annotations = BTreeMap::new();

    if let Err(e) = ctx.secrets.reconcile_tls(cluster).await {
        if e.is_store_error() {
            return Err(e);
        }
        warn!(error = %e, "TLS reconciliation failed");
        first_error = Some(e);
    }

    for tier in Tier::ALL {
        let result = if cluster.tier_enabled(tier) {
            let extra = match tier {
                Tier::Database => &annotations.database,
                Tier::ProxySql => &annotations.proxysql,
                Tier::HaProxy => &no_annotations,
            };
            converge_tier(cluster, ctx, tier, extra).await
        } else {
            remove_tier(cluster, ctx, tier).await
        };

        if let Err(e) = result {
            if e.is_store_error() {
                return Err(e);
            }
            warn!(%tier, error = %e, "tier failed to converge");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn converge_tier(
    cluster: &GaleraCluster,
    ctx: &Context,
    tier: Tier,
    user_annotations: &BTreeMap<String, String>,
) -> Result<(), Error> {
    let config_maps = manifests::config_maps(cluster, tier)?;
    for desired in &config_maps {
        ensure_config_map(ctx, desired).await?;
    }

    let mut template_annotations = content_hashes(cluster, ctx, tier, &config_maps).await?;
    template_annotations.extend(user_annotations.clone());

    let mut workload = manifests::stateful_set(cluster, tier)?;
    if let Some(spec) = workload.spec.as_mut() {
        merge_template_annotations(&mut spec.template, &template_annotations);
    }
    ensure_workload(ctx, &workload).await?;

    for desired in manifests::services(cluster, tier)? {
        ensure_service(ctx, &desired).await?;
    }

    if let Some(desired) = manifests::pod_disruption_budget(cluster, tier)? {
        ensure_pod_disruption_budget(ctx, &desired).await?;
    }
    Ok(())
}

async fn remove_tier(cluster: &GaleraCluster, ctx: &Context, tier: Tier) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    // Only ProxySQL has a finalizer asking for its volumes on removal
    let delete_pvcs = tier == Tier::ProxySql
        && cluster
            .finalizers()
            .iter()
            .any(|f| f == Finalizer::DeleteProxySqlPvc.as_str());

    let mut removed = delete_workload(cluster, ctx, tier, delete_pvcs).await?;
    for name in manifests::service_names(cluster, tier) {
        removed |= delete_if_present(ctx.stores.services.as_ref(), &namespace, &name).await?;
    }

    if removed {
        info!(%tier, "removed disabled tier");
        ctx.events
            .publish(
                &cluster.object_ref(&()),
                EventType::Normal,
                reasons::TIER_DISABLED,
                actions::RECONCILE,
                Some(format!("{tier} disabled, workload and services removed")),
            )
            .await;
    }
    Ok(())
}

/// Hash annotations for the tier's pod template
///
/// A changed hash changes the template, which rolls the tier's pods.
async fn content_hashes(
    cluster: &GaleraCluster,
    ctx: &Context,
    tier: Tier,
    config_maps: &[ConfigMap],
) -> Result<BTreeMap<String, String>, Error> {
    let mut hashes = BTreeMap::new();
    let name = cluster.name_any();

    if cluster.version_at_least("1.1.0") {
        hashes.insert(
            ANNOTATION_CONFIG_HASH.to_string(),
            manifests::config_hash(config_maps),
        );
    }

    let tls_gate = match tier {
        Tier::HaProxy => "1.5.0",
        _ => "1.1.0",
    };
    if cluster.version_at_least(tls_gate) {
        let ssl = &cluster.spec.ssl_secret_name;
        match ctx.secrets.secret_hash(cluster, ssl).await? {
            Some(hash) => {
                hashes.insert(ANNOTATION_SSL_HASH.to_string(), hash);
            }
            None if cluster.spec.allow_unsafe_configurations => {
                debug!(%tier, secret = %ssl, "TLS secret missing, allowed by unsafe configuration");
            }
            None => {
                return Err(Error::collaborator(
                    "tls",
                    name,
                    format!("secret {ssl} not found"),
                ));
            }
        }

        let internal = &cluster.spec.ssl_internal_secret_name;
        if let Some(hash) = ctx.secrets.secret_hash(cluster, internal).await? {
            hashes.insert(ANNOTATION_SSL_INTERNAL_HASH.to_string(), hash);
        }
    }

    if tier == Tier::Database && cluster.version_at_least("1.6.0") {
        let vault = &cluster.spec.vault_secret_name;
        if let Some(hash) = ctx.secrets.secret_hash(cluster, vault).await? {
            hashes.insert(ANNOTATION_VAULT_CONFIG_HASH.to_string(), hash);
        }
    }

    Ok(hashes)
}

async fn ensure_config_map(ctx: &Context, desired: &ConfigMap) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    match get_opt(ctx.stores.config_maps.as_ref(), &namespace, &desired.name_any()).await? {
        None => {
            ctx.stores.config_maps.create(desired).await?;
            debug!(config_map = %desired.name_any(), "created config map");
        }
        Some(mut current) if current.data != desired.data => {
            current.data = desired.data.clone();
            ctx.stores.config_maps.update(&current).await?;
            debug!(config_map = %desired.name_any(), "updated config map");
        }
        Some(_) => {}
    }
    Ok(())
}

fn container_images(sts: &StatefulSet) -> Vec<(String, Option<String>)> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .map(|c| (c.name.clone(), c.image.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn template_annotations(sts: &StatefulSet) -> BTreeMap<String, String> {
    sts.spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default()
}

/// Whether replicas, pod template annotations or images drifted
pub fn workload_needs_update(current: &StatefulSet, desired: &StatefulSet) -> bool {
    let replicas = |s: &StatefulSet| s.spec.as_ref().and_then(|s| s.replicas);
    if replicas(current) != replicas(desired) {
        return true;
    }
    let current_annotations = template_annotations(current);
    let annotations_drifted = template_annotations(desired)
        .iter()
        .any(|(k, v)| current_annotations.get(k) != Some(v));
    annotations_drifted || container_images(current) != container_images(desired)
}

async fn ensure_workload(ctx: &Context, desired: &StatefulSet) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();
    let Some(mut current) = get_opt(ctx.stores.stateful_sets.as_ref(), &namespace, &name).await?
    else {
        ctx.stores.stateful_sets.create(desired).await?;
        info!(workload = %name, "created workload");
        return Ok(());
    };

    if !workload_needs_update(&current, desired) {
        return Ok(());
    }
    let desired_spec = desired.spec.clone().unwrap_or_default();
    let Some(spec) = current.spec.as_mut() else {
        return Err(Error::convergence(
            name,
            "existing workload has no spec",
        ));
    };
    // Identity fields (selector, service name, claim templates) are immutable
    spec.replicas = desired_spec.replicas;
    spec.template = desired_spec.template;
    ctx.stores.stateful_sets.update(&current).await?;
    info!(workload = %name, "updated workload pod spec");
    Ok(())
}

fn port_key(port: &ServicePort) -> (Option<&str>, i32, &str, Option<&IntOrString>) {
    (
        port.name.as_deref(),
        port.port,
        port.protocol.as_deref().unwrap_or("TCP"),
        port.target_port.as_ref(),
    )
}

/// Compare two port lists by name, port, protocol and target port
///
/// Order does not matter.
pub fn ports_equal(a: &[ServicePort], b: &[ServicePort]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut a: Vec<_> = a.iter().map(port_key).collect();
    let mut b: Vec<_> = b.iter().map(port_key).collect();
    a.sort_by(|x, y| x.0.cmp(&y.0));
    b.sort_by(|x, y| x.0.cmp(&y.0));
    a == b
}

/// Whether the current Service differs from the desired one in anything
/// the controller manages
pub fn service_needs_update(current: &Service, desired: &Service) -> bool {
    let empty = Default::default();
    let cur = current.spec.as_ref().unwrap_or(&empty);
    let des = desired.spec.as_ref().unwrap_or(&empty);

    let service_type = |s: &k8s_openapi::api::core::v1::ServiceSpec| {
        s.type_.clone().unwrap_or_else(|| "ClusterIP".to_string())
    };
    let ranges = |s: &k8s_openapi::api::core::v1::ServiceSpec| {
        s.load_balancer_source_ranges.clone().unwrap_or_default()
    };

    !ports_equal(
        cur.ports.as_deref().unwrap_or_default(),
        des.ports.as_deref().unwrap_or_default(),
    ) || service_type(cur) != service_type(des)
        || cur.external_traffic_policy != des.external_traffic_policy
        || cur.selector != des.selector
        || ranges(cur) != ranges(des)
        || current.annotations() != desired.annotations()
        || current.labels() != desired.labels()
}

/// Desired Service carrying over what the API server allocated
fn merge_service(mut current: Service, desired: &Service) -> Service {
    let previous = current.spec.take().unwrap_or_default();
    let mut spec = desired.spec.clone().unwrap_or_default();

    spec.cluster_ip = previous.cluster_ip;
    spec.cluster_ips = previous.cluster_ips;
    spec.ip_families = previous.ip_families;

    let service_type = spec.type_.as_deref().unwrap_or("ClusterIP");
    if matches!(service_type, "NodePort" | "LoadBalancer") {
        let allocated: BTreeMap<String, i32> = previous
            .ports
            .iter()
            .flatten()
            .filter_map(|p| Some((p.name.clone()?, p.node_port?)))
            .collect();
        for port in spec.ports.iter_mut().flatten() {
            if port.node_port.is_none() {
                port.node_port = port.name.as_ref().and_then(|n| allocated.get(n).copied());
            }
        }
        if service_type == "LoadBalancer" {
            spec.health_check_node_port = previous.health_check_node_port;
        }
    }

    current.spec = Some(spec);
    current.metadata.labels = desired.metadata.labels.clone();
    current.metadata.annotations = desired.metadata.annotations.clone();
    current
}

async fn ensure_service(ctx: &Context, desired: &Service) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    match get_opt(ctx.stores.services.as_ref(), &namespace, &desired.name_any()).await? {
        None => {
            ctx.stores.services.create(desired).await?;
            debug!(service = %desired.name_any(), "created service");
        }
        Some(current) if service_needs_update(&current, desired) => {
            let updated = merge_service(current, desired);
            ctx.stores.services.update(&updated).await?;
            info!(service = %desired.name_any(), "updated service");
        }
        Some(_) => {}
    }
    Ok(())
}

async fn ensure_pod_disruption_budget(
    ctx: &Context,
    desired: &PodDisruptionBudget,
) -> Result<(), Error> {
    let namespace = desired.namespace().unwrap_or_default();
    match get_opt(ctx.stores.pdbs.as_ref(), &namespace, &desired.name_any()).await? {
        None => {
            ctx.stores.pdbs.create(desired).await?;
        }
        Some(mut current) => {
            current.spec = desired.spec.clone();
            ctx.stores.pdbs.update(&current).await?;
        }
    }
    Ok(())
}
