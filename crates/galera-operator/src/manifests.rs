//! Desired-state manifests for each tier
//!
//! Pure functions from a [`GaleraCluster`] and a [`Tier`] to the child
//! objects that tier needs. Nothing here talks to the API server; the
//! convergence stages compare these against what exists.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretKeySelector, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use galera_common::crd::{
    GaleraCluster, IntOrPercent, PodResources, ProxyTierSpec, ResourceList, Tier,
};
use galera_common::kube_utils::{controller_owner_ref, deterministic_hash, tier_labels};
use galera_common::Error;

/// Port of the MySQL protocol
pub const MYSQL_PORT: i32 = 3306;
/// Port of the MySQL admin interface
pub const MYSQL_ADMIN_PORT: i32 = 33062;

const DEFAULT_DATABASE_STORAGE: &str = "6Gi";
const DEFAULT_PROXYSQL_STORAGE: &str = "2Gi";

/// Memory budgeted per connection when sizing `max_connections`
const BYTES_PER_CONNECTION: u64 = 12_582_880;

/// Data key of the database user configuration
pub const DATABASE_CONFIG_KEY: &str = "init.cnf";
/// Data key of the generated database tuning
pub const AUTO_CONFIG_KEY: &str = "auto-config.cnf";
/// Data key of the log collector configuration
pub const LOG_COLLECTOR_CONFIG_KEY: &str = "fluentbit_custom.conf";
/// Data key of the HAProxy configuration
pub const HAPROXY_CONFIG_KEY: &str = "haproxy-global.cfg";
/// Data key of the ProxySQL configuration
pub const PROXYSQL_CONFIG_KEY: &str = "proxysql.cnf";

fn object_meta(cluster: &GaleraCluster, name: String, tier: Tier) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(tier_labels(&cluster.name_any(), tier)),
        owner_references: Some(vec![controller_owner_ref(cluster)?]),
        ..Default::default()
    })
}

// =============================================================================
// Config maps
// =============================================================================

/// Name of the generated tuning config map for the database tier
pub fn auto_config_name(cluster: &GaleraCluster) -> String {
    format!("auto-{}", Tier::Database.workload_name(&cluster.name_any()))
}

/// Name of the user configuration config map for `tier`
pub fn config_map_name(cluster: &GaleraCluster, tier: Tier) -> String {
    tier.workload_name(&cluster.name_any())
}

/// Name of the log collector config map
pub fn log_collector_config_name(cluster: &GaleraCluster) -> String {
    format!("{}-logcollector", cluster.name_any())
}

fn config_map(
    cluster: &GaleraCluster,
    tier: Tier,
    name: String,
    key: &str,
    content: String,
) -> Result<ConfigMap, Error> {
    Ok(ConfigMap {
        metadata: object_meta(cluster, name, tier)?,
        data: Some(BTreeMap::from([(key.to_string(), content)])),
        ..Default::default()
    })
}

/// Parse a Kubernetes memory quantity into bytes
pub fn parse_memory_bytes(quantity: &str) -> Option<u64> {
    const SUFFIXES: [(&str, f64); 10] = [
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("K", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("", 1.0),
    ];
    let quantity = quantity.trim();
    SUFFIXES.iter().find_map(|(suffix, factor)| {
        let number = quantity.strip_suffix(suffix)?;
        let value: f64 = number.parse().ok()?;
        (value >= 0.0).then(|| (value * factor) as u64)
    })
}

/// Tuning derived from the database memory limit, or request if no limit
pub fn auto_tune_config(cluster: &GaleraCluster) -> Result<Option<String>, Error> {
    let Some(memory) = cluster
        .spec
        .database
        .resources
        .as_ref()
        .and_then(PodResources::effective_memory)
    else {
        return Ok(None);
    };
    let bytes = parse_memory_bytes(memory).ok_or_else(|| {
        Error::validation_for_field(
            cluster.name_any(),
            "spec.database.resources",
            format!("invalid memory quantity '{memory}'"),
        )
    })?;
    let buffer_pool = bytes / 4 * 3;
    let max_connections = bytes / BYTES_PER_CONNECTION;
    Ok(Some(format!(
        "[mysqld]\ninnodb_buffer_pool_size={buffer_pool}\nmax_connections={max_connections}\n"
    )))
}

/// Config maps `tier` should have
///
/// A tier without configuration text gets no config map; an existing one
/// is left alone.
pub fn config_maps(cluster: &GaleraCluster, tier: Tier) -> Result<Vec<ConfigMap>, Error> {
    let mut maps = Vec::new();
    match tier {
        Tier::Database => {
            if cluster.version_at_least("1.3.0") {
                if let Some(content) = auto_tune_config(cluster)? {
                    maps.push(config_map(
                        cluster,
                        tier,
                        auto_config_name(cluster),
                        AUTO_CONFIG_KEY,
                        content,
                    )?);
                }
            }
            let db = &cluster.spec.database;
            if !db.configuration.is_empty() {
                maps.push(config_map(
                    cluster,
                    tier,
                    config_map_name(cluster, tier),
                    DATABASE_CONFIG_KEY,
                    db.configuration.clone(),
                )?);
            }
            let log_config = cluster
                .spec
                .log_collector
                .as_ref()
                .map(|l| l.configuration.as_str())
                .unwrap_or("");
            if !log_config.is_empty() && cluster.version_at_least("1.7.0") {
                maps.push(config_map(
                    cluster,
                    tier,
                    log_collector_config_name(cluster),
                    LOG_COLLECTOR_CONFIG_KEY,
                    log_config.to_string(),
                )?);
            }
        }
        Tier::HaProxy | Tier::ProxySql => {
            let key = match tier {
                Tier::HaProxy => HAPROXY_CONFIG_KEY,
                _ => PROXYSQL_CONFIG_KEY,
            };
            if let Some(spec) = cluster.routing_tier(tier) {
                if !spec.configuration.is_empty() {
                    maps.push(config_map(
                        cluster,
                        tier,
                        config_map_name(cluster, tier),
                        key,
                        spec.configuration.clone(),
                    )?);
                }
            }
        }
    }
    Ok(maps)
}

/// Hash of all configuration a tier's pods consume
pub fn config_hash(maps: &[ConfigMap]) -> String {
    let mut input = String::new();
    for map in maps {
        input.push_str(&map.name_any());
        input.push('\n');
        for (key, value) in map.data.iter().flatten() {
            input.push_str(key);
            input.push('=');
            input.push_str(value);
            input.push('\n');
        }
    }
    deterministic_hash(&input)
}

// =============================================================================
// Workloads
// =============================================================================

fn quantities(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = [("memory", &list.memory), ("cpu", &list.cpu)]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), Quantity(v.clone()))))
        .collect();
    (!map.is_empty()).then_some(map)
}

fn resource_requirements(resources: Option<&PodResources>) -> Option<ResourceRequirements> {
    let resources = resources.filter(|r| !r.is_empty())?;
    Some(ResourceRequirements {
        requests: resources.requests.as_ref().and_then(quantities),
        limits: resources.limits.as_ref().and_then(quantities),
        ..Default::default()
    })
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn config_volume(name: &str, config_map: String) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map,
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume_claim(name: &str, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

struct PodLayout {
    container: Container,
    volumes: Vec<Volume>,
    claims: Vec<PersistentVolumeClaim>,
}

fn database_layout(cluster: &GaleraCluster) -> PodLayout {
    let db = &cluster.spec.database;
    let mut ports = vec![
        container_port("mysql", MYSQL_PORT),
        container_port("sst", 4444),
        container_port("write-set", 4567),
        container_port("ist", 4568),
    ];
    if cluster.version_at_least("1.6.0") {
        ports.push(container_port("mysql-admin", MYSQL_ADMIN_PORT));
    }
    let container = Container {
        name: Tier::Database.component().to_string(),
        image: Some(db.image.clone()),
        ports: Some(ports),
        env: Some(vec![
            secret_env("MYSQL_ROOT_PASSWORD", &cluster.spec.secrets_name, "root"),
            secret_env("XTRABACKUP_PASSWORD", &cluster.spec.secrets_name, "xtrabackup"),
            secret_env("MONITOR_PASSWORD", &cluster.spec.secrets_name, "monitor"),
        ]),
        resources: resource_requirements(db.resources.as_ref()),
        volume_mounts: Some(vec![
            mount("datadir", "/var/lib/mysql"),
            mount("config", "/etc/mysql/conf.d"),
            mount("auto-config", "/etc/my.cnf.d"),
            mount("ssl", "/etc/mysql/ssl"),
            mount("ssl-internal", "/etc/mysql/ssl-internal"),
            mount("vault-keyring-secret", "/etc/mysql/vault-keyring-secret"),
        ]),
        ..Default::default()
    };
    PodLayout {
        container,
        volumes: vec![
            config_volume("config", config_map_name(cluster, Tier::Database)),
            config_volume("auto-config", auto_config_name(cluster)),
            secret_volume("ssl", &cluster.spec.ssl_secret_name),
            secret_volume("ssl-internal", &cluster.spec.ssl_internal_secret_name),
            secret_volume("vault-keyring-secret", &cluster.spec.vault_secret_name),
        ],
        claims: vec![volume_claim(
            "datadir",
            db.storage_size.as_deref().unwrap_or(DEFAULT_DATABASE_STORAGE),
        )],
    }
}

fn routing_layout(cluster: &GaleraCluster, tier: Tier, spec: &ProxyTierSpec) -> PodLayout {
    let (ports, config_path) = match tier {
        Tier::HaProxy => (
            vec![
                container_port("mysql", MYSQL_PORT),
                container_port("mysql-replicas", 3307),
                container_port("proxy-protocol", 3309),
            ],
            "/etc/haproxy-custom",
        ),
        _ => (
            vec![
                container_port("mysql", MYSQL_PORT),
                container_port("proxyadm", 6032),
            ],
            "/etc/proxysql",
        ),
    };
    let mut mounts = vec![
        mount("config", config_path),
        mount("ssl", "/etc/proxysql/ssl"),
        mount("ssl-internal", "/etc/proxysql/ssl-internal"),
    ];
    let mut claims = Vec::new();
    if tier == Tier::ProxySql {
        mounts.push(mount("proxydata", "/var/lib/proxysql"));
        claims.push(volume_claim(
            "proxydata",
            spec.storage_size
                .as_deref()
                .unwrap_or(DEFAULT_PROXYSQL_STORAGE),
        ));
    }
    let container = Container {
        name: tier.component().to_string(),
        image: Some(spec.image.clone()),
        ports: Some(ports),
        env: Some(vec![
            secret_env("MONITOR_PASSWORD", &cluster.spec.secrets_name, "monitor"),
            secret_env("PROXY_ADMIN_PASSWORD", &cluster.spec.secrets_name, "proxyadmin"),
        ]),
        resources: resource_requirements(spec.resources.as_ref()),
        volume_mounts: Some(mounts),
        ..Default::default()
    };
    PodLayout {
        container,
        volumes: vec![
            config_volume("config", config_map_name(cluster, tier)),
            secret_volume("ssl", &cluster.spec.ssl_secret_name),
            secret_volume("ssl-internal", &cluster.spec.ssl_internal_secret_name),
        ],
        claims,
    }
}

/// StatefulSet for `tier`, without content-hash annotations
pub fn stateful_set(cluster: &GaleraCluster, tier: Tier) -> Result<StatefulSet, Error> {
    let name = tier.workload_name(&cluster.name_any());
    let labels = tier_labels(&cluster.name_any(), tier);
    let layout = match tier {
        Tier::Database => database_layout(cluster),
        _ => {
            let spec = cluster.routing_tier(tier).ok_or_else(|| {
                Error::internal_with_context("manifests", format!("{tier} is not enabled"))
            })?;
            routing_layout(cluster, tier, spec)
        }
    };

    Ok(StatefulSet {
        metadata: object_meta(cluster, name.clone(), tier)?,
        spec: Some(StatefulSetSpec {
            replicas: Some(cluster.tier_size(tier)),
            service_name: service_names(cluster, tier)[0].clone(),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::new()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![layout.container],
                    volumes: Some(layout.volumes),
                    termination_grace_period_seconds: Some(600),
                    ..Default::default()
                }),
            },
            volume_claim_templates: (!layout.claims.is_empty()).then_some(layout.claims),
            pod_management_policy: Some("OrderedReady".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

// =============================================================================
// Services
// =============================================================================

/// Names of the two Services of `tier`, primary first
pub fn service_names(cluster: &GaleraCluster, tier: Tier) -> [String; 2] {
    let base = tier.workload_name(&cluster.name_any());
    match tier {
        Tier::HaProxy => [base.clone(), format!("{base}-replicas")],
        _ => [base.clone(), format!("{base}-unready")],
    }
}

fn service_port(name: &str, port: i32, target: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(target)),
        ..Default::default()
    }
}

fn exposes_nodes(service_type: &str) -> bool {
    matches!(service_type, "LoadBalancer" | "NodePort")
}

fn service(
    cluster: &GaleraCluster,
    tier: Tier,
    name: String,
    spec: ServiceSpec,
    routing: Option<&ProxyTierSpec>,
) -> Result<Service, Error> {
    let mut metadata = object_meta(cluster, name, tier)?;
    if let Some(routing) = routing {
        if let Some(labels) = metadata.labels.as_mut() {
            labels.extend(routing.service_labels.clone());
        }
        if !routing.service_annotations.is_empty() {
            metadata.annotations = Some(routing.service_annotations.clone());
        }
    }
    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(tier_labels(&cluster.name_any(), tier)),
            ..spec
        }),
        ..Default::default()
    })
}

fn exposed_spec(
    ports: Vec<ServicePort>,
    service_type: Option<&str>,
    traffic_policy: Option<&str>,
    source_ranges: &[String],
) -> ServiceSpec {
    let service_type = service_type.filter(|t| !t.is_empty()).unwrap_or("ClusterIP");
    let external_traffic_policy = exposes_nodes(service_type).then(|| {
        traffic_policy
            .filter(|p| !p.is_empty())
            .unwrap_or("Cluster")
            .to_string()
    });
    ServiceSpec {
        type_: Some(service_type.to_string()),
        ports: Some(ports),
        external_traffic_policy,
        load_balancer_source_ranges: (service_type == "LoadBalancer" && !source_ranges.is_empty())
            .then(|| source_ranges.to_vec()),
        ..Default::default()
    }
}

fn headless_spec(ports: Vec<ServicePort>, publish_not_ready: bool) -> ServiceSpec {
    ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        cluster_ip: Some("None".to_string()),
        ports: Some(ports),
        publish_not_ready_addresses: publish_not_ready.then_some(true),
        ..Default::default()
    }
}

/// Both Services of `tier`, primary first
pub fn services(cluster: &GaleraCluster, tier: Tier) -> Result<Vec<Service>, Error> {
    let [primary, secondary] = service_names(cluster, tier);
    let admin = cluster.version_at_least("1.6.0");

    match tier {
        Tier::Database => {
            let mut ports = vec![
                service_port("mysql", MYSQL_PORT, MYSQL_PORT),
                service_port("sst", 4444, 4444),
                service_port("write-set", 4567, 4567),
                service_port("ist", 4568, 4568),
            ];
            if admin {
                ports.push(service_port("mysql-admin", MYSQL_ADMIN_PORT, MYSQL_ADMIN_PORT));
            }
            Ok(vec![
                service(cluster, tier, primary, headless_spec(ports.clone(), false), None)?,
                service(cluster, tier, secondary, headless_spec(ports, true), None)?,
            ])
        }
        Tier::HaProxy => {
            let spec = cluster.routing_tier(tier).ok_or_else(|| {
                Error::internal_with_context("manifests", "haproxy is not enabled")
            })?;
            let mut ports = vec![
                service_port("mysql", MYSQL_PORT, MYSQL_PORT),
                service_port("proxy-protocol", 3309, 3309),
            ];
            if admin {
                ports.push(service_port("mysql-admin", MYSQL_ADMIN_PORT, MYSQL_ADMIN_PORT));
            }
            let primary_spec = exposed_spec(
                ports,
                spec.service_type.as_deref(),
                spec.external_traffic_policy.as_deref(),
                &spec.load_balancer_source_ranges,
            );
            let replicas_spec = exposed_spec(
                vec![service_port("mysql-replicas", MYSQL_PORT, 3307)],
                spec.replicas_service_type.as_deref(),
                spec.replicas_external_traffic_policy.as_deref(),
                &spec.load_balancer_source_ranges,
            );
            Ok(vec![
                service(cluster, tier, primary, primary_spec, Some(spec))?,
                service(cluster, tier, secondary, replicas_spec, Some(spec))?,
            ])
        }
        Tier::ProxySql => {
            let spec = cluster.routing_tier(tier).ok_or_else(|| {
                Error::internal_with_context("manifests", "proxysql is not enabled")
            })?;
            let mut ports = vec![service_port("mysql", MYSQL_PORT, MYSQL_PORT)];
            if admin {
                ports.push(service_port("mysql-admin", MYSQL_ADMIN_PORT, MYSQL_ADMIN_PORT));
            }
            let primary_spec = exposed_spec(
                ports,
                spec.service_type.as_deref(),
                spec.external_traffic_policy.as_deref(),
                &spec.load_balancer_source_ranges,
            );
            let unready = vec![
                service_port("mysql", MYSQL_PORT, MYSQL_PORT),
                service_port("proxyadm", 6032, 6032),
            ];
            Ok(vec![
                service(cluster, tier, primary, primary_spec, Some(spec))?,
                service(cluster, tier, secondary, headless_spec(unready, true), None)?,
            ])
        }
    }
}

// =============================================================================
// Disruption budgets
// =============================================================================

fn int_or_string(value: &IntOrPercent) -> IntOrString {
    match value {
        IntOrPercent::Int(n) => IntOrString::Int(*n),
        IntOrPercent::Percent(p) => IntOrString::String(p.clone()),
    }
}

/// PodDisruptionBudget for `tier`, if one is configured
pub fn pod_disruption_budget(
    cluster: &GaleraCluster,
    tier: Tier,
) -> Result<Option<PodDisruptionBudget>, Error> {
    let spec = match tier {
        Tier::Database => cluster.spec.database.pod_disruption_budget.as_ref(),
        _ => cluster
            .routing_tier(tier)
            .and_then(|s| s.pod_disruption_budget.as_ref()),
    };
    let Some(spec) = spec else {
        return Ok(None);
    };
    Ok(Some(PodDisruptionBudget {
        metadata: object_meta(cluster, tier.workload_name(&cluster.name_any()), tier)?,
        spec: Some(PodDisruptionBudgetSpec {
            min_available: spec.min_available.as_ref().map(int_or_string),
            max_unavailable: spec.max_unavailable.as_ref().map(int_or_string),
            selector: Some(LabelSelector {
                match_labels: Some(tier_labels(&cluster.name_any(), tier)),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{sample_cluster, with_haproxy, with_proxysql};
    use galera_common::crd::{LogCollectorSpec, PodDisruptionBudgetSpec as PdbSpec};

    #[test]
    fn memory_quantities_parse() {
        assert_eq!(parse_memory_bytes("1Gi"), Some(1 << 30));
        assert_eq!(parse_memory_bytes("512Mi"), Some(512 << 20));
        assert_eq!(parse_memory_bytes("2G"), Some(2_000_000_000));
        assert_eq!(parse_memory_bytes("1048576"), Some(1_048_576));
        assert_eq!(parse_memory_bytes("lots"), None);
    }

    #[test]
    fn auto_tune_uses_three_quarters_of_limit() {
        let mut cluster = sample_cluster();
        cluster.spec.database.resources = Some(PodResources {
            requests: Some(ResourceList {
                memory: Some("1Gi".to_string()),
                cpu: None,
            }),
            limits: Some(ResourceList {
                memory: Some("4Gi".to_string()),
                cpu: None,
            }),
        });
        let config = auto_tune_config(&cluster).unwrap().unwrap();
        assert!(config.contains(&format!("innodb_buffer_pool_size={}", 3u64 << 30)));
    }

    #[test]
    fn auto_tune_rejects_bad_quantity() {
        let mut cluster = sample_cluster();
        cluster.spec.database.resources = Some(PodResources {
            requests: Some(ResourceList {
                memory: Some("plenty".to_string()),
                cpu: None,
            }),
            limits: None,
        });
        assert!(auto_tune_config(&cluster).unwrap_err().is_validation());
    }

    #[test]
    fn database_config_maps_follow_version_gates() {
        let mut cluster = sample_cluster();
        cluster.spec.database.configuration = "[mysqld]\nwsrep_debug=1\n".to_string();
        cluster.spec.log_collector = Some(LogCollectorSpec {
            configuration: "[OUTPUT]\n".to_string(),
        });

        let names: Vec<_> = config_maps(&cluster, Tier::Database)
            .unwrap()
            .iter()
            .map(|m| m.name_any())
            .collect();
        assert_eq!(names, vec!["prod-db", "prod-logcollector"]);

        cluster.spec.cr_version = "1.6.0".to_string();
        let names: Vec<_> = config_maps(&cluster, Tier::Database)
            .unwrap()
            .iter()
            .map(|m| m.name_any())
            .collect();
        assert_eq!(names, vec!["prod-db"]);
    }

    #[test]
    fn config_hash_tracks_content() {
        let mut cluster = sample_cluster();
        cluster.spec.database.configuration = "a".to_string();
        let first = config_hash(&config_maps(&cluster, Tier::Database).unwrap());
        cluster.spec.database.configuration = "b".to_string();
        let second = config_hash(&config_maps(&cluster, Tier::Database).unwrap());
        assert_ne!(first, second);
    }

    #[test]
    fn stateful_set_is_owned_and_selects_its_tier() {
        let cluster = sample_cluster();
        let sts = stateful_set(&cluster, Tier::Database).unwrap();
        assert_eq!(sts.name_any(), "prod-db");
        assert_eq!(sts.owner_references()[0].kind, "GaleraCluster");
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(
            spec.selector.match_labels,
            Some(tier_labels("prod", Tier::Database))
        );
        assert_eq!(spec.volume_claim_templates.map(|c| c.len()), Some(1));
    }

    #[test]
    fn disabled_tier_has_no_stateful_set() {
        assert!(stateful_set(&sample_cluster(), Tier::ProxySql).is_err());
    }

    #[test]
    fn haproxy_services_follow_spec() {
        let mut cluster = with_haproxy(sample_cluster());
        if let Some(h) = cluster.spec.haproxy.as_mut() {
            h.service_type = Some("LoadBalancer".to_string());
            h.load_balancer_source_ranges = vec!["10.0.0.0/8".to_string()];
        }
        let svcs = services(&cluster, Tier::HaProxy).unwrap();
        let primary = svcs[0].spec.as_ref().unwrap();
        assert_eq!(primary.type_.as_deref(), Some("LoadBalancer"));
        assert_eq!(primary.external_traffic_policy.as_deref(), Some("Cluster"));
        assert_eq!(primary.ports.as_ref().map(Vec::len), Some(3));

        let replicas = svcs[1].spec.as_ref().unwrap();
        assert_eq!(svcs[1].name_any(), "prod-haproxy-replicas");
        assert_eq!(replicas.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(replicas.external_traffic_policy, None);
        let port = &replicas.ports.as_ref().unwrap()[0];
        assert_eq!(port.target_port, Some(IntOrString::Int(3307)));
    }

    #[test]
    fn admin_port_requires_version_1_6() {
        let mut cluster = with_proxysql(sample_cluster());
        cluster.spec.cr_version = "1.5.0".to_string();
        let svcs = services(&cluster, Tier::ProxySql).unwrap();
        assert_eq!(svcs[0].spec.as_ref().unwrap().ports.as_ref().map(Vec::len), Some(1));
        assert_eq!(svcs[1].name_any(), "prod-proxysql-unready");
    }

    #[test]
    fn pdb_only_when_configured() {
        let mut cluster = sample_cluster();
        assert!(pod_disruption_budget(&cluster, Tier::Database).unwrap().is_none());
        cluster.spec.database.pod_disruption_budget = Some(PdbSpec {
            max_unavailable: Some(IntOrPercent::Int(1)),
            min_available: None,
        });
        let pdb = pod_disruption_budget(&cluster, Tier::Database).unwrap().unwrap();
        assert_eq!(
            pdb.spec.unwrap().max_unavailable,
            Some(IntOrString::Int(1))
        );
    }
}
