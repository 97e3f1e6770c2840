//! GaleraCluster Custom Resource Definition
//!
//! A GaleraCluster describes a synchronously replicated MySQL cluster: a
//! database tier that is always present, plus optional HAProxy and ProxySQL
//! routing tiers in front of it.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use semver::Version;
use serde::{Deserialize, Serialize};

use super::types::{AppState, Condition, PodDisruptionBudgetSpec, PodResources, Tier, TierStatus};
use crate::{Error, ANNOTATION_ISSUE_VAULT_TOKEN};

/// Default interval between scheduled version checks
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 86_400;

/// Specification for a GaleraCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "galera.dev",
    version = "v1alpha1",
    kind = "GaleraCluster",
    plural = "galeraclusters",
    shortname = "gc",
    status = "GaleraClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"DB","type":"integer","jsonPath":".status.database.ready"}"#,
    printcolumn = r#"{"name":"HAProxy","type":"integer","jsonPath":".status.haproxy.ready"}"#,
    printcolumn = r#"{"name":"ProxySQL","type":"integer","jsonPath":".status.proxysql.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GaleraClusterSpec {
    /// Compatibility version (semver). Feature gates compare against it.
    /// Defaults to the operator version.
    #[serde(default)]
    pub cr_version: String,

    /// Secret holding the system user passwords (default `<cluster>-secrets`)
    #[serde(default)]
    pub secrets_name: String,

    /// Client TLS secret (default `<cluster>-ssl`)
    #[serde(default)]
    pub ssl_secret_name: String,

    /// Replication TLS secret (default `<cluster>-ssl-internal`)
    #[serde(default)]
    pub ssl_internal_secret_name: String,

    /// Encryption key-vault configuration secret (default `<cluster>-vault`)
    #[serde(default)]
    pub vault_secret_name: String,

    /// Permit configurations that are unsafe for production
    /// (fewer than three database nodes, missing TLS)
    #[serde(default)]
    pub allow_unsafe_configurations: bool,

    /// Database tier
    pub database: DatabaseSpec,

    /// HAProxy routing tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<ProxyTierSpec>,

    /// ProxySQL routing tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<ProxyTierSpec>,

    /// Log collector sidecar configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_collector: Option<LogCollectorSpec>,

    /// Backup settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupSpec>,

    /// Automatic version upgrades
    #[serde(default)]
    pub upgrade_options: UpgradeOptions,
}

/// Database tier settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSpec {
    /// Number of database nodes
    pub size: i32,

    /// Container image
    pub image: String,

    /// Resources for the database container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,

    /// Extra `my.cnf` content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration: String,

    /// Recover automatically from a full cluster crash (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_recovery: Option<bool>,

    /// PodDisruptionBudget for the database pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,

    /// Data volume size (default "6Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

/// Settings shared by both routing tiers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyTierSpec {
    /// Whether the tier is deployed
    #[serde(default)]
    pub enabled: bool,

    /// Number of proxy pods
    #[serde(default)]
    pub size: i32,

    /// Container image
    #[serde(default)]
    pub image: String,

    /// Resources for the proxy container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,

    /// Proxy configuration file content
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration: String,

    /// Primary Service type (default ClusterIP)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// External traffic policy for NodePort/LoadBalancer services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_traffic_policy: Option<String>,

    /// Replicas Service type (HAProxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_service_type: Option<String>,

    /// Replicas Service external traffic policy (HAProxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_external_traffic_policy: Option<String>,

    /// Annotations added to the tier's Services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_annotations: BTreeMap<String, String>,

    /// Labels added to the tier's Services
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub service_labels: BTreeMap<String, String>,

    /// Source ranges for LoadBalancer services
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub load_balancer_source_ranges: Vec<String>,

    /// PodDisruptionBudget for the tier's pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PodDisruptionBudgetSpec>,

    /// Volume size (ProxySQL only, default "2Gi")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_size: Option<String>,
}

/// Log collector sidecar settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LogCollectorSpec {
    /// Extra fluent-bit configuration
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub configuration: String,
}

/// Backup settings relevant to the cluster lifecycle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    /// Point-in-time recovery binlog collector
    #[serde(default)]
    pub pitr: PitrSpec,
}

/// Point-in-time recovery settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PitrSpec {
    /// Whether the binlog collector deployment runs
    #[serde(default)]
    pub enabled: bool,
}

/// Automatic upgrade settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOptions {
    /// `disabled`, `recommended`, `latest` or an explicit version
    #[serde(default)]
    pub apply: String,

    /// Version service URL; falls back to the operator-wide endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_service_endpoint: Option<String>,

    /// Seconds between scheduled version checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_seconds: Option<u64>,
}

/// Parsed form of `upgradeOptions.apply`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpgradeStrategy {
    /// No version checks
    Disabled,
    /// Newest version the service marks as recommended
    Recommended,
    /// Newest version the service knows
    Latest,
    /// A pinned version
    Exact(String),
}

impl UpgradeStrategy {
    /// The value sent to the version service
    pub fn as_str(&self) -> &str {
        match self {
            Self::Disabled => "disabled",
            Self::Recommended => "recommended",
            Self::Latest => "latest",
            Self::Exact(v) => v,
        }
    }
}

impl UpgradeOptions {
    /// Parse `apply`; an empty value means disabled
    pub fn strategy(&self) -> UpgradeStrategy {
        match self.apply.trim().to_lowercase().as_str() {
            "" | "disabled" | "never" => UpgradeStrategy::Disabled,
            "recommended" => UpgradeStrategy::Recommended,
            "latest" => UpgradeStrategy::Latest,
            _ => UpgradeStrategy::Exact(self.apply.trim().to_string()),
        }
    }

    /// Interval between checks, defaulted
    pub fn check_interval_secs(&self) -> u64 {
        self.check_interval_seconds
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_CHECK_INTERVAL_SECS)
    }
}

/// Status for a GaleraCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GaleraClusterStatus {
    /// Overall cluster state
    #[serde(default)]
    pub state: AppState,

    /// Database tier status
    #[serde(default)]
    pub database: TierStatus,

    /// HAProxy tier status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<TierStatus>,

    /// ProxySQL tier status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<TierStatus>,

    /// Last error message, if the last pass failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions describing the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation observed by the last completed pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl GaleraCluster {
    /// Store key `<namespace>/<name>` used for locks and scheduled jobs
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// True once a deletion was requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True while the cluster waits for a vault token to be issued
    pub fn should_wait_for_token_issue(&self) -> bool {
        self.annotations()
            .get(ANNOTATION_ISSUE_VAULT_TOKEN)
            .is_some_and(|v| v == "true")
    }

    /// Parsed compatibility version
    ///
    /// Falls back to the operator version when `crVersion` is empty or
    /// malformed; [`GaleraCluster::check_and_set_defaults`] rejects malformed
    /// values before any feature gate is consulted.
    pub fn version(&self) -> Version {
        parse_version(&self.spec.cr_version)
            .or_else(|| parse_version(crate::OPERATOR_VERSION))
            .unwrap_or_else(|| Version::new(0, 0, 0))
    }

    /// Compare the compatibility version with `other`
    ///
    /// Unparseable `other` sorts below every version.
    pub fn compare_version_with(&self, other: &str) -> Ordering {
        match parse_version(other) {
            Some(v) => self.version().cmp(&v),
            None => Ordering::Greater,
        }
    }

    /// Compatibility version is at least `other`
    pub fn version_at_least(&self, other: &str) -> bool {
        self.compare_version_with(other) != Ordering::Less
    }

    /// Routing tier spec if the tier is enabled
    pub fn routing_tier(&self, tier: Tier) -> Option<&ProxyTierSpec> {
        let spec = match tier {
            Tier::Database => None,
            Tier::HaProxy => self.spec.haproxy.as_ref(),
            Tier::ProxySql => self.spec.proxysql.as_ref(),
        };
        spec.filter(|s| s.enabled)
    }

    /// Whether `tier` should be running
    pub fn tier_enabled(&self, tier: Tier) -> bool {
        match tier {
            Tier::Database => true,
            _ => self.routing_tier(tier).is_some(),
        }
    }

    /// Desired replica count for `tier` (0 when disabled)
    pub fn tier_size(&self, tier: Tier) -> i32 {
        match tier {
            Tier::Database => self.spec.database.size,
            _ => self.routing_tier(tier).map(|s| s.size).unwrap_or(0),
        }
    }

    /// Container image for `tier`
    pub fn tier_image(&self, tier: Tier) -> &str {
        match tier {
            Tier::Database => &self.spec.database.image,
            _ => self.routing_tier(tier).map(|s| s.image.as_str()).unwrap_or(""),
        }
    }

    /// True when crash recovery is turned on
    pub fn auto_recovery_enabled(&self) -> bool {
        self.spec.database.auto_recovery.unwrap_or(true)
    }

    /// True when the PITR collector is configured
    pub fn pitr_enabled(&self) -> bool {
        self.spec.backup.as_ref().is_some_and(|b| b.pitr.enabled)
    }

    /// Database version reported in status, empty if unknown
    pub fn observed_database_version(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.database.version.as_str())
            .unwrap_or("")
    }

    /// Overall state reported in status
    pub fn observed_state(&self) -> AppState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Validate the spec and fill in defaults
    ///
    /// Returns `true` when any field was changed and the spec should be
    /// persisted.
    pub fn check_and_set_defaults(&mut self, operator_version: &str) -> Result<bool, Error> {
        let name = self.name_any();
        let mut changed = false;

        if self.spec.cr_version.is_empty() {
            self.spec.cr_version = operator_version.to_string();
            changed = true;
        }
        if parse_version(&self.spec.cr_version).is_none() {
            return Err(Error::validation_for_field(
                &name,
                "spec.crVersion",
                format!("'{}' is not a semantic version", self.spec.cr_version),
            ));
        }

        for (field, suffix) in [
            (&mut self.spec.secrets_name, "secrets"),
            (&mut self.spec.ssl_secret_name, "ssl"),
            (&mut self.spec.ssl_internal_secret_name, "ssl-internal"),
            (&mut self.spec.vault_secret_name, "vault"),
        ] {
            if field.is_empty() {
                *field = format!("{name}-{suffix}");
                changed = true;
            }
        }

        let db = &mut self.spec.database;
        if db.size < 1 {
            return Err(Error::validation_for_field(
                &name,
                "spec.database.size",
                "must be at least 1",
            ));
        }
        if db.image.is_empty() {
            return Err(Error::validation_for_field(
                &name,
                "spec.database.image",
                "image is required",
            ));
        }
        if db.auto_recovery.is_none() {
            db.auto_recovery = Some(true);
            changed = true;
        }
        if !self.spec.allow_unsafe_configurations {
            // Galera needs an odd quorum of at least three nodes
            let safe = db.size.max(3) | 1;
            if safe != db.size {
                db.size = safe;
                changed = true;
            }
        }

        for (tier, spec) in [
            (Tier::HaProxy, self.spec.haproxy.as_ref()),
            (Tier::ProxySql, self.spec.proxysql.as_ref()),
        ] {
            let Some(spec) = spec.filter(|s| s.enabled) else {
                continue;
            };
            let field = tier.component();
            if spec.size < 1 {
                return Err(Error::validation_for_field(
                    &name,
                    format!("spec.{field}.size"),
                    "must be at least 1 when enabled",
                ));
            }
            if spec.image.is_empty() {
                return Err(Error::validation_for_field(
                    &name,
                    format!("spec.{field}.image"),
                    "image is required when enabled",
                ));
            }
        }

        if let UpgradeStrategy::Exact(v) = self.spec.upgrade_options.strategy() {
            if parse_version(&v).is_none() {
                return Err(Error::validation_for_field(
                    &name,
                    "spec.upgradeOptions.apply",
                    format!("'{v}' is neither a strategy nor a version"),
                ));
            }
        }
        if self.spec.upgrade_options.apply.is_empty() {
            self.spec.upgrade_options.apply = UpgradeStrategy::Disabled.as_str().to_string();
            changed = true;
        }

        Ok(changed)
    }
}

/// Parse a version leniently: a leading `v` and missing minor/patch are accepted
fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim().trim_start_matches('v');
    if raw.is_empty() {
        return None;
    }
    if let Ok(v) = Version::parse(raw) {
        return Some(v);
    }
    let parts = raw.split('.').count();
    let padded = match parts {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => return None,
    };
    Version::parse(&padded).ok()
}
