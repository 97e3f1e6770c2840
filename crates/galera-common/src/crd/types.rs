//! Supporting types for the GaleraCluster CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The tiers of a Galera cluster, in convergence order
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Primary data tier, always enabled
    Database,
    /// HAProxy routing tier
    HaProxy,
    /// ProxySQL routing tier
    ProxySql,
}

impl Tier {
    /// Every tier in the order the pipeline visits them
    pub const ALL: [Tier; 3] = [Tier::Database, Tier::HaProxy, Tier::ProxySql];

    /// Component suffix used in object names and the component label
    pub fn component(&self) -> &'static str {
        match self {
            Self::Database => "db",
            Self::HaProxy => "haproxy",
            Self::ProxySql => "proxysql",
        }
    }

    /// Name of the tier's StatefulSet for the given cluster
    pub fn workload_name(&self, cluster: &str) -> String {
        format!("{cluster}-{}", self.component())
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Database => write!(f, "Database"),
            Self::HaProxy => write!(f, "HAProxy"),
            Self::ProxySql => write!(f, "ProxySQL"),
        }
    }
}

/// Observed application state for the cluster and for each tier
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    /// Nothing observed yet
    #[default]
    Unknown,
    /// Pods are starting or not all replicas are ready
    Initializing,
    /// All replicas are ready
    Ready,
    /// The last pass failed
    Error,
    /// The cluster is being deleted
    Stopping,
}

impl std::fmt::Display for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// A Kubernetes quantity that may be given as an integer or a percentage
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum IntOrPercent {
    /// Absolute count
    Int(i32),
    /// Percentage string such as "50%"
    Percent(String),
}

/// PodDisruptionBudget settings for a tier
///
/// Exactly one of the two fields is expected to be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudgetSpec {
    /// Minimum pods that must stay available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<IntOrPercent>,
    /// Maximum pods that may be unavailable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

/// Memory and CPU quantities (Kubernetes quantity strings)
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ResourceList {
    /// Memory quantity, e.g. "2Gi"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// CPU quantity, e.g. "600m"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

impl ResourceList {
    fn is_empty(&self) -> bool {
        self.memory.is_none() && self.cpu.is_none()
    }
}

/// Resource requests and limits for a tier's main container
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct PodResources {
    /// Requested resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
    /// Resource limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,
}

impl PodResources {
    /// Memory limit if set, otherwise the memory request
    pub fn effective_memory(&self) -> Option<&str> {
        self.limits
            .as_ref()
            .and_then(|l| l.memory.as_deref())
            .or_else(|| self.requests.as_ref().and_then(|r| r.memory.as_deref()))
    }

    /// True when neither requests nor limits carry a value
    pub fn is_empty(&self) -> bool {
        self.requests.as_ref().map_or(true, ResourceList::is_empty)
            && self.limits.as_ref().map_or(true, ResourceList::is_empty)
    }
}

/// Observed state of one tier
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TierStatus {
    /// Desired replica count
    #[serde(default)]
    pub size: i32,
    /// Ready replica count
    #[serde(default)]
    pub ready: i32,
    /// Tier state derived from the replica counts
    #[serde(default)]
    pub status: AppState,
    /// Running software version (database tier only)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Image the tier is running
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, Reconciled)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same condition as `previous` apart from the timestamp
    pub fn same_state_as(&self, previous: &Condition) -> bool {
        self.type_ == previous.type_
            && self.status == previous.status
            && self.reason == previous.reason
            && self.message == previous.message
    }
}

/// Merge freshly computed conditions with the previous ones
///
/// A condition whose status, reason and message did not change keeps its
/// previous `last_transition_time`.
pub fn merge_conditions(previous: &[Condition], next: Vec<Condition>) -> Vec<Condition> {
    next.into_iter()
        .map(|mut c| {
            if let Some(old) = previous.iter().find(|p| p.type_ == c.type_) {
                if c.same_state_as(old) {
                    c.last_transition_time = old.last_transition_time;
                }
            }
            c
        })
        .collect()
}
