//! Kubernetes Events recorded against a GaleraCluster
//!
//! Events mark the points an operator of the database wants to see in
//! `kubectl describe gc <name>` without reading controller logs:
//!
//! | reason | type | emitted when |
//! |---|---|---|
//! | `ValidationFailed` | Warning | defaulting rejected the cluster definition |
//! | `FullClusterCrash` | Warning | every database pod restarted and none is ready |
//! | `FinalizerCompleted` | Normal | a teardown task finished and its finalizer was dropped |
//! | `FinalizerPending` | Warning | a teardown task failed and keeps its finalizer |
//! | `TierDisabled` | Normal | a disabled routing tier's workload and services were removed |
//! | `VersionUpgraded` | Normal | the scheduled version check retagged the database image |
//!
//! Publishing never fails a reconcile pass. An event the API server
//! rejects is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Records cluster lifecycle events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record `reason` against the cluster behind `cluster_ref`
    ///
    /// `action` is one of [`actions`]; `note` carries the detail shown to
    /// users, such as the pending finalizer or the new database version.
    async fn publish(
        &self,
        cluster_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by the events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when the
    /// downward API provides `POD_NAME`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        cluster_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, cluster_ref).await {
            warn!(
                cluster = cluster_ref.name.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "dropping cluster event"
            );
        }
    }
}

/// Publisher for controller tests, which assert on store state instead
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _cluster_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, one per row of the table above
pub mod reasons {
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A finalizer task finished and its name was removed
    pub const FINALIZER_COMPLETED: &str = "FinalizerCompleted";
    /// A finalizer task failed and will be retried
    pub const FINALIZER_PENDING: &str = "FinalizerPending";
    /// Every database pod crashed, recovery was triggered
    pub const FULL_CLUSTER_CRASH: &str = "FullClusterCrash";
    /// The database image was retagged to a newer version
    pub const VERSION_UPGRADED: &str = "VersionUpgraded";
    /// A routing tier was disabled and its resources removed
    pub const TIER_DISABLED: &str = "TierDisabled";
}

/// What the controller was doing when it recorded the event
pub mod actions {
    /// A normal pass: validation, convergence, tier removal
    pub const RECONCILE: &str = "Reconcile";
    /// Teardown of a cluster marked for deletion
    pub const DELETE: &str = "Delete";
    /// Restarting a fully crashed database tier
    pub const RECOVER: &str = "Recover";
    /// The periodic version check moving to a newer image
    pub const UPGRADE: &str = "Upgrade";
}
