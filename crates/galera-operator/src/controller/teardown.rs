//! Finalizer-driven teardown of a GaleraCluster
//!
//! Each finalizer this controller owns maps to one idempotent task. A task
//! that succeeds removes its own name; one that fails keeps it, and the
//! next pass retries. Finalizers owned by other controllers are never
//! touched.

use std::fmt;
use std::str::FromStr;

use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{info, warn};

use galera_common::crd::{GaleraCluster, Tier};
use galera_common::events::{actions, reasons};
use galera_common::kube_utils::tier_labels;
use galera_common::Error;

use super::Context;
use crate::store::delete_if_present;

/// Finalizers owned by this controller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finalizer {
    /// Remove the ProxySQL workload and its volumes
    DeleteProxySqlPvc,
    /// Remove the database workload and its volumes
    DeleteDatabasePvc,
    /// Shrink the database to one pod before letting deletion proceed
    DeletePodsInOrder,
}

impl Finalizer {
    /// Every finalizer this controller understands
    pub const ALL: [Finalizer; 3] = [
        Finalizer::DeleteProxySqlPvc,
        Finalizer::DeleteDatabasePvc,
        Finalizer::DeletePodsInOrder,
    ];

    /// Name as stored in `metadata.finalizers`
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteProxySqlPvc => "galera.dev/delete-proxysql-pvc",
            Self::DeleteDatabasePvc => "galera.dev/delete-database-pvc",
            Self::DeletePodsInOrder => "galera.dev/delete-pods-in-order",
        }
    }
}

impl fmt::Display for Finalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A finalizer name this controller does not own
#[derive(Debug, PartialEq, Eq)]
pub struct ForeignFinalizer(pub String);

impl FromStr for Finalizer {
    type Err = ForeignFinalizer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Finalizer::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ForeignFinalizer(s.to_string()))
    }
}

/// Run every owned finalizer once and persist the ones still pending
///
/// Returns the first task failure after the retained set is saved, so the
/// pass is retried.
pub async fn teardown(cluster: &GaleraCluster, ctx: &Context) -> Result<(), Error> {
    let finalizers = cluster.finalizers().to_vec();
    let mut retained = Vec::with_capacity(finalizers.len());
    let mut first_error = None;

    for name in finalizers.iter() {
        let Ok(finalizer) = name.parse::<Finalizer>() else {
            retained.push(name.clone());
            continue;
        };

        match run_finalizer(cluster, ctx, finalizer).await {
            Ok(()) => {
                info!(%finalizer, "finalizer completed");
                publish(cluster, ctx, EventType::Normal, reasons::FINALIZER_COMPLETED, finalizer, None)
                    .await;
            }
            Err(e) => {
                warn!(%finalizer, error = %e, "finalizer pending");
                publish(
                    cluster,
                    ctx,
                    EventType::Warning,
                    reasons::FINALIZER_PENDING,
                    finalizer,
                    Some(e.to_string()),
                )
                .await;
                retained.push(name.clone());
                first_error.get_or_insert(e);
            }
        }
    }

    if retained != finalizers {
        let mut updated = cluster.clone();
        updated.metadata.finalizers = Some(retained);
        ctx.stores.clusters.update(&updated).await?;
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn publish(
    cluster: &GaleraCluster,
    ctx: &Context,
    type_: EventType,
    reason: &str,
    finalizer: Finalizer,
    detail: Option<String>,
) {
    let note = match detail {
        Some(detail) => format!("{finalizer}: {detail}"),
        None => finalizer.to_string(),
    };
    ctx.events
        .publish(
            &cluster.object_ref(&()),
            type_,
            reason,
            actions::DELETE,
            Some(note),
        )
        .await;
}

async fn run_finalizer(
    cluster: &GaleraCluster,
    ctx: &Context,
    finalizer: Finalizer,
) -> Result<(), Error> {
    match finalizer {
        Finalizer::DeleteProxySqlPvc => {
            delete_workload(cluster, ctx, Tier::ProxySql, true).await?;
        }
        Finalizer::DeleteDatabasePvc => {
            delete_workload(cluster, ctx, Tier::Database, true).await?;
        }
        Finalizer::DeletePodsInOrder => drain_database_pods(cluster, ctx).await?,
    }
    Ok(())
}

/// Delete a tier's StatefulSet and, if asked, its volume claims
///
/// Returns whether anything was deleted.
pub async fn delete_workload(
    cluster: &GaleraCluster,
    ctx: &Context,
    tier: Tier,
    delete_pvcs: bool,
) -> Result<bool, Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let name = tier.workload_name(&cluster.name_any());
    let mut removed =
        delete_if_present(ctx.stores.stateful_sets.as_ref(), &namespace, &name).await?;

    if delete_pvcs {
        let claims = ctx
            .stores
            .pvcs
            .list(&namespace, &tier_labels(&cluster.name_any(), tier))
            .await?;
        for claim in claims {
            removed |=
                delete_if_present(ctx.stores.pvcs.as_ref(), &namespace, &claim.name_any()).await?;
        }
    }
    Ok(removed)
}

/// Let the database shut down one pod at a time
///
/// With more than one pod left the StatefulSet is scaled to a single
/// replica and the task reports itself incomplete. Once at most one pod
/// remains, it waits out the grace period and removes the PITR collector.
async fn drain_database_pods(cluster: &GaleraCluster, ctx: &Context) -> Result<(), Error> {
    let namespace = cluster.namespace().unwrap_or_default();
    let pods = ctx
        .stores
        .pods
        .list(&namespace, &tier_labels(&cluster.name_any(), Tier::Database))
        .await?;

    if pods.len() <= 1 {
        tokio::time::sleep(ctx.config.drain_grace()).await;
        if cluster.pitr_enabled() {
            ctx.backups.delete_pitr(cluster).await?;
        }
        return Ok(());
    }

    let workload = Tier::Database.workload_name(&cluster.name_any());
    let mut sts = ctx.stores.stateful_sets.get(&namespace, &workload).await?;
    sts.spec.get_or_insert_with(Default::default).replicas = Some(1);
    ctx.stores.stateful_sets.update(&sts).await?;
    info!(pods = pods.len(), "scaled database down to one replica");

    Err(Error::teardown(
        cluster.name_any(),
        format!("waiting for {} database pods to be deleted", pods.len() - 1),
    ))
}
