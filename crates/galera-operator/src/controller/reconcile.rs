//! Reconciliation entry point for GaleraCluster
//!
//! One pass runs under the cluster's lock: fetch, precondition gate,
//! defaults, crash recovery, user sync, then either teardown or
//! convergence. The status hook runs at the end of every pass that got past
//! the gate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use galera_common::crd::{AppState, GaleraCluster, Tier, UpgradeStrategy};
use galera_common::events::{actions, reasons};
use galera_common::kube_utils::{pod_is_ready, running_image, tier_labels};
use galera_common::{
    Error, DEFAULT_DATABASE_VERSION, OPERATOR_VERSION, REQUEUE_ERROR_SECS,
    REQUEUE_PRECONDITION_SECS, REQUEUE_SUCCESS_SECS,
};

use super::converge::converge;
use super::recovery::check_full_cluster_crash;
use super::teardown::teardown;
use super::Context;
use crate::collaborators::TierAnnotations;
use crate::store::get_opt;
use crate::version::{image_tag, retag_image};

/// Reconcile a GaleraCluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<GaleraCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = cluster.key();
    let lock = ctx.locks.load_or_create(&key);
    let _guard = lock.reconcile().await;

    let namespace = cluster.namespace().unwrap_or_default();
    let Some(mut cluster) =
        get_opt(ctx.stores.clusters.as_ref(), &namespace, &cluster.name_any()).await?
    else {
        debug!("cluster no longer exists");
        if ctx.jobs.deregister(&key) {
            info!("stopped version check for deleted cluster");
        }
        return Ok(Action::await_change());
    };

    if cluster.should_wait_for_token_issue() {
        info!("waiting for the vault token to be issued");
        return Ok(Action::requeue(Duration::from_secs(
            REQUEUE_PRECONDITION_SECS,
        )));
    }

    let result = run_pass(&mut cluster, &ctx).await;

    let last_error = result.as_ref().err().map(|e| e.to_string());
    match ctx.status.update_status(&cluster, last_error).await {
        Ok(()) => {}
        // The last finalizer was just removed
        Err(e) if e.is_not_found() => debug!("cluster gone before status update"),
        Err(e) => warn!(error = %e, "failed to update status"),
    }

    result.map(|()| Action::requeue(Duration::from_secs(REQUEUE_SUCCESS_SECS)))
}

async fn run_pass(cluster: &mut GaleraCluster, ctx: &Arc<Context>) -> Result<(), Error> {
    let changed = match cluster.check_and_set_defaults(OPERATOR_VERSION) {
        Ok(changed) => changed,
        Err(e) => {
            warn!(error = %e, "cluster spec is invalid");
            ctx.events
                .publish(
                    &cluster.object_ref(&()),
                    EventType::Warning,
                    reasons::VALIDATION_FAILED,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e);
        }
    };

    if cluster.version_at_least("1.7.0") && cluster.auto_recovery_enabled() {
        if let Err(e) = check_full_cluster_crash(cluster, ctx).await {
            warn!(error = %e, "crash recovery failed");
        }
    }

    ctx.secrets.ensure_users_secret(cluster).await?;
    let annotations = if cluster.version_at_least("1.5.0") {
        ctx.users.sync_users(cluster).await?
    } else {
        TierAnnotations::default()
    };

    if cluster.tier_enabled(Tier::ProxySql) && cluster.observed_state() == AppState::Ready {
        spawn_proxysql_resync(cluster, ctx);
    }

    if changed {
        info!("persisting defaulted spec");
        *cluster = ctx.stores.clusters.update(cluster).await?;
    }

    let observed = cluster.observed_database_version();
    if observed.is_empty() || observed.ends_with("intermediate") {
        pin_database_version(cluster, ctx).await;
    }

    if cluster.is_deleting() {
        return teardown(cluster, ctx).await;
    }

    converge(cluster, ctx, &annotations).await?;
    ctx.backups.reconcile_backups(cluster).await?;
    record_running_version(cluster, ctx).await?;
    schedule_version_check(cluster, ctx);
    Ok(())
}

/// Resets the resync flag when the resync task ends, however it ends
struct ResyncFlagGuard(Arc<AtomicBool>);

impl Drop for ResyncFlagGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Start a detached ProxySQL user resync unless one is already running
///
/// Returns whether a task was started.
fn spawn_proxysql_resync(cluster: &GaleraCluster, ctx: &Context) -> bool {
    let flag = ctx.resync_flag(&cluster.key());
    if flag
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        debug!("ProxySQL resync already running");
        return false;
    }

    let users = ctx.users.clone();
    let cluster = cluster.clone();
    tokio::spawn(async move {
        let _flag = ResyncFlagGuard(flag);
        match users.resync_proxysql_users(&cluster).await {
            Ok(()) => debug!(cluster = %cluster.name_any(), "ProxySQL users resynced"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(cluster = %cluster.name_any(), error = %e, "ProxySQL resync failed"),
        }
    });
    true
}

fn version_service_endpoint<'a>(cluster: &'a GaleraCluster, ctx: &'a Context) -> &'a str {
    cluster
        .spec
        .upgrade_options
        .version_service_endpoint
        .as_deref()
        .unwrap_or(&ctx.config.version_service_endpoint)
}

/// Record the database version a new cluster runs
///
/// Failures fall back to the built-in default and are never fatal.
async fn pin_database_version(cluster: &mut GaleraCluster, ctx: &Context) {
    let version = match cluster.spec.upgrade_options.strategy() {
        UpgradeStrategy::Disabled => DEFAULT_DATABASE_VERSION.to_string(),
        strategy => {
            let endpoint = version_service_endpoint(cluster, ctx);
            match ctx
                .versions
                .resolve(endpoint, &cluster.spec.cr_version, strategy.as_str())
                .await
            {
                Ok(version) => version,
                Err(e) => {
                    warn!(error = %e, fallback = DEFAULT_DATABASE_VERSION, "version lookup failed");
                    DEFAULT_DATABASE_VERSION.to_string()
                }
            }
        }
    };

    let mut pinned = cluster.clone();
    pinned.status.get_or_insert_with(Default::default).database.version = version.clone();
    match ctx.stores.clusters.update_status(&pinned).await {
        Ok(()) => {
            info!(%version, "pinned database version");
            *cluster = pinned;
        }
        Err(e) => warn!(error = %e, "failed to pin database version"),
    }
}

/// Version every database pod runs, if they agree on `image`
///
/// `None` while any pod is unready or still on another image.
fn running_version(pods: &[Pod], image: &str) -> Option<String> {
    if pods.is_empty() {
        return None;
    }
    let container = Tier::Database.component();
    let settled = pods
        .iter()
        .all(|p| pod_is_ready(p) && running_image(p, container) == Some(image));
    if !settled {
        return None;
    }
    image_tag(image).map(str::to_string)
}

/// Read the running database version back into status once the cluster is ready
async fn record_running_version(cluster: &mut GaleraCluster, ctx: &Context) -> Result<(), Error> {
    if cluster.observed_state() != AppState::Ready {
        return Ok(());
    }
    let namespace = cluster.namespace().unwrap_or_default();
    let pods = ctx
        .stores
        .pods
        .list(&namespace, &tier_labels(&cluster.name_any(), Tier::Database))
        .await?;
    let Some(version) = running_version(&pods, &cluster.spec.database.image) else {
        return Ok(());
    };
    if version == cluster.observed_database_version() {
        return Ok(());
    }

    let mut recorded = cluster.clone();
    recorded.status.get_or_insert_with(Default::default).database.version = version.clone();
    ctx.stores.clusters.update_status(&recorded).await?;
    info!(%version, "recorded running database version");
    *cluster = recorded;
    Ok(())
}

/// Keep the scheduled version check in line with the upgrade options
fn schedule_version_check(cluster: &GaleraCluster, ctx: &Arc<Context>) {
    let key = cluster.key();
    let options = &cluster.spec.upgrade_options;
    if options.strategy() == UpgradeStrategy::Disabled {
        if ctx.jobs.deregister(&key) {
            info!("version checks disabled");
        }
        return;
    }

    let interval = Duration::from_secs(options.check_interval_secs());
    let weak = Arc::downgrade(ctx);
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();
    ctx.jobs.register(&key, interval, move || {
        let weak = weak.clone();
        let namespace = namespace.clone();
        let name = name.clone();
        async move {
            let Some(ctx) = weak.upgrade() else {
                return;
            };
            if let Err(e) = run_version_check(&ctx, &namespace, &name).await {
                warn!(cluster = %name, error = %e, "version check failed");
            }
        }
    });
}

/// One run of the scheduled version check
///
/// Moves the database image to the version the service recommends. Skips
/// the run when no reconciliation happened since the previous one. Returns
/// whether the cluster was changed.
pub async fn run_version_check(ctx: &Context, namespace: &str, name: &str) -> Result<bool, Error> {
    let lock = ctx.locks.load_or_create(&format!("{namespace}/{name}"));
    let Some(_guard) = lock.job().await else {
        debug!(cluster = %name, "version check waits for a reconciliation");
        return Ok(false);
    };

    let Some(mut cluster) = get_opt(ctx.stores.clusters.as_ref(), namespace, name).await? else {
        return Ok(false);
    };
    let strategy = cluster.spec.upgrade_options.strategy();
    if cluster.is_deleting() || strategy == UpgradeStrategy::Disabled {
        return Ok(false);
    }

    let target = ctx
        .versions
        .resolve(
            version_service_endpoint(&cluster, ctx),
            &cluster.spec.cr_version,
            strategy.as_str(),
        )
        .await?;
    let image = retag_image(&cluster.spec.database.image, &target);
    if target == cluster.observed_database_version() && image == cluster.spec.database.image {
        return Ok(false);
    }

    let previous = std::mem::replace(&mut cluster.spec.database.image, image);
    let mut updated = ctx.stores.clusters.update(&cluster).await?;
    updated.status.get_or_insert_with(Default::default).database.version = target.clone();
    ctx.stores.clusters.update_status(&updated).await?;

    info!(cluster = %name, from = %previous, to = %updated.spec.database.image, "upgraded database image");
    ctx.events
        .publish(
            &updated.object_ref(&()),
            EventType::Normal,
            reasons::VERSION_UPGRADED,
            actions::UPGRADE,
            Some(format!("database moved to {target}")),
        )
        .await;
    Ok(true)
}

/// Requeue policy for failed passes
///
/// Validation errors need a spec change, so they are revisited at the
/// normal interval rather than retried quickly.
pub fn error_policy(cluster: Arc<GaleraCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    let delay = if error.is_validation() {
        REQUEUE_SUCCESS_SECS
    } else {
        REQUEUE_ERROR_SECS
    };
    Action::requeue(Duration::from_secs(delay))
}
