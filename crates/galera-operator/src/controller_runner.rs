//! Controller runner - builds the GaleraCluster controller future
//!
//! Construction stays free of side effects so `main` decides when the
//! future is driven.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};

use galera_common::crd::GaleraCluster;

use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

fn scoped_api<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the GaleraCluster controller future
///
/// Changes to owned StatefulSets, Services and ConfigMaps trigger a pass for
/// the owning cluster. With `namespace` set only that namespace is watched.
pub fn build_cluster_controller(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let clusters: Api<GaleraCluster> = scoped_api(client.clone(), namespace);

    tracing::info!(namespace = namespace.unwrap_or("<all>"), "- GaleraCluster controller");

    Box::pin(
        Controller::new(clusters, watcher_config())
            .owns(
                scoped_api::<StatefulSet>(client.clone(), namespace),
                watcher_config(),
            )
            .owns(
                scoped_api::<Service>(client.clone(), namespace),
                watcher_config(),
            )
            .owns(scoped_api::<ConfigMap>(client, namespace), watcher_config())
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("GaleraCluster")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
