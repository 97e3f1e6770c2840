//! Galera Operator - runs synchronously replicated MySQL clusters on Kubernetes

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::{Client, CustomResourceExt};

use galera_common::crd::GaleraCluster;
use galera_common::telemetry::{init_telemetry, TelemetryConfig};
use galera_operator::config::ControllerConfig;
use galera_operator::controller::Context;
use galera_operator::controller_runner::build_cluster_controller;
use galera_operator::startup::ensure_crds_installed;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ControllerConfig::parse();

    if config.crd {
        print!("{}", serde_yaml::to_string(&GaleraCluster::crd())?);
        return Ok(());
    }

    config.validate()?;

    init_telemetry(TelemetryConfig {
        service_name: "galera-operator".to_string(),
        filter: config.log_filter.clone(),
        json: !config.text_logs,
    })?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    ensure_crds_installed(&client).await?;

    let ctx = Arc::new(Context::builder(client.clone(), config.clone()).build()?);

    tracing::info!(
        version = galera_common::OPERATOR_VERSION,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "starting controllers"
    );
    build_cluster_controller(client, ctx, config.watch_namespace.as_deref()).await;

    tracing::info!("controllers stopped");
    Ok(())
}
