//! CRD installation on startup
//!
//! The GaleraCluster CRD is applied with server-side apply so upgrading the
//! operator also upgrades the schema.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use galera_common::crd::GaleraCluster;
use galera_common::FIELD_MANAGER;

/// Install or update the GaleraCluster CRD
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let name = GaleraCluster::crd_name();

    tracing::info!(crd = name, "installing CRD");
    crds.patch(name, &params, &Patch::Apply(&GaleraCluster::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    tracing::info!(crd = name, "CRD installed/updated");
    Ok(())
}
