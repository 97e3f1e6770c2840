//! Database version resolution against the version service
//!
//! The version service answers "which database version should a cluster
//! created by operator X run, given upgrade policy Y". The reconcile loop
//! uses it to pin a version on new clusters; the scheduled version check
//! uses it to move clusters to newer releases.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use serde::de::IgnoredAny;
use serde::Deserialize;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use galera_common::Error;

/// Default version service
pub const DEFAULT_VERSION_SERVICE_ENDPOINT: &str = "https://check.galera.dev";

const PRODUCT: &str = "galera-operator";

/// Resolves the database version a cluster should run
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VersionResolver: Send + Sync {
    /// Ask `endpoint` for the version matching `apply` for clusters at
    /// compatibility version `operator_version`
    async fn resolve(
        &self,
        endpoint: &str,
        operator_version: &str,
        apply: &str,
    ) -> Result<String, Error>;
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    versions: Vec<OperatorVersion>,
}

#[derive(Debug, Deserialize)]
struct OperatorVersion {
    #[serde(default)]
    matrix: VersionMatrix,
}

#[derive(Debug, Default, Deserialize)]
struct VersionMatrix {
    #[serde(default)]
    database: BTreeMap<String, IgnoredAny>,
}

/// Pick the newest database version from a service response
fn newest_version(response: VersionResponse) -> Option<String> {
    response
        .versions
        .into_iter()
        .flat_map(|v| v.matrix.database.into_keys())
        .filter_map(|raw| Version::parse(&raw).ok().map(|parsed| (parsed, raw)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, raw)| raw)
}

/// [`VersionResolver`] talking JSON over HTTP
pub struct HttpVersionResolver {
    http_client: reqwest::Client,
}

impl HttpVersionResolver {
    /// Create a resolver with a bounded request timeout
    pub fn new() -> Result<Self, Error> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_with_context("version_service", e.to_string()))?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl VersionResolver for HttpVersionResolver {
    async fn resolve(
        &self,
        endpoint: &str,
        operator_version: &str,
        apply: &str,
    ) -> Result<String, Error> {
        let url = format!(
            "{}/versions/v1/{PRODUCT}/{operator_version}/{apply}",
            endpoint.trim_end_matches('/')
        );
        debug!(%url, "querying version service");

        let failed = |e: reqwest::Error| {
            Error::collaborator("version-service", operator_version, e.to_string())
        };
        let response: VersionResponse = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(failed)?
            .error_for_status()
            .map_err(failed)?
            .json()
            .await
            .map_err(failed)?;

        newest_version(response).ok_or_else(|| {
            Error::collaborator(
                "version-service",
                operator_version,
                format!("no database version offered for '{apply}'"),
            )
        })
    }
}

/// Replace the tag of a container image reference
///
/// A registry port (`host:5000/db`) is not mistaken for a tag.
pub fn retag_image(image: &str, version: &str) -> String {
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    let repository = match image[name_start..].find(':') {
        Some(colon) => &image[..name_start + colon],
        None => image,
    };
    format!("{repository}:{version}")
}

/// Tag of an image reference, ignoring any digest
///
/// `registry:5000/galera/mysql:8.0.36@sha256:..` yields `8.0.36`; an
/// untagged reference yields `None`.
pub fn image_tag(image: &str) -> Option<&str> {
    let image = image.split('@').next().unwrap_or(image);
    let name_start = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    image[name_start..]
        .split_once(':')
        .map(|(_, tag)| tag)
        .filter(|tag| !tag.is_empty())
}
