//! Common types for the Galera operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator version; the default compatibility version for new clusters
pub const OPERATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Database version pinned when the version service cannot be reached
pub const DEFAULT_DATABASE_VERSION: &str = "8.0.36-28.1";

/// Field manager for server-side apply and status patches
pub const FIELD_MANAGER: &str = "galera-operator";

/// Delay before revisiting a cluster after a successful pass
pub const REQUEUE_SUCCESS_SECS: u64 = 5;

/// Delay before revisiting a cluster that waits for a vault token
pub const REQUEUE_PRECONDITION_SECS: u64 = 2;

/// Delay before retrying a pass that failed with a transient error
pub const REQUEUE_ERROR_SECS: u64 = 1;

/// Annotation that holds a cluster back until its vault token is issued
pub const ANNOTATION_ISSUE_VAULT_TOKEN: &str = "galera.dev/issue-vault-token";

/// Pod template annotation: hash of the tier's configuration
pub const ANNOTATION_CONFIG_HASH: &str = "galera.dev/configuration-hash";

/// Pod template annotation: hash of the client TLS secret
pub const ANNOTATION_SSL_HASH: &str = "galera.dev/ssl-hash";

/// Pod template annotation: hash of the replication TLS secret
pub const ANNOTATION_SSL_INTERNAL_HASH: &str = "galera.dev/ssl-internal-hash";

/// Pod template annotation: hash of the vault configuration secret
pub const ANNOTATION_VAULT_CONFIG_HASH: &str = "galera.dev/vault-config-hash";
