//! Error types for the Galera operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Store errors distinguish "not found" and "already exists" so that the
//! controller can treat them as expected outcomes rather than failures.

use thiserror::Error;

/// Main error type for Galera operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error that is neither a 404 nor a 409
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist in the store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g. "StatefulSet")
        kind: String,
        /// Object name
        name: String,
    },

    /// An object with the same identity already exists in the store
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind (e.g. "Service")
        kind: String,
        /// Object name
        name: String,
    },

    /// Validation error for GaleraCluster specs
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.database.size")
        field: Option<String>,
    },

    /// Failure reported by an external collaborator (user sync, TLS, version service)
    #[error("{component} failed for {cluster}: {message}")]
    Collaborator {
        /// Collaborator name (e.g. "user-sync", "version-service")
        component: String,
        /// Name of the cluster being reconciled
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A teardown task has not completed yet
    #[error("teardown of {cluster} incomplete: {message}")]
    Teardown {
        /// Name of the cluster being deleted
        cluster: String,
        /// Description of what is still pending
        message: String,
    },

    /// One or more tiers failed to converge
    #[error("convergence failed for {cluster}: {message}")]
    Convergence {
        /// Name of the cluster being reconciled
        cluster: String,
        /// Combined failure description, one entry per failed tier
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "scheduler", "controller")
        context: String,
    },
}

impl Error {
    /// Map a kube-rs error for the given object into the store taxonomy
    ///
    /// 404 becomes [`Error::NotFound`], 409 with reason `AlreadyExists`
    /// becomes [`Error::AlreadyExists`]; everything else stays a
    /// [`Error::Kube`].
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref ae) if ae.code == 404 => Self::NotFound {
                kind: kind.into(),
                name: name.into(),
            },
            kube::Error::Api(ref ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
                Self::AlreadyExists {
                    kind: kind.into(),
                    name: name.into(),
                }
            }
            other => Self::Kube { source: other },
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a collaborator error
    pub fn collaborator(
        component: impl Into<String>,
        cluster: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Collaborator {
            component: component.into(),
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a teardown-incomplete error
    pub fn teardown(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Teardown {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a convergence error
    pub fn convergence(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Convergence {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True if the object was not found in the store
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// True if the object already exists in the store
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// True if this error came from the backing store rather than a collaborator
    ///
    /// Store errors halt a pass immediately; collaborator failures in one
    /// tier let the remaining tiers continue.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            Error::Kube { .. } | Error::NotFound { .. } | Error::AlreadyExists { .. }
        )
    }

    /// True if this is a spec validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
