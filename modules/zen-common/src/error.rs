use thiserror::Error;

/// Why a write was refused by the destination policy gate.
///
/// Carried separately from [`ZenError`] so callers can branch on the denial
/// reason without string matching.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyDenial {
    #[error("resource '{0}' is on the hard deny list")]
    GvrDenied(String),

    #[error("resource '{0}' is not on the allow list")]
    GvrNotAllowed(String),

    #[error("namespace '{0}' is not an allowed write target")]
    NamespaceNotAllowed(String),

    #[error("cluster-scoped writes to '{0}' are not allowed")]
    ClusterScopedNotAllowed(String),
}

impl PolicyDenial {
    /// Stable label for the `result` dimension of delivery metrics.
    pub fn metric_label(&self) -> &'static str {
        "not_allowed"
    }
}

#[derive(Error, Debug)]
pub enum ZenError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Write denied: {0}")]
    PolicyDenied(#[from] PolicyDenial),

    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Observation '{name}' already exists")]
    ConflictOnCreate { name: String },

    #[error("source '{source_name}' is already claimed by ingester '{owner}'")]
    ConfigurationDrift { source_name: String, owner: String },

    #[error("Fatal: {0}")]
    Fatal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl ZenError {
    /// True for errors worth retrying with backoff (informer disconnects,
    /// unreachable apiserver, 5xx responses).
    pub fn is_transient(&self) -> bool {
        matches!(self, ZenError::Transient(_))
    }
}
