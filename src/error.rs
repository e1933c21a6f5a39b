//! # Error taxonomy
//!
//! Every failure the injection pipeline can produce maps onto exactly one
//! variant here. The split matters operationally: parse-time variants abort a
//! whole plan, per-entry variants isolate a single secret, and only
//! [`InjectionError::BackendUnavailable`] is worth retrying.

use thiserror::Error;

/// Failures raised while parsing, resolving, rendering, or mirroring secrets.
#[derive(Debug, Error)]
pub enum InjectionError {
    /// Malformed or contradictory annotation configuration. Never retried and
    /// always fatal to the resolution that raised it.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A secret-reference notation string that does not parse.
    #[error("Invalid notation '{notation}': {reason}")]
    NotationInvalid { notation: String, reason: String },

    /// The vault has no record matching the requested uid, title, or path.
    #[error("Record not found: '{0}'")]
    RecordNotFound(String),

    /// The record exists but the requested field, file, or notes do not.
    #[error("Field '{field}' not found in record '{record}'")]
    FieldNotFound { record: String, field: String },

    /// More than one record carries the requested title under strict lookup.
    #[error("Title '{0}' matches more than one record (strict lookup)")]
    AmbiguousTitle(String),

    /// The vault could not be reached or refused the credential. The only
    /// retryable kind; also the trigger for the cache fallback.
    #[error("Secrets backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The vault answered with a payload the agent cannot interpret.
    #[error("Malformed backend response: {0}")]
    MalformedResponse(String),

    /// Template rendering failed for one plan entry.
    #[error("Template rendering failed for '{entry}': {reason}")]
    TemplateError { entry: String, reason: String },

    /// A mirrored Kubernetes Secret would exceed the etcd object ceiling.
    #[error("Mirrored secret '{name}' is {size} bytes, over the {limit} byte limit")]
    SizeLimitExceeded {
        name: String,
        size: usize,
        limit: usize,
    },

    /// A mirrored Kubernetes Secret already exists and the conflict policy
    /// is `fail`.
    #[error("Secret '{0}' already exists and the conflict policy forbids touching it")]
    ConflictPolicyViolation(String),

    /// Kubernetes API failure outside the conflict-policy paths.
    #[error("Kubernetes API error: {0}")]
    KubeApi(#[from] kube::Error),

    /// Filesystem failure while writing rendered output.
    #[error("Failed to write secret output: {0}")]
    OutputWrite(#[from] std::io::Error),
}

impl InjectionError {
    /// Whether the rotation loop should retry the operation that produced
    /// this error before falling back to the cache.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    /// Whether the error belongs to a single plan entry rather than the
    /// whole plan. Per-entry errors never abort sibling entries.
    #[must_use]
    pub fn is_per_entry(&self) -> bool {
        !matches!(self, Self::ConfigInvalid(_) | Self::NotationInvalid { .. })
    }
}
