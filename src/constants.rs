//! # Constants
//!
//! Shared constants used throughout the agent.
//!
//! These values represent reasonable defaults and can be overridden via
//! annotations or command-line flags where applicable.

/// Default HTTP server port for health and readiness probes
pub const DEFAULT_PROBE_PORT: u16 = 5000;

/// Default refresh interval between rotation ticks (seconds)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 300;

/// Minimum refresh interval (seconds)
/// Shorter intervals hammer the vault API without a realistic rotation win
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 10;

/// Number of fetch attempts per plan entry before the cache fallback kicks in
pub const FETCH_RETRY_ATTEMPTS: u32 = 3;

/// Exponential retry starting delay between fetch attempts (milliseconds)
pub const FETCH_RETRY_BASE_MS: u64 = 500;

/// Exponential retry maximum delay between fetch attempts (milliseconds)
pub const FETCH_RETRY_MAX_MS: u64 = 30_000;

/// Default absolute maximum age for cached resolutions (seconds)
/// A cached entry older than this is never served, even in degraded mode
pub const DEFAULT_CACHE_MAX_AGE_SECS: u64 = 3600;

/// Maximum serialized size of a mirrored Kubernetes Secret (bytes)
/// Matches the etcd object ceiling; larger payloads are rejected before write
pub const MAX_MIRRORED_SECRET_BYTES: usize = 1_048_576;

/// Length of a vault record uid (URL-safe base64, no padding)
pub const RECORD_UID_LEN: usize = 22;

/// Default mount root for rendered secret files
/// Relative and defaulted output paths are joined under this directory
pub const DEFAULT_OUTPUT_ROOT: &str = "/var/run/injected-secrets";

/// Default key holding the vault token inside a locator Kubernetes Secret
pub const DEFAULT_LOCATOR_SECRET_KEY: &str = "token";

/// Per-request timeout for vault and cloud locator HTTP calls (seconds)
pub const VAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default downward-API file the webhook mounts with the pod annotations
pub const DEFAULT_ANNOTATIONS_FILE: &str = "/etc/podinfo/annotations";

/// Value of the `app.kubernetes.io/managed-by` label on mirrored secrets
pub const MANAGED_BY: &str = "secret-injection-agent";

/// Pod annotation keys understood by the agent.
///
/// Everything lives under one prefix; keys outside it are ignored entirely,
/// unknown keys inside it are logged and skipped.
pub mod annotations {
    /// Prefix for all agent annotations
    pub const PREFIX: &str = "secret-injection.microscaler.io/";

    // -- secret selection --
    /// Single record name or uid
    pub const SECRET: &str = "secret";
    /// Comma-separated list of record names or uids
    pub const SECRETS: &str = "secrets";
    /// Per-record entries: `secret-<alias>` carries a path, a
    /// `record[field]:path` shorthand, or a notation string
    pub const SECRET_DASH: &str = "secret-";
    /// Structured YAML/JSON document describing secrets and folders
    pub const CONFIG: &str = "config";

    // -- folder selection --
    pub const FOLDER_UID: &str = "folder-uid";
    pub const FOLDER_PATH: &str = "folder-path";
    pub const FOLDER_OUTPUT: &str = "folder-output";
    /// Name prefix for mirrored secrets created from folder records
    pub const FOLDER_SECRET_PREFIX: &str = "folder-secret-prefix";

    // -- behavior --
    pub const REFRESH_INTERVAL: &str = "refresh-interval";
    pub const FAIL_ON_ERROR: &str = "fail-on-error";
    pub const INIT_ONLY: &str = "init-only";
    pub const STRICT_LOOKUP: &str = "strict-lookup";
    /// Unix signal name (e.g. `SIGHUP`) delivered after a changed rotation
    pub const SIGNAL: &str = "signal";
    /// Restrict the signal to sibling processes with this command name
    pub const SIGNAL_PROCESS: &str = "signal-process";
    pub const ENV_INJECT: &str = "env-inject";
    pub const ENV_PREFIX: &str = "env-prefix";

    // -- locator / auth --
    pub const LOCATOR_METHOD: &str = "locator-method";
    pub const LOCATOR_SECRET_NAME: &str = "locator-secret-name";
    pub const LOCATOR_SECRET_NAMESPACE: &str = "locator-secret-namespace";
    pub const LOCATOR_SECRET_KEY: &str = "locator-secret-key";
    pub const LOCATOR_AWS_SECRET_ID: &str = "locator-aws-secret-id";
    pub const LOCATOR_AWS_REGION: &str = "locator-aws-region";
    pub const LOCATOR_GCP_PROJECT: &str = "locator-gcp-project";
    pub const LOCATOR_GCP_SECRET: &str = "locator-gcp-secret";
    pub const LOCATOR_AZURE_VAULT: &str = "locator-azure-vault";
    pub const LOCATOR_AZURE_SECRET: &str = "locator-azure-secret";
    pub const CA_CERT_SOURCE: &str = "ca-cert-source";
    pub const CA_CERT_NAME: &str = "ca-cert-name";
    pub const CA_CERT_KEY: &str = "ca-cert-key";

    // -- kubernetes secret mirroring --
    pub const K8S_SECRET_NAME: &str = "k8s-secret-name";
    pub const K8S_SECRET_TYPE: &str = "k8s-secret-type";
    /// Field-to-key remapping, `field=key` pairs separated by commas
    pub const K8S_SECRET_KEYS: &str = "k8s-secret-keys";
    pub const K8S_SECRET_POLICY: &str = "k8s-secret-policy";
    pub const K8S_SECRET_OWNED: &str = "k8s-secret-owned";
}
