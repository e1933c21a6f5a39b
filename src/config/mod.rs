//! # Injection plan model
//!
//! The parsed, validated view of everything the pod's annotations asked for.
//! An [`InjectionPlan`] is immutable once built: the parser resolves every
//! default and inheritance rule up front so the resolution pipeline never
//! consults raw annotations again.
//!
//! ## Structure
//!
//! - [`SecretRef`] — one record to fetch and render
//! - [`FolderRef`] — one folder whose records are fetched and rendered
//! - [`LocatorConfig`] — where the vault credential itself lives
//! - [`InjectionPlan`] — the whole request, plus behavior flags

pub mod annotations;
pub mod document;
pub mod downward;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_LOCATOR_SECRET_KEY;
use crate::error::InjectionError;

pub use annotations::parse_annotations;
pub use downward::parse_downward_annotations;

/// Output format for a rendered secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretFormat {
    /// Structured JSON object, lossless round trip of all fields
    #[default]
    Json,
    /// Line-per-field `KEY=value` environment style
    Env,
    /// Exactly one field, written verbatim
    Raw,
    /// Java properties
    Properties,
    /// YAML mapping
    Yaml,
    /// Key-grouped INI sections
    Ini,
    /// User-supplied template with the fixed filter set
    Template,
}

impl SecretFormat {
    /// Parse a format name from an annotation value.
    pub fn parse(value: &str) -> Result<Self, InjectionError> {
        match value.trim().to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "env" => Ok(Self::Env),
            "raw" => Ok(Self::Raw),
            "properties" => Ok(Self::Properties),
            "yaml" => Ok(Self::Yaml),
            "ini" => Ok(Self::Ini),
            "template" => Ok(Self::Template),
            other => Err(InjectionError::ConfigInvalid(format!(
                "unknown output format '{other}' (expected json, env, raw, properties, yaml, ini, or template)"
            ))),
        }
    }
}

/// What to do when a mirrored Kubernetes Secret already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// Replace the existing data wholesale
    #[default]
    Overwrite,
    /// Union of existing and new keys, new values win
    Merge,
    /// Leave the existing object untouched
    SkipIfExists,
    /// Error out
    Fail,
}

impl ConflictPolicy {
    /// Parse a policy name from an annotation value.
    pub fn parse(value: &str) -> Result<Self, InjectionError> {
        match value.trim().to_lowercase().as_str() {
            "overwrite" => Ok(Self::Overwrite),
            "merge" => Ok(Self::Merge),
            "skip-if-exists" => Ok(Self::SkipIfExists),
            "fail" => Ok(Self::Fail),
            other => Err(InjectionError::ConfigInvalid(format!(
                "unknown conflict policy '{other}' (expected overwrite, merge, skip-if-exists, or fail)"
            ))),
        }
    }
}

/// Mirroring instructions for one secret entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    /// Name of the Kubernetes Secret to create or update
    pub name: String,
    /// Secret `type`; `Opaque` when unset
    pub secret_type: Option<String>,
    /// Explicit field-to-key remapping; `None` maps every field under its
    /// sanitized field name
    pub keys: Option<BTreeMap<String, String>>,
    pub policy: ConflictPolicy,
    /// Attach an ownerReference to the originating pod
    pub owned: bool,
}

impl MirrorTarget {
    /// Static validation: specialized secret types demand the key names
    /// Kubernetes expects for them.
    pub fn validate(&self) -> Result<(), InjectionError> {
        if self.secret_type.as_deref() == Some("kubernetes.io/tls") {
            let has = |want: &str| {
                self.keys
                    .as_ref()
                    .is_some_and(|m| m.values().any(|k| k == want))
            };
            if !has("tls.crt") || !has("tls.key") {
                return Err(InjectionError::ConfigInvalid(format!(
                    "mirrored secret '{}' of type kubernetes.io/tls needs a key mapping onto tls.crt and tls.key",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

/// One record to resolve and write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    /// Record uid or human title; informative only when `notation` is set
    pub name: String,
    /// Absolute path of the rendered file; never empty after parsing
    pub output_path: PathBuf,
    /// Field subset to render, in annotation order; empty means all fields
    pub fields: Vec<String>,
    pub format: SecretFormat,
    /// Template body when `format` is [`SecretFormat::Template`]
    pub template: Option<String>,
    /// Full notation string; when set it drives resolution on its own
    pub notation: Option<String>,
    /// File attachment to download instead of rendering fields
    pub file_name: Option<String>,
    /// Also emit a `<output_path>.env` export file
    pub env_inject: bool,
    /// Prefix for exported variable names
    pub env_prefix: Option<String>,
    pub mirror: Option<MirrorTarget>,
}

impl SecretRef {
    /// Short label for log lines and per-entry error messages.
    #[must_use]
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            self.notation.as_deref().unwrap_or("<unnamed>")
        } else {
            &self.name
        }
    }

    /// Context-free validation; cross-field rules involving notation live in
    /// the annotation parser where the notation is already parsed.
    pub fn validate(&self) -> Result<(), InjectionError> {
        if self.name.is_empty() && self.notation.is_none() {
            return Err(InjectionError::ConfigInvalid(
                "secret entry has neither a record name nor a notation".to_string(),
            ));
        }
        if self.notation.is_some() && self.file_name.is_some() {
            return Err(InjectionError::ConfigInvalid(format!(
                "secret '{}' sets both a notation and a file attachment; exactly one may drive resolution",
                self.label()
            )));
        }
        if self.file_name.is_some() && self.name.is_empty() {
            return Err(InjectionError::ConfigInvalid(
                "file attachment entry needs a record name or uid".to_string(),
            ));
        }
        if self.format == SecretFormat::Template && self.template.is_none() {
            return Err(InjectionError::ConfigInvalid(format!(
                "secret '{}' requests template output but carries no template",
                self.label()
            )));
        }
        if self.format == SecretFormat::Raw
            && self.notation.is_none()
            && self.file_name.is_none()
            && self.fields.len() != 1
        {
            return Err(InjectionError::ConfigInvalid(format!(
                "secret '{}' requests single-raw-value output but selects {} fields instead of one",
                self.label(),
                self.fields.len()
            )));
        }
        if let Some(mirror) = &self.mirror {
            mirror.validate()?;
        }
        Ok(())
    }
}

/// One folder whose records are all resolved and written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderRef {
    /// Folder uid; preferred over `path` when both are present
    pub uid: Option<String>,
    /// Slash-separated folder path, resolved by a tree walk
    pub path: Option<String>,
    /// Directory the folder's records are rendered into
    pub output_path: PathBuf,
    /// Mirror each record into a Secret named `<prefix><record slug>`
    pub secret_prefix: Option<String>,
    pub policy: ConflictPolicy,
    pub owned: bool,
}

impl FolderRef {
    /// Short label for log lines.
    #[must_use]
    pub fn label(&self) -> &str {
        self.uid
            .as_deref()
            .or(self.path.as_deref())
            .unwrap_or("<unnamed>")
    }

    pub fn validate(&self) -> Result<(), InjectionError> {
        if self.uid.is_none() && self.path.is_none() {
            return Err(InjectionError::ConfigInvalid(
                "folder entry needs a folder uid or a folder path".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the vault's own credential is stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorConfig {
    /// Kubernetes Secret in the workload namespace (the default method)
    K8sSecret {
        name: String,
        namespace: Option<String>,
        key: String,
    },
    AwsSecretsManager {
        secret_id: String,
        region: Option<String>,
    },
    GcpSecretManager {
        project_id: String,
        secret: String,
    },
    AzureKeyVault {
        vault: String,
        secret: String,
    },
}

impl LocatorConfig {
    /// Method name as it appears in annotations and logs.
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::K8sSecret { .. } => "k8s-secret",
            Self::AwsSecretsManager { .. } => "aws-secrets-manager",
            Self::GcpSecretManager { .. } => "gcp-secret-manager",
            Self::AzureKeyVault { .. } => "azure-key-vault",
        }
    }
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self::K8sSecret {
            name: String::new(),
            namespace: None,
            key: DEFAULT_LOCATOR_SECRET_KEY.to_string(),
        }
    }
}

/// Custom CA material for the vault TLS connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaSource {
    Secret { name: String, key: String },
    ConfigMap { name: String, key: String },
    File { path: PathBuf },
}

/// Change notification delivered after a rotation tick that rewrote files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    /// Signal name, e.g. `SIGHUP`
    pub signal: String,
    /// Only deliver to sibling processes with this command name
    pub process: Option<String>,
}

/// The complete, validated injection request for one pod.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionPlan {
    pub secrets: Vec<SecretRef>,
    pub folders: Vec<FolderRef>,
    pub locator: LocatorConfig,
    /// Fail closed: a first resolution that cannot produce secrets kills the
    /// startup instead of starting the workload without them
    pub fail_on_error: bool,
    /// Treat duplicate titles as an error instead of first-match-wins
    pub strict_lookup: bool,
    pub refresh_interval: Duration,
    pub signal: Option<ChangeSignal>,
    /// Resolve once and exit (init-container mode)
    pub init_only: bool,
    pub ca_cert: Option<CaSource>,
}

impl InjectionPlan {
    /// Whether the plan selects anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty() && self.folders.is_empty()
    }

    /// Total number of plan entries, folders included.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.secrets.len() + self.folders.len()
    }
}

/// Global defaults inherited by every entry at parse time. Resolved once;
/// the resolution pipeline never looks back at the raw annotations.
#[derive(Debug, Clone, Default)]
pub(crate) struct EntryDefaults {
    pub env_inject: bool,
    pub env_prefix: Option<String>,
    pub mirror_policy: ConflictPolicy,
    pub mirror_owned: Option<bool>,
    pub mirror_type: Option<String>,
}

impl EntryDefaults {
    pub(crate) fn owned(&self) -> bool {
        self.mirror_owned.unwrap_or(true)
    }
}

/// Parse a Kubernetes-style duration string (`30s`, `5m`, `1h`, `2d`).
pub fn parse_duration(value: &str) -> Result<Duration, InjectionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(InjectionError::ConfigInvalid(
            "duration string cannot be empty".to_string(),
        ));
    }

    let pattern = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd])$").map_err(|e| {
        InjectionError::ConfigInvalid(format!("failed to compile duration regex: {e}"))
    })?;
    let lower = trimmed.to_lowercase();
    let captures = pattern.captures(&lower).ok_or_else(|| {
        InjectionError::ConfigInvalid(format!(
            "invalid duration '{trimmed}', expected <number><unit> (e.g. '30s', '5m', '1h')"
        ))
    })?;

    let number: u64 = captures["number"].parse().map_err(|e| {
        InjectionError::ConfigInvalid(format!("invalid duration number in '{trimmed}': {e}"))
    })?;
    let secs = match &captures["unit"] {
        "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        unit => {
            return Err(InjectionError::ConfigInvalid(format!(
                "invalid duration unit '{unit}' in '{trimmed}'"
            )))
        }
    };
    Ok(Duration::from_secs(secs))
}

/// Parse an annotation boolean. Only `true` and `false` are accepted; typos
/// in behavior flags should fail loudly, not default silently.
pub fn parse_bool(key: &str, value: &str) -> Result<bool, InjectionError> {
    match value.trim().to_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(InjectionError::ConfigInvalid(format!(
            "annotation '{key}' must be 'true' or 'false', got '{other}'"
        ))),
    }
}

/// Lower-cased, dash-normalized form of a record name, used for defaulted
/// file names and mirrored-secret name suffixes.
#[must_use]
pub fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        "record".to_string()
    } else {
        out
    }
}

/// Resolve an output path against the mount root: absolute paths are honored
/// as written, everything else lands under the root.
#[must_use]
pub fn resolve_output_path(root: &Path, value: &str) -> PathBuf {
    let trimmed = value.trim();
    if trimmed.starts_with('/') {
        PathBuf::from(trimmed)
    } else {
        root.join(trimmed)
    }
}

/// Default output path for a named record.
#[must_use]
pub fn default_output_path(root: &Path, name: &str) -> PathBuf {
    root.join(slug(name))
}
