//! # Annotation parsing
//!
//! Turns a pod's annotation map into an [`InjectionPlan`]. Six levels of
//! expressiveness feed one canonical entry list:
//!
//! 1. `secret: "db-creds"` — a single record name
//! 2. `secrets: "db-creds, api-keys"` — a comma-separated list
//! 3. `secret-<alias>: "/abs/path"` — per-record output path (empty value
//!    defaults the path from the alias)
//! 4. `secret-<alias>: "record[field]:path"` — field-extraction shorthand
//! 5. `secret-<alias>: "<notation>"` — full notation, inline `:path` included
//! 6. `config: |` — a structured YAML/JSON document
//!
//! Levels 3-5 share the `secret-` key space; the value's shape decides which
//! one applies. All levels concatenate: single name first, then the list,
//! then the per-record keys in their lexicographic key order, then the
//! document in its own order. Annotation maps are unordered, so this fixed
//! order is what makes file-collision behavior reproducible.
//!
//! Parsing is all-or-nothing. One malformed value fails the whole plan; a
//! partially-applied plan is worse than a failed pod start.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use crate::constants::{annotations as keys, MIN_REFRESH_INTERVAL_SECS};
use crate::constants::{DEFAULT_LOCATOR_SECRET_KEY, DEFAULT_REFRESH_INTERVAL_SECS};
use crate::error::InjectionError;
use crate::notation;

use super::{
    default_output_path, document, parse_bool, parse_duration, resolve_output_path, CaSource,
    ChangeSignal, ConflictPolicy, EntryDefaults, FolderRef, InjectionPlan, LocatorConfig,
    MirrorTarget, SecretFormat, SecretRef,
};

/// Shape of a `secret-<alias>` value. The variant, not the key, selects the
/// parsing level.
#[derive(Debug, PartialEq, Eq)]
enum Shorthand {
    /// Empty value: the alias is the record name, the path is defaulted
    DefaultPath,
    /// Absolute output path for the aliased record
    Path(String),
    /// `record[field]` with an optional `:path` tail
    FieldExtract {
        record: String,
        field: String,
        path: Option<String>,
    },
    /// Anything with notation shape, parsed and validated as such
    Notation(String),
}

fn classify_shorthand(alias: &str, value: &str) -> Result<Shorthand, InjectionError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Shorthand::DefaultPath);
    }
    if trimmed.starts_with('/') {
        return Ok(Shorthand::Path(trimmed.to_string()));
    }
    if trimmed.contains('[') {
        return parse_field_extract(alias, trimmed);
    }
    if notation::is_notation_shape(trimmed) {
        return Ok(Shorthand::Notation(trimmed.to_string()));
    }
    Err(InjectionError::ConfigInvalid(format!(
        "secret-{alias}: '{trimmed}' is neither an absolute path, a 'record[field]' shorthand, nor a notation"
    )))
}

fn parse_field_extract(alias: &str, value: &str) -> Result<Shorthand, InjectionError> {
    let bad = |reason: &str| {
        InjectionError::ConfigInvalid(format!("secret-{alias}: {reason} in '{value}'"))
    };

    let open = value.find('[').ok_or_else(|| bad("missing '['"))?;
    let close = value.find(']').ok_or_else(|| bad("missing ']'"))?;
    if close < open {
        return Err(bad("']' before '['"));
    }

    let record = value[..open].trim();
    let field = value[open + 1..close].trim();
    if record.is_empty() {
        return Err(bad("empty record name"));
    }
    if field.is_empty() {
        return Err(bad("empty field name"));
    }

    let rest = &value[close + 1..];
    let path = if rest.is_empty() {
        None
    } else if let Some(p) = rest.strip_prefix(':') {
        if p.trim().is_empty() {
            return Err(bad("empty output path after ':'"));
        }
        Some(p.trim().to_string())
    } else {
        return Err(bad("unexpected trailing characters after ']'"));
    };

    Ok(Shorthand::FieldExtract {
        record: record.to_string(),
        field: field.to_string(),
        path,
    })
}

/// Parse the agent's annotation group into an injection plan.
///
/// Keys outside the prefix are ignored entirely. Unknown keys inside the
/// prefix are logged at warn level and skipped, so one typo in an optional
/// flag does not take the pod down; typos in values still do.
pub fn parse_annotations(
    annotations: &BTreeMap<String, String>,
    output_root: &Path,
) -> Result<InjectionPlan, InjectionError> {
    let mut flat: BTreeMap<String, String> = BTreeMap::new();
    let mut shorthands: Vec<(String, String)> = Vec::new();

    for (key, value) in annotations {
        let Some(suffix) = key.strip_prefix(keys::PREFIX) else {
            continue;
        };
        if let Some(alias) = suffix.strip_prefix(keys::SECRET_DASH) {
            if alias.is_empty() {
                return Err(InjectionError::ConfigInvalid(
                    "'secret-' annotation with an empty alias".to_string(),
                ));
            }
            shorthands.push((alias.to_string(), value.clone()));
        } else {
            flat.insert(suffix.to_string(), value.clone());
        }
    }

    if flat.is_empty() && shorthands.is_empty() {
        // Nothing addressed to us at all.
        return Ok(empty_plan());
    }

    let defaults = parse_defaults(&mut flat)?;
    let behavior = parse_behavior(&mut flat)?;
    let mut secrets = Vec::new();
    let mut folders = Vec::new();

    // Level 1: single name.
    if let Some(value) = flat.remove(keys::SECRET) {
        let name = value.trim();
        if name.is_empty() {
            return Err(InjectionError::ConfigInvalid(
                "'secret' annotation is empty".to_string(),
            ));
        }
        secrets.push(named_entry(name, output_root, &defaults));
    }

    // Level 2: comma list.
    if let Some(value) = flat.remove(keys::SECRETS) {
        let names: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err(InjectionError::ConfigInvalid(
                "'secrets' annotation lists no names".to_string(),
            ));
        }
        for name in names {
            secrets.push(named_entry(name, output_root, &defaults));
        }
    }

    // Levels 3-5: per-record shorthands, in lexicographic alias order
    // (shorthands were collected from a BTreeMap walk, so they already are).
    for (alias, value) in &shorthands {
        secrets.push(shorthand_entry(alias, value, output_root, &defaults)?);
    }

    let flat_secret_count = secrets.len();

    // Level 6: structured document.
    if let Some(value) = flat.remove(keys::CONFIG) {
        let (doc_secrets, doc_folders) =
            document::parse_document(&value, output_root, &defaults)?;
        secrets.extend(doc_secrets);
        folders.extend(doc_folders);
    }

    if let Some(folder) = parse_flat_folder(&mut flat, output_root, &defaults)? {
        folders.push(folder);
    }

    attach_flat_mirror(&mut flat, &mut secrets, flat_secret_count, &defaults)?;

    if secrets.is_empty() && folders.is_empty() {
        return Err(InjectionError::ConfigInvalid(
            "injection annotations are present but select no secrets or folders".to_string(),
        ));
    }

    let locator = parse_locator(&mut flat)?;
    let ca_cert = parse_ca(&mut flat)?;

    for key in flat.keys() {
        warn!(key = %key, "⚠️ Ignoring unknown annotation key");
    }

    for entry in &secrets {
        entry.validate()?;
    }
    for folder in &folders {
        folder.validate()?;
    }

    Ok(InjectionPlan {
        secrets,
        folders,
        locator,
        fail_on_error: behavior.fail_on_error,
        strict_lookup: behavior.strict_lookup,
        refresh_interval: behavior.refresh_interval,
        signal: behavior.signal,
        init_only: behavior.init_only,
        ca_cert,
    })
}

fn empty_plan() -> InjectionPlan {
    InjectionPlan {
        secrets: Vec::new(),
        folders: Vec::new(),
        locator: LocatorConfig::default(),
        fail_on_error: true,
        strict_lookup: false,
        refresh_interval: std::time::Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
        signal: None,
        init_only: false,
        ca_cert: None,
    }
}

fn named_entry(name: &str, root: &Path, defaults: &EntryDefaults) -> SecretRef {
    SecretRef {
        name: name.to_string(),
        output_path: default_output_path(root, name),
        fields: Vec::new(),
        format: SecretFormat::Json,
        template: None,
        notation: None,
        file_name: None,
        env_inject: defaults.env_inject,
        env_prefix: defaults.env_prefix.clone(),
        mirror: None,
    }
}

fn shorthand_entry(
    alias: &str,
    value: &str,
    root: &Path,
    defaults: &EntryDefaults,
) -> Result<SecretRef, InjectionError> {
    let mut entry = named_entry(alias, root, defaults);
    match classify_shorthand(alias, value)? {
        Shorthand::DefaultPath => {}
        Shorthand::Path(path) => {
            entry.output_path = resolve_output_path(root, &path);
        }
        Shorthand::FieldExtract {
            record,
            field,
            path,
        } => {
            entry.name = record;
            entry.fields = vec![field];
            entry.format = SecretFormat::Raw;
            if let Some(path) = path {
                entry.output_path = resolve_output_path(root, &path);
            } else {
                entry.output_path = default_output_path(root, alias);
            }
        }
        Shorthand::Notation(raw) => {
            let parsed = notation::parse(&raw)?;
            entry.format = if parsed.selector.is_single_value() {
                SecretFormat::Raw
            } else {
                SecretFormat::Json
            };
            if let Some(path) = &parsed.output_path {
                entry.output_path = resolve_output_path(root, path);
            }
            entry.notation = Some(raw);
        }
    }
    Ok(entry)
}

#[derive(Debug)]
struct Behavior {
    fail_on_error: bool,
    strict_lookup: bool,
    refresh_interval: std::time::Duration,
    signal: Option<ChangeSignal>,
    init_only: bool,
}

fn parse_behavior(flat: &mut BTreeMap<String, String>) -> Result<Behavior, InjectionError> {
    let fail_on_error = match flat.remove(keys::FAIL_ON_ERROR) {
        Some(v) => parse_bool(keys::FAIL_ON_ERROR, &v)?,
        None => true,
    };
    let strict_lookup = match flat.remove(keys::STRICT_LOOKUP) {
        Some(v) => parse_bool(keys::STRICT_LOOKUP, &v)?,
        None => false,
    };
    let init_only = match flat.remove(keys::INIT_ONLY) {
        Some(v) => parse_bool(keys::INIT_ONLY, &v)?,
        None => false,
    };

    let refresh_interval = match flat.remove(keys::REFRESH_INTERVAL) {
        Some(v) => {
            let parsed = parse_duration(&v)?;
            if parsed.as_secs() < MIN_REFRESH_INTERVAL_SECS {
                return Err(InjectionError::ConfigInvalid(format!(
                    "refresh-interval '{}' is below the {MIN_REFRESH_INTERVAL_SECS}s minimum",
                    v.trim()
                )));
            }
            parsed
        }
        None => std::time::Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
    };

    let signal = match flat.remove(keys::SIGNAL) {
        Some(name) => {
            let name = name.trim().to_string();
            crate::notify::signal_from_name(&name)?;
            Some(ChangeSignal {
                signal: name,
                process: flat.remove(keys::SIGNAL_PROCESS).map(|p| p.trim().to_string()),
            })
        }
        None => {
            if flat.remove(keys::SIGNAL_PROCESS).is_some() {
                return Err(InjectionError::ConfigInvalid(
                    "'signal-process' is set but 'signal' is not".to_string(),
                ));
            }
            None
        }
    };

    Ok(Behavior {
        fail_on_error,
        strict_lookup,
        refresh_interval,
        signal,
        init_only,
    })
}

fn parse_defaults(flat: &mut BTreeMap<String, String>) -> Result<EntryDefaults, InjectionError> {
    let env_inject = match flat.remove(keys::ENV_INJECT) {
        Some(v) => parse_bool(keys::ENV_INJECT, &v)?,
        None => false,
    };
    let env_prefix = flat.remove(keys::ENV_PREFIX).map(|p| p.trim().to_string());
    let mirror_policy = match flat.remove(keys::K8S_SECRET_POLICY) {
        Some(v) => ConflictPolicy::parse(&v)?,
        None => ConflictPolicy::default(),
    };
    let mirror_owned = match flat.remove(keys::K8S_SECRET_OWNED) {
        Some(v) => Some(parse_bool(keys::K8S_SECRET_OWNED, &v)?),
        None => None,
    };
    let mirror_type = flat.remove(keys::K8S_SECRET_TYPE).map(|t| t.trim().to_string());

    Ok(EntryDefaults {
        env_inject,
        env_prefix,
        mirror_policy,
        mirror_owned,
        mirror_type,
    })
}

fn parse_flat_folder(
    flat: &mut BTreeMap<String, String>,
    root: &Path,
    defaults: &EntryDefaults,
) -> Result<Option<FolderRef>, InjectionError> {
    let uid = flat.remove(keys::FOLDER_UID).map(|v| v.trim().to_string());
    let path = flat.remove(keys::FOLDER_PATH).map(|v| v.trim().to_string());
    let output = flat.remove(keys::FOLDER_OUTPUT);
    let prefix = flat.remove(keys::FOLDER_SECRET_PREFIX);

    if uid.is_none() && path.is_none() {
        if output.is_some() || prefix.is_some() {
            return Err(InjectionError::ConfigInvalid(
                "folder output/prefix annotations are set but neither folder-uid nor folder-path is".to_string(),
            ));
        }
        return Ok(None);
    }

    let label = uid
        .as_deref()
        .or(path.as_deref())
        .unwrap_or_default()
        .to_string();
    let output_path = match output {
        Some(v) => resolve_output_path(root, &v),
        None => default_output_path(root, &label),
    };

    Ok(Some(FolderRef {
        uid: uid.filter(|v| !v.is_empty()),
        path: path.filter(|v| !v.is_empty()),
        output_path,
        secret_prefix: prefix.map(|p| p.trim().to_string()),
        policy: defaults.mirror_policy,
        owned: defaults.owned(),
    }))
}

fn attach_flat_mirror(
    flat: &mut BTreeMap<String, String>,
    secrets: &mut [SecretRef],
    flat_secret_count: usize,
    defaults: &EntryDefaults,
) -> Result<(), InjectionError> {
    let Some(name) = flat.remove(keys::K8S_SECRET_NAME) else {
        if flat.contains_key(keys::K8S_SECRET_KEYS) {
            return Err(InjectionError::ConfigInvalid(
                "'k8s-secret-keys' is set but 'k8s-secret-name' is not".to_string(),
            ));
        }
        return Ok(());
    };

    if flat_secret_count != 1 {
        return Err(InjectionError::ConfigInvalid(format!(
            "'k8s-secret-name' needs exactly one flat secret entry to attach to, found {flat_secret_count}"
        )));
    }

    let keys_map = match flat.remove(keys::K8S_SECRET_KEYS) {
        Some(v) => Some(parse_key_map(&v)?),
        None => None,
    };

    let target = MirrorTarget {
        name: name.trim().to_string(),
        secret_type: defaults.mirror_type.clone(),
        keys: keys_map,
        policy: defaults.mirror_policy,
        owned: defaults.owned(),
    };
    target.validate()?;
    secrets[0].mirror = Some(target);
    Ok(())
}

/// Parse a `field=key,other=other-key` remapping list.
fn parse_key_map(value: &str) -> Result<BTreeMap<String, String>, InjectionError> {
    let mut map = BTreeMap::new();
    for pair in value.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((field, key)) = pair.split_once('=') else {
            return Err(InjectionError::ConfigInvalid(format!(
                "key mapping '{pair}' is not of the form field=key"
            )));
        };
        let (field, key) = (field.trim(), key.trim());
        if field.is_empty() || key.is_empty() {
            return Err(InjectionError::ConfigInvalid(format!(
                "key mapping '{pair}' has an empty side"
            )));
        }
        map.insert(field.to_string(), key.to_string());
    }
    if map.is_empty() {
        return Err(InjectionError::ConfigInvalid(
            "key mapping lists no pairs".to_string(),
        ));
    }
    Ok(map)
}

fn take_required(
    flat: &mut BTreeMap<String, String>,
    method: &str,
    key: &str,
) -> Result<String, InjectionError> {
    flat.remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            InjectionError::ConfigInvalid(format!(
                "locator method '{method}' requires the '{key}' annotation"
            ))
        })
}

fn parse_locator(flat: &mut BTreeMap<String, String>) -> Result<LocatorConfig, InjectionError> {
    let method = flat
        .remove(keys::LOCATOR_METHOD)
        .map(|m| m.trim().to_lowercase())
        .unwrap_or_else(|| "k8s-secret".to_string());

    let locator = match method.as_str() {
        "k8s-secret" => LocatorConfig::K8sSecret {
            name: take_required(flat, &method, keys::LOCATOR_SECRET_NAME)?,
            namespace: flat
                .remove(keys::LOCATOR_SECRET_NAMESPACE)
                .map(|v| v.trim().to_string()),
            key: flat
                .remove(keys::LOCATOR_SECRET_KEY)
                .map_or_else(|| DEFAULT_LOCATOR_SECRET_KEY.to_string(), |v| v.trim().to_string()),
        },
        "aws-secrets-manager" => LocatorConfig::AwsSecretsManager {
            secret_id: take_required(flat, &method, keys::LOCATOR_AWS_SECRET_ID)?,
            region: flat
                .remove(keys::LOCATOR_AWS_REGION)
                .map(|v| v.trim().to_string()),
        },
        "gcp-secret-manager" => LocatorConfig::GcpSecretManager {
            project_id: take_required(flat, &method, keys::LOCATOR_GCP_PROJECT)?,
            secret: take_required(flat, &method, keys::LOCATOR_GCP_SECRET)?,
        },
        "azure-key-vault" => LocatorConfig::AzureKeyVault {
            vault: take_required(flat, &method, keys::LOCATOR_AZURE_VAULT)?,
            secret: take_required(flat, &method, keys::LOCATOR_AZURE_SECRET)?,
        },
        other => {
            return Err(InjectionError::ConfigInvalid(format!(
                "unknown locator method '{other}' (expected k8s-secret, aws-secrets-manager, gcp-secret-manager, or azure-key-vault)"
            )))
        }
    };
    Ok(locator)
}

fn parse_ca(flat: &mut BTreeMap<String, String>) -> Result<Option<CaSource>, InjectionError> {
    let source = flat.remove(keys::CA_CERT_SOURCE).map(|v| v.trim().to_lowercase());
    let name = flat.remove(keys::CA_CERT_NAME).map(|v| v.trim().to_string());
    let key = flat.remove(keys::CA_CERT_KEY).map(|v| v.trim().to_string());

    let Some(source) = source else {
        if name.is_some() || key.is_some() {
            return Err(InjectionError::ConfigInvalid(
                "'ca-cert-name'/'ca-cert-key' are set but 'ca-cert-source' is not".to_string(),
            ));
        }
        return Ok(None);
    };

    let name = name.ok_or_else(|| {
        InjectionError::ConfigInvalid("'ca-cert-source' is set but 'ca-cert-name' is not".to_string())
    })?;
    let key = key.unwrap_or_else(|| "ca.crt".to_string());

    let ca = match source.as_str() {
        "secret" => CaSource::Secret { name, key },
        "configmap" => CaSource::ConfigMap { name, key },
        "file" => CaSource::File {
            path: std::path::PathBuf::from(name),
        },
        other => {
            return Err(InjectionError::ConfigInvalid(format!(
                "unknown ca-cert-source '{other}' (expected secret, configmap, or file)"
            )))
        }
    };
    Ok(Some(ca))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ann(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (format!("{}{k}", keys::PREFIX), (*v).to_string()))
            .collect()
    }

    fn root() -> PathBuf {
        PathBuf::from("/var/run/injected-secrets")
    }

    fn minimal(extra: &[(&str, &str)]) -> BTreeMap<String, String> {
        let mut pairs = vec![("locator-secret-name", "vault-token")];
        pairs.extend_from_slice(extra);
        ann(&pairs)
    }

    #[test]
    fn test_shorthand_classification() {
        let cases = vec![
            ("", Shorthand::DefaultPath),
            ("/app/secrets/db", Shorthand::Path("/app/secrets/db".to_string())),
            (
                "db-creds[password]",
                Shorthand::FieldExtract {
                    record: "db-creds".to_string(),
                    field: "password".to_string(),
                    path: None,
                },
            ),
            (
                "db-creds[password]:/app/secrets/pw",
                Shorthand::FieldExtract {
                    record: "db-creds".to_string(),
                    field: "password".to_string(),
                    path: Some("/app/secrets/pw".to_string()),
                },
            ),
            (
                "ABC/field/password",
                Shorthand::Notation("ABC/field/password".to_string()),
            ),
            (
                "keeper://ABC/field/password:/app/secrets/db-pass",
                Shorthand::Notation("keeper://ABC/field/password:/app/secrets/db-pass".to_string()),
            ),
        ];
        for (value, expected) in cases {
            let got = classify_shorthand("x", value)
                .unwrap_or_else(|e| panic!("'{value}' failed: {e}"));
            assert_eq!(got, expected, "wrong shape for '{value}'");
        }

        for bad in ["db-creds[]", "[password]", "db-creds[password]x", "plainword"] {
            assert!(
                classify_shorthand("x", bad).is_err(),
                "'{bad}' should not classify"
            );
        }
    }

    #[test]
    fn test_level_one_single_name() {
        let plan = parse_annotations(&minimal(&[("secret", "db-creds")]), &root()).unwrap();
        assert_eq!(plan.secrets.len(), 1);
        assert_eq!(plan.secrets[0].name, "db-creds");
        assert_eq!(
            plan.secrets[0].output_path,
            PathBuf::from("/var/run/injected-secrets/db-creds")
        );
        assert_eq!(plan.secrets[0].format, SecretFormat::Json);
    }

    #[test]
    fn test_level_two_comma_list() {
        let plan =
            parse_annotations(&minimal(&[("secrets", "db-creds, api-keys")]), &root()).unwrap();
        let names: Vec<&str> = plan.secrets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db-creds", "api-keys"]);
    }

    #[test]
    fn test_level_four_field_extract() {
        let plan = parse_annotations(
            &minimal(&[("secret-db-pass", "db-creds[password]:/app/secrets/pw")]),
            &root(),
        )
        .unwrap();
        let entry = &plan.secrets[0];
        assert_eq!(entry.name, "db-creds");
        assert_eq!(entry.fields, vec!["password".to_string()]);
        assert_eq!(entry.format, SecretFormat::Raw);
        assert_eq!(entry.output_path, PathBuf::from("/app/secrets/pw"));
    }

    #[test]
    fn test_level_five_notation_shorthand() {
        let plan = parse_annotations(
            &minimal(&[("secret-db-pass", "keeper://ABC123/field/password:/app/secrets/db-pass")]),
            &root(),
        )
        .unwrap();
        let entry = &plan.secrets[0];
        assert_eq!(
            entry.notation.as_deref(),
            Some("keeper://ABC123/field/password:/app/secrets/db-pass")
        );
        assert_eq!(entry.format, SecretFormat::Raw);
        assert_eq!(entry.output_path, PathBuf::from("/app/secrets/db-pass"));
    }

    #[test]
    fn test_levels_concatenate_in_order() {
        let plan = parse_annotations(
            &minimal(&[
                ("secret", "first"),
                ("secrets", "second, third"),
                ("secret-beta", "/out/beta"),
                ("secret-alpha", "/out/alpha"),
            ]),
            &root(),
        )
        .unwrap();
        let names: Vec<&str> = plan.secrets.iter().map(|s| s.name.as_str()).collect();
        // Shorthands sort by alias, after the single name and the list.
        assert_eq!(names, vec!["first", "second", "third", "alpha", "beta"]);
    }

    #[test]
    fn test_parse_is_idempotent_and_order_independent() {
        let forward = minimal(&[
            ("secret", "db-creds"),
            ("secrets", "a, b"),
            ("secret-z", "/out/z"),
            ("refresh-interval", "1m"),
        ]);
        // Same pairs, different insertion order.
        let mut reversed = BTreeMap::new();
        for (k, v) in forward.iter().rev() {
            reversed.insert(k.clone(), v.clone());
        }

        let once = parse_annotations(&forward, &root()).unwrap();
        let twice = parse_annotations(&forward, &root()).unwrap();
        let shuffled = parse_annotations(&reversed, &root()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, shuffled);
    }

    #[test]
    fn test_one_bad_entry_fails_the_whole_plan() {
        let result = parse_annotations(
            &minimal(&[
                ("secret", "good"),
                ("secret-bad", "ABC/field"), // notation missing its parameter
            ]),
            &root(),
        );
        match result {
            Err(InjectionError::NotationInvalid { .. }) => {}
            other => panic!("expected NotationInvalid, got {other:?}"),
        }
    }

    #[test]
    fn test_unrelated_annotations_are_ignored() {
        let mut map = minimal(&[("secret", "db-creds")]);
        map.insert("prometheus.io/scrape".to_string(), "true".to_string());
        map.insert("kubectl.kubernetes.io/last-applied".to_string(), "{}".to_string());
        let plan = parse_annotations(&map, &root()).unwrap();
        assert_eq!(plan.secrets.len(), 1);
    }

    #[test]
    fn test_no_agent_annotations_is_an_empty_plan() {
        let mut map = BTreeMap::new();
        map.insert("prometheus.io/scrape".to_string(), "true".to_string());
        let plan = parse_annotations(&map, &root()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_behavior_flags_select_no_secrets_is_an_error() {
        let result = parse_annotations(&ann(&[("fail-on-error", "false")]), &root());
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }

    #[test]
    fn test_locator_required_under_default_method() {
        let result = parse_annotations(&ann(&[("secret", "db-creds")]), &root());
        let err = result.expect_err("missing locator must fail");
        assert!(
            err.to_string().contains("locator-secret-name"),
            "unhelpful error: {err}"
        );
    }

    #[test]
    fn test_locator_methods() {
        let plan = parse_annotations(
            &ann(&[
                ("secret", "db-creds"),
                ("locator-method", "aws-secrets-manager"),
                ("locator-aws-secret-id", "prod/vault-token"),
                ("locator-aws-region", "eu-west-2"),
            ]),
            &root(),
        )
        .unwrap();
        assert_eq!(
            plan.locator,
            LocatorConfig::AwsSecretsManager {
                secret_id: "prod/vault-token".to_string(),
                region: Some("eu-west-2".to_string()),
            }
        );

        let result = parse_annotations(
            &ann(&[("secret", "x"), ("locator-method", "hashicorp")]),
            &root(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_behavior_flags() {
        let plan = parse_annotations(
            &minimal(&[
                ("secret", "db-creds"),
                ("refresh-interval", "30s"),
                ("fail-on-error", "false"),
                ("strict-lookup", "true"),
                ("init-only", "true"),
                ("signal", "SIGHUP"),
                ("signal-process", "nginx"),
            ]),
            &root(),
        )
        .unwrap();
        assert_eq!(plan.refresh_interval.as_secs(), 30);
        assert!(!plan.fail_on_error);
        assert!(plan.strict_lookup);
        assert!(plan.init_only);
        assert_eq!(
            plan.signal,
            Some(ChangeSignal {
                signal: "SIGHUP".to_string(),
                process: Some("nginx".to_string()),
            })
        );
    }

    #[test]
    fn test_defaults_are_fail_closed_and_permissive_lookup() {
        let plan = parse_annotations(&minimal(&[("secret", "db-creds")]), &root()).unwrap();
        assert!(plan.fail_on_error, "fail-on-error must default to true");
        assert!(!plan.strict_lookup, "strict-lookup must default to false");
        assert!(!plan.init_only);
        assert_eq!(plan.refresh_interval.as_secs(), DEFAULT_REFRESH_INTERVAL_SECS);
    }

    #[test]
    fn test_refresh_interval_floor() {
        let result = parse_annotations(
            &minimal(&[("secret", "x"), ("refresh-interval", "2s")]),
            &root(),
        );
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }

    #[test]
    fn test_flat_folder() {
        let plan = parse_annotations(
            &minimal(&[
                ("folder-path", "prod/databases"),
                ("folder-output", "/app/secrets/dbs"),
                ("folder-secret-prefix", "db-"),
            ]),
            &root(),
        )
        .unwrap();
        assert_eq!(plan.folders.len(), 1);
        let folder = &plan.folders[0];
        assert_eq!(folder.path.as_deref(), Some("prod/databases"));
        assert_eq!(folder.output_path, PathBuf::from("/app/secrets/dbs"));
        assert_eq!(folder.secret_prefix.as_deref(), Some("db-"));
    }

    #[test]
    fn test_flat_mirror_attaches_to_the_single_entry() {
        let plan = parse_annotations(
            &minimal(&[
                ("secret", "db-creds"),
                ("k8s-secret-name", "db-creds-mirror"),
                ("k8s-secret-keys", "password=db-password"),
                ("k8s-secret-policy", "merge"),
            ]),
            &root(),
        )
        .unwrap();
        let mirror = plan.secrets[0].mirror.as_ref().expect("mirror attached");
        assert_eq!(mirror.name, "db-creds-mirror");
        assert_eq!(mirror.policy, ConflictPolicy::Merge);
        assert_eq!(
            mirror.keys.as_ref().and_then(|m| m.get("password")).map(String::as_str),
            Some("db-password")
        );
        assert!(mirror.owned);
    }

    #[test]
    fn test_flat_mirror_rejects_multiple_entries() {
        let result = parse_annotations(
            &minimal(&[
                ("secrets", "a, b"),
                ("k8s-secret-name", "mirror"),
            ]),
            &root(),
        );
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }

    #[test]
    fn test_ca_source() {
        let plan = parse_annotations(
            &minimal(&[
                ("secret", "x"),
                ("ca-cert-source", "configmap"),
                ("ca-cert-name", "vault-ca"),
            ]),
            &root(),
        )
        .unwrap();
        assert_eq!(
            plan.ca_cert,
            Some(CaSource::ConfigMap {
                name: "vault-ca".to_string(),
                key: "ca.crt".to_string(),
            })
        );
    }
}
