//! # Structured configuration document
//!
//! The `config` annotation carries a YAML document (JSON parses as a YAML
//! subset) for everything the flat shorthands cannot express: field subsets,
//! templates, per-entry mirroring with key remaps, and multiple folders.
//!
//! Unknown fields fail the parse. The flat keys tolerate a typo because each
//! one stands alone; a typo inside a nested document silently reshapes the
//! entry, so strictness wins here.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::InjectionError;
use crate::notation;

use super::{
    default_output_path, resolve_output_path, ConflictPolicy, EntryDefaults, FolderRef,
    MirrorTarget, SecretFormat, SecretRef,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct Document {
    #[serde(default)]
    secrets: Vec<SecretDoc>,
    #[serde(default)]
    folders: Vec<FolderDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SecretDoc {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    fields: Vec<String>,
    #[serde(default)]
    format: Option<SecretFormat>,
    #[serde(default)]
    template: Option<String>,
    #[serde(default)]
    notation: Option<String>,
    /// File attachment name; the entry downloads this file instead of
    /// rendering fields
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    env_inject: Option<bool>,
    #[serde(default)]
    env_prefix: Option<String>,
    #[serde(default)]
    k8s_secret: Option<MirrorDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct MirrorDoc {
    name: String,
    #[serde(rename = "type", default)]
    secret_type: Option<String>,
    #[serde(default)]
    keys: Option<BTreeMap<String, String>>,
    #[serde(default)]
    policy: Option<ConflictPolicy>,
    #[serde(default)]
    owned: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct FolderDoc {
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    output: Option<String>,
    #[serde(default)]
    k8s_secret_prefix: Option<String>,
    #[serde(default)]
    policy: Option<ConflictPolicy>,
    #[serde(default)]
    owned: Option<bool>,
}

/// Parse the structured document into plan entries, document order preserved.
pub(crate) fn parse_document(
    raw: &str,
    root: &Path,
    defaults: &EntryDefaults,
) -> Result<(Vec<SecretRef>, Vec<FolderRef>), InjectionError> {
    let doc: Document = serde_yaml::from_str(raw).map_err(|e| {
        InjectionError::ConfigInvalid(format!("structured config does not parse: {e}"))
    })?;

    let mut secrets = Vec::with_capacity(doc.secrets.len());
    for entry in doc.secrets {
        secrets.push(convert_secret(entry, root, defaults)?);
    }
    let mut folders = Vec::with_capacity(doc.folders.len());
    for entry in doc.folders {
        folders.push(convert_folder(entry, root, defaults));
    }
    Ok((secrets, folders))
}

fn convert_secret(
    doc: SecretDoc,
    root: &Path,
    defaults: &EntryDefaults,
) -> Result<SecretRef, InjectionError> {
    let name = doc.name.map(|n| n.trim().to_string()).unwrap_or_default();

    // Parse the notation up front: it validates the string, contributes a
    // default output path, and decides the default format.
    let parsed_notation = match &doc.notation {
        Some(raw) => Some(notation::parse(raw)?),
        None => None,
    };

    let format = match (doc.format, &doc.template) {
        (Some(SecretFormat::Template), Some(_)) | (None, Some(_)) => SecretFormat::Template,
        (Some(other), Some(_)) => {
            return Err(InjectionError::ConfigInvalid(format!(
                "secret '{name}' carries a template but asks for {other:?} output"
            )));
        }
        (Some(format), None) => format,
        (None, None) => match &parsed_notation {
            Some(n) if n.selector.is_single_value() => SecretFormat::Raw,
            _ => SecretFormat::Json,
        },
    };

    let path_label = if name.is_empty() {
        parsed_notation
            .as_ref()
            .map(|n| n.record.clone())
            .unwrap_or_default()
    } else {
        name.clone()
    };
    let inline_path = parsed_notation
        .as_ref()
        .and_then(|n| n.output_path.as_deref());
    let output_path = if let Some(path) = &doc.path {
        resolve_output_path(root, path)
    } else if let Some(path) = inline_path {
        resolve_output_path(root, path)
    } else {
        default_output_path(root, &path_label)
    };

    let mirror = doc
        .k8s_secret
        .map(|m| convert_mirror(m, defaults))
        .transpose()?;

    let entry = SecretRef {
        name,
        output_path,
        fields: doc.fields,
        format,
        template: doc.template,
        notation: doc.notation,
        file_name: doc.file,
        env_inject: doc.env_inject.unwrap_or(defaults.env_inject),
        env_prefix: doc.env_prefix.or_else(|| defaults.env_prefix.clone()),
        mirror,
    };
    entry.validate()?;
    Ok(entry)
}

fn convert_mirror(
    doc: MirrorDoc,
    defaults: &EntryDefaults,
) -> Result<MirrorTarget, InjectionError> {
    let target = MirrorTarget {
        name: doc.name.trim().to_string(),
        secret_type: doc.secret_type.or_else(|| defaults.mirror_type.clone()),
        keys: doc.keys,
        policy: doc.policy.unwrap_or(defaults.mirror_policy),
        owned: doc.owned.unwrap_or_else(|| defaults.owned()),
    };
    target.validate()?;
    Ok(target)
}

fn convert_folder(doc: FolderDoc, root: &Path, defaults: &EntryDefaults) -> FolderRef {
    let label = doc
        .uid
        .as_deref()
        .or(doc.path.as_deref())
        .unwrap_or_default()
        .to_string();
    let output_path = match &doc.output {
        Some(output) => resolve_output_path(root, output),
        None => default_output_path(root, &label),
    };
    FolderRef {
        uid: doc.uid.filter(|v| !v.trim().is_empty()),
        path: doc.path.filter(|v| !v.trim().is_empty()),
        output_path,
        secret_prefix: doc.k8s_secret_prefix,
        policy: doc.policy.unwrap_or(defaults.mirror_policy),
        owned: doc.owned.unwrap_or_else(|| defaults.owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn root() -> PathBuf {
        PathBuf::from("/var/run/injected-secrets")
    }

    #[test]
    fn test_full_document() {
        let raw = r#"
secrets:
  - name: db-creds
    path: /app/secrets/db
    fields: [user, password]
    format: env
    envInject: true
    envPrefix: DB_
    k8sSecret:
      name: db-mirror
      keys:
        password: db-password
      policy: merge
  - notation: ABC123/field/password:/app/secrets/pw
folders:
  - path: prod/databases
    output: /app/secrets/dbs
    k8sSecretPrefix: db-
"#;
        let (secrets, folders) =
            parse_document(raw, &root(), &EntryDefaults::default()).unwrap();

        assert_eq!(secrets.len(), 2);
        let first = &secrets[0];
        assert_eq!(first.name, "db-creds");
        assert_eq!(first.output_path, PathBuf::from("/app/secrets/db"));
        assert_eq!(first.fields, vec!["user".to_string(), "password".to_string()]);
        assert_eq!(first.format, SecretFormat::Env);
        assert!(first.env_inject);
        assert_eq!(first.env_prefix.as_deref(), Some("DB_"));
        let mirror = first.mirror.as_ref().expect("mirror");
        assert_eq!(mirror.name, "db-mirror");
        assert_eq!(mirror.policy, ConflictPolicy::Merge);
        assert!(mirror.owned, "owned defaults to true");

        let second = &secrets[1];
        assert_eq!(second.format, SecretFormat::Raw);
        assert_eq!(second.output_path, PathBuf::from("/app/secrets/pw"));

        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].path.as_deref(), Some("prod/databases"));
        assert_eq!(folders[0].secret_prefix.as_deref(), Some("db-"));
    }

    #[test]
    fn test_json_documents_parse_too() {
        let raw = r#"{"secrets": [{"name": "api-keys"}]}"#;
        let (secrets, folders) =
            parse_document(raw, &root(), &EntryDefaults::default()).unwrap();
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets[0].name, "api-keys");
        assert_eq!(
            secrets[0].output_path,
            PathBuf::from("/var/run/injected-secrets/api-keys")
        );
        assert!(folders.is_empty());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let raw = r#"
secrets:
  - name: db-creds
    formt: env
"#;
        let result = parse_document(raw, &root(), &EntryDefaults::default());
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }

    #[test]
    fn test_template_implies_template_format() {
        let raw = r#"
secrets:
  - name: db-creds
    template: "user={{ user }}"
"#;
        let (secrets, _) = parse_document(raw, &root(), &EntryDefaults::default()).unwrap();
        assert_eq!(secrets[0].format, SecretFormat::Template);
    }

    #[test]
    fn test_template_with_conflicting_format_fails() {
        let raw = r#"
secrets:
  - name: db-creds
    format: env
    template: "user={{ user }}"
"#;
        let result = parse_document(raw, &root(), &EntryDefaults::default());
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }

    #[test]
    fn test_entry_defaults_flow_down_but_lose_to_the_entry() {
        let defaults = EntryDefaults {
            env_inject: true,
            env_prefix: Some("APP_".to_string()),
            mirror_policy: ConflictPolicy::SkipIfExists,
            mirror_owned: Some(false),
            mirror_type: None,
        };
        let raw = r#"
secrets:
  - name: inherits
  - name: overrides
    envInject: false
    k8sSecret:
      name: mirror
      policy: fail
"#;
        let (secrets, _) = parse_document(raw, &root(), &defaults).unwrap();
        assert!(secrets[0].env_inject);
        assert_eq!(secrets[0].env_prefix.as_deref(), Some("APP_"));
        assert!(!secrets[1].env_inject);
        let mirror = secrets[1].mirror.as_ref().expect("mirror");
        assert_eq!(mirror.policy, ConflictPolicy::Fail);
        assert!(!mirror.owned, "global owned=false inherited");
    }

    #[test]
    fn test_file_attachment_entry() {
        let raw = r#"
secrets:
  - name: db-creds
    file: ca.pem
    path: /app/secrets/ca.pem
"#;
        let (secrets, _) = parse_document(raw, &root(), &EntryDefaults::default()).unwrap();
        assert_eq!(secrets[0].file_name.as_deref(), Some("ca.pem"));
    }

    #[test]
    fn test_notation_and_file_conflict() {
        let raw = r#"
secrets:
  - name: db-creds
    notation: ABC/field/password
    file: ca.pem
"#;
        let result = parse_document(raw, &root(), &EntryDefaults::default());
        assert!(matches!(result, Err(InjectionError::ConfigInvalid(_))));
    }
}
