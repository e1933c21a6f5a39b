//! # Kubernetes Secret Mirroring
//!
//! Publishes resolved vault records as Kubernetes Secret objects alongside the
//! file outputs, so operators and other workloads can consume them through the
//! regular Secret machinery (envFrom, volume mounts, CSI drivers).
//!
//! ## Conflict Policies
//!
//! When the target Secret already exists, the entry's [`ConflictPolicy`]
//! decides what happens:
//!
//! - **overwrite**: replace data and labels wholesale
//! - **merge**: union of existing and new keys, new values win
//! - **skip-if-exists**: leave the existing object untouched
//! - **fail**: refuse and error the entry
//!
//! The decision is a pure function over the desired and existing objects
//! ([`reconcile_object`]); the API round trips live in [`SecretMirror`] so the
//! policy matrix stays unit-testable without a cluster.
//!
//! ## Ownership
//!
//! Mirrored Secrets can carry an `ownerReference` to the injecting pod so the
//! mirror is garbage-collected when the pod goes away. Identity comes from the
//! downward-API `POD_NAME`/`POD_UID` environment variables; when either is
//! missing the reference is omitted with a warning instead of failing the
//! entry.

use std::collections::{BTreeMap, BTreeSet};
use std::env;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use tracing::{debug, info, warn};

use crate::config::{slug, ConflictPolicy, FolderRef, MirrorTarget};
use crate::constants::{MANAGED_BY, MAX_MIRRORED_SECRET_BYTES};
use crate::error::InjectionError;
use crate::vault::ResolvedSecret;

/// Label key marking Secrets this agent manages.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Pod identity from the downward API, used to build `ownerReference`s.
#[derive(Debug, Clone, Default)]
pub struct PodIdentity {
    pub name: Option<String>,
    pub uid: Option<String>,
}

impl PodIdentity {
    /// Read `POD_NAME` and `POD_UID` from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            name: env::var("POD_NAME").ok().filter(|v| !v.is_empty()),
            uid: env::var("POD_UID").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Owner reference pointing at the injecting pod. `None` unless both the
    /// pod name and uid are known.
    #[must_use]
    pub fn owner_reference(&self) -> Option<OwnerReference> {
        match (&self.name, &self.uid) {
            (Some(name), Some(uid)) => Some(OwnerReference {
                api_version: "v1".to_string(),
                kind: "Pod".to_string(),
                name: name.clone(),
                uid: uid.clone(),
                controller: Some(false),
                block_owner_deletion: None,
            }),
            _ => None,
        }
    }
}

/// What a mirror pass did to the target object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Created,
    Updated,
    Skipped,
}

/// Build the Secret `data` map for one resolved record.
///
/// An explicit key mapping selects and renames fields and errors on a missing
/// field; without one, every field lands under its sanitized name. A
/// downloaded attachment contributes its bytes under the file name.
pub fn build_data(
    target: &MirrorTarget,
    record: &ResolvedSecret,
) -> Result<BTreeMap<String, ByteString>, InjectionError> {
    let mut available: BTreeMap<&str, Vec<u8>> = record
        .render_map()
        .into_iter()
        .map(|(name, value)| (name, value.as_bytes().to_vec()))
        .collect();
    if let Some(file) = &record.attachment {
        available.insert(file.name.as_str(), file.bytes.clone());
    }

    let mut data = BTreeMap::new();
    match &target.keys {
        Some(mapping) => {
            for (field, key) in mapping {
                let bytes = available.remove(field.as_str()).ok_or_else(|| {
                    InjectionError::FieldNotFound {
                        record: record.title.clone(),
                        field: field.clone(),
                    }
                })?;
                data.insert(key.clone(), ByteString(bytes));
            }
        }
        None => {
            for (name, bytes) in available {
                data.insert(sanitize_key(name), ByteString(bytes));
            }
        }
    }
    Ok(data)
}

// Kubernetes Secret data keys allow `[-._a-zA-Z0-9]`; everything else
// becomes a dash.
fn sanitize_key(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Reject payloads the API server would refuse anyway, before any write.
fn ensure_size(
    name: &str,
    data: &BTreeMap<String, ByteString>,
) -> Result<(), InjectionError> {
    let size: usize = data.iter().map(|(k, v)| k.len() + v.0.len()).sum();
    if size > MAX_MIRRORED_SECRET_BYTES {
        return Err(InjectionError::SizeLimitExceeded {
            name: name.to_string(),
            size,
            limit: MAX_MIRRORED_SECRET_BYTES,
        });
    }
    Ok(())
}

// Typed Secrets demand fixed key names. With an explicit mapping this was
// already validated at parse time; the automatic mapping is only known here.
fn ensure_typed_keys(
    target: &MirrorTarget,
    data: &BTreeMap<String, ByteString>,
) -> Result<(), InjectionError> {
    if target.secret_type.as_deref() == Some("kubernetes.io/tls")
        && !(data.contains_key("tls.crt") && data.contains_key("tls.key"))
    {
        return Err(InjectionError::ConfigInvalid(format!(
            "mirrored secret '{}' of type kubernetes.io/tls is missing tls.crt or tls.key in its data",
            target.name
        )));
    }
    Ok(())
}

fn build_secret(
    target: &MirrorTarget,
    data: BTreeMap<String, ByteString>,
    owner: Option<OwnerReference>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(target.name.clone()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY.to_string(),
            )])),
            owner_references: owner.map(|reference| vec![reference]),
            ..ObjectMeta::default()
        },
        type_: target.secret_type.clone(),
        data: Some(data),
        ..Secret::default()
    }
}

/// Decide what to write given the desired object, what the cluster already
/// holds, and the conflict policy.
///
/// Returns `Ok(None)` when nothing should be written. A returned object
/// carries the existing `resourceVersion` so the replace cannot clobber a
/// concurrent writer unnoticed.
pub fn reconcile_object(
    desired: Secret,
    existing: Option<&Secret>,
    policy: ConflictPolicy,
) -> Result<Option<Secret>, InjectionError> {
    let Some(existing) = existing else {
        return Ok(Some(desired));
    };

    match policy {
        ConflictPolicy::Fail => Err(InjectionError::ConflictPolicyViolation(
            desired.metadata.name.unwrap_or_default(),
        )),
        ConflictPolicy::SkipIfExists => Ok(None),
        ConflictPolicy::Overwrite => {
            let mut object = desired;
            object.metadata.resource_version = existing.metadata.resource_version.clone();
            Ok(Some(object))
        }
        ConflictPolicy::Merge => {
            let mut object = desired;
            let mut data = existing.data.clone().unwrap_or_default();
            data.extend(object.data.take().unwrap_or_default());
            object.data = Some(data);
            let mut labels = existing.metadata.labels.clone().unwrap_or_default();
            labels.extend(object.metadata.labels.take().unwrap_or_default());
            object.metadata.labels = Some(labels);
            // the type field is immutable once set; keep whatever is there
            if existing.type_.is_some() {
                object.type_.clone_from(&existing.type_);
            }
            object.metadata.resource_version = existing.metadata.resource_version.clone();
            Ok(Some(object))
        }
    }
}

/// Secret names for a folder's records: `<prefix><slug(title)>`, with a
/// `-<slug(uid)>` suffix when two titles collapse to the same slug. Matches
/// the file-name behavior of folder rendering.
fn folder_secret_names(prefix: &str, records: &[ResolvedSecret]) -> Vec<String> {
    let mut taken: BTreeSet<String> = BTreeSet::new();
    records
        .iter()
        .map(|record| {
            let base = format!("{prefix}{}", slug(&record.title));
            let name = if taken.contains(&base) {
                format!("{base}-{}", slug(&record.uid))
            } else {
                base
            };
            taken.insert(name.clone());
            name
        })
        .collect()
}

/// API-backed mirror writer scoped to one namespace.
pub struct SecretMirror {
    api: Api<Secret>,
    identity: PodIdentity,
}

impl SecretMirror {
    #[must_use]
    pub fn new(client: kube::Client, namespace: &str, identity: PodIdentity) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            identity,
        }
    }

    /// Create or update the Secret for one resolved record, honoring the
    /// target's conflict policy.
    pub async fn mirror_record(
        &self,
        target: &MirrorTarget,
        record: &ResolvedSecret,
    ) -> Result<MirrorOutcome, InjectionError> {
        let data = build_data(target, record)?;
        ensure_size(&target.name, &data)?;
        ensure_typed_keys(target, &data)?;

        let owner = if target.owned {
            let owner = self.identity.owner_reference();
            if owner.is_none() {
                warn!(
                    name = %target.name,
                    "⚠️ Pod ownership requested but POD_NAME/POD_UID are unset; mirroring without ownerReference"
                );
            }
            owner
        } else {
            None
        };
        let desired = build_secret(target, data, owner);

        let existing = match self.api.get(&target.name).await {
            Ok(secret) => Some(secret),
            Err(kube::Error::Api(response)) if response.code == 404 => None,
            Err(err) => return Err(err.into()),
        };
        let replacing = existing.is_some();

        match reconcile_object(desired, existing.as_ref(), target.policy)? {
            None => {
                debug!(
                    name = %target.name,
                    "Mirrored secret exists, skip-if-exists leaves it untouched"
                );
                Ok(MirrorOutcome::Skipped)
            }
            Some(object) if replacing => {
                self.api
                    .replace(&target.name, &PostParams::default(), &object)
                    .await?;
                info!(name = %target.name, "✅ Updated mirrored secret");
                Ok(MirrorOutcome::Updated)
            }
            Some(object) => {
                self.api.create(&PostParams::default(), &object).await?;
                info!(name = %target.name, "✅ Created mirrored secret");
                Ok(MirrorOutcome::Created)
            }
        }
    }

    /// Mirror every record of a folder under `<prefix><record slug>`.
    pub async fn mirror_folder(
        &self,
        folder: &FolderRef,
        records: &[ResolvedSecret],
    ) -> Result<(), InjectionError> {
        let Some(prefix) = folder.secret_prefix.as_deref() else {
            return Ok(());
        };
        for (record, name) in records.iter().zip(folder_secret_names(prefix, records)) {
            let target = MirrorTarget {
                name,
                secret_type: None,
                keys: None,
                policy: folder.policy,
                owned: folder.owned,
            };
            self.mirror_record(&target, record).await?;
        }
        Ok(())
    }
}
