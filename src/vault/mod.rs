//! # Vault access
//!
//! Everything that talks to the secrets backend.
//!
//! ## Pieces
//!
//! - [`SecretSource`] — the trait seam the rotation loop and the tests mock
//! - [`VaultClient`] — the real REST implementation over reqwest/rustls
//! - [`PlanFetcher`] — per-pass resolution driver that batches plain-name
//!   lookups into a single listing call
//!
//! ## Round-trip accounting
//!
//! Any number of plain-name entries in one pass costs exactly one listing
//! call. Notation, file, and folder entries cost one call each (a file
//! selector costs two: the record and the download). The counting tests
//! pin this down; the cost model is part of the contract, not an
//! implementation detail.

pub mod locator;
pub mod types;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use crate::config::{FolderRef, SecretRef};
use crate::constants::VAULT_HTTP_TIMEOUT_SECS;
use crate::error::InjectionError;
use crate::notation::{self, Selector};

pub use locator::VaultCredentials;
pub use types::{FieldValue, FileAttachment, FileMeta, ResolvedSecret};

use types::{is_record_uid, FolderNodePayload, FolderTreePayload, RecordListPayload, RecordPayload};

/// Read access to the secrets backend.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// List every record the credential can see, fields included.
    async fn list_records(&self) -> Result<Vec<ResolvedSecret>, InjectionError>;

    /// Fetch one record by uid or by slash-separated folder path.
    async fn get_record(&self, locator: &str) -> Result<ResolvedSecret, InjectionError>;

    /// Download one attached file.
    async fn get_file(&self, locator: &str, file_name: &str)
        -> Result<Vec<u8>, InjectionError>;

    /// List the records of one folder, subfolders included.
    async fn list_folder(&self, folder: &FolderRef) -> Result<Vec<ResolvedSecret>, InjectionError>;
}

/// REST client for the vault API.
pub struct VaultClient {
    http: reqwest::Client,
    base_url: String,
    credentials: VaultCredentials,
}

impl std::fmt::Debug for VaultClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl VaultClient {
    /// Build a client from located credentials and optional extra CA roots.
    pub fn new(
        credentials: VaultCredentials,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, InjectionError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("secret-injection-agent/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(VAULT_HTTP_TIMEOUT_SECS));
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                InjectionError::ConfigInvalid(format!("custom CA certificate does not parse: {e}"))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| InjectionError::BackendUnavailable(format!("http client init: {e}")))?;
        let base_url = credentials.base_url().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            base_url,
            credentials,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{path}", self.base_url)
    }

    async fn send(&self, path: &str) -> Result<reqwest::Response, InjectionError> {
        debug!(path = %path, "📥 Vault request");
        self.http
            .get(self.url(path))
            .bearer_auth(self.credentials.token())
            .send()
            .await
            .map_err(|e| InjectionError::BackendUnavailable(format!("GET {path}: {e}")))
    }

    /// Map a non-success, non-404 response onto the taxonomy. Auth failures
    /// and server errors both read as "backend unavailable": neither is the
    /// record's fault and both should hit the retry/fallback path.
    async fn error_for(&self, path: &str, response: reqwest::Response) -> InjectionError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {body}")
        };
        InjectionError::BackendUnavailable(format!("GET {path}: {detail}"))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        on_missing: impl FnOnce() -> InjectionError,
    ) -> Result<T, InjectionError> {
        let response = self.send(path).await?;
        match response.status() {
            status if status.is_success() => response.json::<T>().await.map_err(|e| {
                InjectionError::MalformedResponse(format!("GET {path}: {e}"))
            }),
            StatusCode::NOT_FOUND => Err(on_missing()),
            _ => Err(self.error_for(path, response).await),
        }
    }
}

#[async_trait]
impl SecretSource for VaultClient {
    async fn list_records(&self) -> Result<Vec<ResolvedSecret>, InjectionError> {
        let payload: RecordListPayload = self
            .get_json("records", || {
                InjectionError::MalformedResponse("listing endpoint is missing".to_string())
            })
            .await?;
        Ok(payload
            .records
            .into_iter()
            .map(RecordPayload::into_resolved)
            .collect())
    }

    async fn get_record(&self, locator: &str) -> Result<ResolvedSecret, InjectionError> {
        let path = format!("records/{}", encode_segment(locator));
        let payload: RecordPayload = self
            .get_json(&path, || InjectionError::RecordNotFound(locator.to_string()))
            .await?;
        Ok(payload.into_resolved())
    }

    async fn get_file(
        &self,
        locator: &str,
        file_name: &str,
    ) -> Result<Vec<u8>, InjectionError> {
        let path = format!(
            "records/{}/files/{}",
            encode_segment(locator),
            encode_segment(file_name)
        );
        let response = self.send(&path).await?;
        match response.status() {
            status if status.is_success() => {
                let bytes = response.bytes().await.map_err(|e| {
                    InjectionError::BackendUnavailable(format!("GET {path}: {e}"))
                })?;
                Ok(bytes.to_vec())
            }
            StatusCode::NOT_FOUND => Err(InjectionError::FieldNotFound {
                record: locator.to_string(),
                field: file_name.to_string(),
            }),
            _ => Err(self.error_for(&path, response).await),
        }
    }

    async fn list_folder(&self, folder: &FolderRef) -> Result<Vec<ResolvedSecret>, InjectionError> {
        if let Some(uid) = &folder.uid {
            let path = format!("folders/{}/records?recursive=true", encode_segment(uid));
            let payload: RecordListPayload = self
                .get_json(&path, || InjectionError::RecordNotFound(uid.clone()))
                .await?;
            let mut records: Vec<ResolvedSecret> = payload
                .records
                .into_iter()
                .map(RecordPayload::into_resolved)
                .collect();
            records.sort_by(|a, b| a.title.cmp(&b.title));
            return Ok(records);
        }

        // Path addressing: one call for the whole tree, walked locally.
        let folder_path = folder.path.as_deref().unwrap_or_default();
        let tree: FolderTreePayload = self
            .get_json("folders", || {
                InjectionError::MalformedResponse("folder endpoint is missing".to_string())
            })
            .await?;
        walk_folder_tree(tree, folder_path)
    }
}

/// Resolve a slash-separated folder path inside a full tree payload and
/// collect the records of the folder and its subfolders, title-sorted.
fn walk_folder_tree(
    tree: FolderTreePayload,
    path: &str,
) -> Result<Vec<ResolvedSecret>, InjectionError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(InjectionError::ConfigInvalid(
            "empty folder path".to_string(),
        ));
    }

    let find_child = |parent: Option<&str>, name: &str| -> Option<&FolderNodePayload> {
        tree.folders
            .iter()
            .find(|f| f.parent_uid.as_deref() == parent && f.name == name)
    };

    let mut current: Option<&FolderNodePayload> = None;
    for segment in &segments {
        current = find_child(current.map(|f| f.uid.as_str()), segment);
        if current.is_none() {
            return Err(InjectionError::RecordNotFound(format!(
                "folder path '{path}'"
            )));
        }
    }
    let Some(target) = current else {
        return Err(InjectionError::RecordNotFound(format!(
            "folder path '{path}'"
        )));
    };

    // The target's subtree: itself plus every transitive child.
    let mut subtree: Vec<&str> = vec![target.uid.as_str()];
    let mut frontier = vec![target.uid.as_str()];
    while let Some(uid) = frontier.pop() {
        for folder in &tree.folders {
            if folder.parent_uid.as_deref() == Some(uid) {
                subtree.push(folder.uid.as_str());
                frontier.push(folder.uid.as_str());
            }
        }
    }

    let mut records: Vec<ResolvedSecret> = tree
        .records
        .into_iter()
        .filter(|r| {
            r.folder_uid
                .as_deref()
                .is_some_and(|uid| subtree.contains(&uid))
        })
        .map(RecordPayload::into_resolved)
        .collect();
    records.sort_by(|a, b| a.title.cmp(&b.title));
    Ok(records)
}

/// Percent-encode one path segment (RFC 3986 unreserved set passes through).
fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

/// Drives one resolution pass over a plan, memoizing the listing so every
/// plain-name entry shares a single backend call.
pub struct PlanFetcher<'a> {
    source: &'a dyn SecretSource,
    strict_lookup: bool,
    listing: Option<Vec<ResolvedSecret>>,
}

impl std::fmt::Debug for PlanFetcher<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanFetcher")
            .field("strict_lookup", &self.strict_lookup)
            .field("listing_cached", &self.listing.is_some())
            .finish()
    }
}

impl<'a> PlanFetcher<'a> {
    #[must_use]
    pub fn new(source: &'a dyn SecretSource, strict_lookup: bool) -> Self {
        Self {
            source,
            strict_lookup,
            listing: None,
        }
    }

    /// Resolve one secret entry to its record (attachment included when the
    /// entry is file-driven).
    pub async fn fetch_secret(
        &mut self,
        entry: &SecretRef,
    ) -> Result<ResolvedSecret, InjectionError> {
        if let Some(raw) = &entry.notation {
            let parsed = notation::parse(raw)?;
            let mut record = self.source.get_record(&parsed.record).await?;
            if let Selector::File(file_name) = &parsed.selector {
                let bytes = self.source.get_file(&parsed.record, file_name).await?;
                record.attachment = Some(FileAttachment {
                    name: file_name.clone(),
                    bytes,
                });
            }
            return Ok(record);
        }

        if let Some(file_name) = &entry.file_name {
            let bytes = self.source.get_file(&entry.name, file_name).await?;
            return Ok(file_only_record(&entry.name, file_name, bytes));
        }

        let strict = self.strict_lookup;
        let listing = self.listing().await?;
        find_by_name(listing, &entry.name, strict).cloned()
    }

    /// Resolve one folder entry to its records.
    pub async fn fetch_folder(
        &mut self,
        folder: &FolderRef,
    ) -> Result<Vec<ResolvedSecret>, InjectionError> {
        self.source.list_folder(folder).await
    }

    async fn listing(&mut self) -> Result<&[ResolvedSecret], InjectionError> {
        if self.listing.is_none() {
            let records = self.source.list_records().await?;
            debug!(count = records.len(), "📋 Cached vault listing for this pass");
            self.listing = Some(records);
        }
        Ok(self.listing.as_deref().unwrap_or(&[]))
    }
}

/// Listing lookup with uid/title classification. A uid-shaped name only
/// matches on uid; a 22-character base64 title would be indistinguishable
/// from a uid anyway, and the crisp rule keeps lookups predictable.
fn find_by_name<'r>(
    records: &'r [ResolvedSecret],
    name: &str,
    strict: bool,
) -> Result<&'r ResolvedSecret, InjectionError> {
    if is_record_uid(name) {
        return records
            .iter()
            .find(|r| r.uid == name)
            .ok_or_else(|| InjectionError::RecordNotFound(name.to_string()));
    }

    let mut matches = records.iter().filter(|r| r.title == name);
    let first = matches
        .next()
        .ok_or_else(|| InjectionError::RecordNotFound(name.to_string()))?;
    if strict && matches.next().is_some() {
        return Err(InjectionError::AmbiguousTitle(name.to_string()));
    }
    Ok(first)
}

/// Record wrapper for a direct file download; one round trip, no record
/// metadata beyond the locator that named it.
fn file_only_record(locator: &str, file_name: &str, bytes: Vec<u8>) -> ResolvedSecret {
    ResolvedSecret {
        uid: locator.to_string(),
        title: locator.to_string(),
        record_type: "file".to_string(),
        notes: None,
        fields: std::collections::BTreeMap::new(),
        custom_fields: std::collections::BTreeMap::new(),
        files: vec![FileMeta {
            name: file_name.to_string(),
            size: bytes.len() as u64,
        }],
        attachment: Some(FileAttachment {
            name: file_name.to_string(),
            bytes,
        }),
    }
}
