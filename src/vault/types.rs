//! # Vault records
//!
//! Wire payloads from the vault REST API and the normalized
//! [`ResolvedSecret`] view the rest of the pipeline works with. Wire shapes
//! stay private to the vault module; everything downstream (cache, renderer,
//! mirror) sees only resolved records.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

use crate::constants::RECORD_UID_LEN;

/// A single field value. Binary values exist for file attachments and are
/// never passed through a text renderer.
#[derive(Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Binary(Vec<u8>),
}

impl FieldValue {
    /// Text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(_) => None,
        }
    }

    /// Raw bytes for verbatim writes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// Printable form for text renderers; binary becomes base64 so every
    /// format stays valid text.
    #[must_use]
    pub fn display_string(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        match self {
            Self::Text(s) => s.clone(),
            Self::Binary(b) => STANDARD.encode(b),
        }
    }
}

// Field values are secrets; Debug must never leak them into logs.
impl fmt::Debug for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "Text(<{} chars>)", s.len()),
            Self::Binary(b) => write!(f, "Binary(<{} bytes>)", b.len()),
        }
    }
}

/// Attachment metadata as listed on a record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileMeta {
    pub name: String,
    #[serde(default)]
    pub size: u64,
}

/// A downloaded attachment carried alongside its record.
#[derive(Clone, PartialEq, Eq)]
pub struct FileAttachment {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl fmt::Debug for FileAttachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileAttachment({}, <{} bytes>)", self.name, self.bytes.len())
    }
}

/// One vault record, normalized. Equality drives rotation change detection,
/// so every payload-bearing part participates in `PartialEq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSecret {
    pub uid: String,
    pub title: String,
    pub record_type: String,
    pub notes: Option<String>,
    /// Standard fields by name, listing order first-wins on collisions
    pub fields: BTreeMap<String, FieldValue>,
    /// Custom-labeled fields by label
    pub custom_fields: BTreeMap<String, FieldValue>,
    /// Attachment metadata (content is fetched separately)
    pub files: Vec<FileMeta>,
    /// Downloaded attachment for file-driven entries
    pub attachment: Option<FileAttachment>,
}

impl ResolvedSecret {
    /// Standard field lookup.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Custom field lookup.
    #[must_use]
    pub fn custom_field(&self, name: &str) -> Option<&FieldValue> {
        self.custom_fields.get(name)
    }

    /// Unified view for whole-record rendering: standard fields overlaid
    /// with custom fields, custom winning on a name clash.
    #[must_use]
    pub fn render_map(&self) -> BTreeMap<&str, &FieldValue> {
        let mut map: BTreeMap<&str, &FieldValue> = BTreeMap::new();
        for (name, value) in &self.fields {
            map.insert(name.as_str(), value);
        }
        for (name, value) in &self.custom_fields {
            map.insert(name.as_str(), value);
        }
        map
    }
}

/// Whether a name is a record uid rather than a human title: fixed length,
/// URL-safe base64 alphabet, no whitespace.
#[must_use]
pub fn is_record_uid(name: &str) -> bool {
    name.len() == RECORD_UID_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

// ---- wire payloads ----

#[derive(Debug, Deserialize)]
pub(crate) struct RecordListPayload {
    #[serde(default)]
    pub records: Vec<RecordPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FolderTreePayload {
    #[serde(default)]
    pub folders: Vec<FolderNodePayload>,
    #[serde(default)]
    pub records: Vec<RecordPayload>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FolderNodePayload {
    pub uid: String,
    pub name: String,
    #[serde(default)]
    pub parent_uid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RecordPayload {
    pub uid: String,
    pub title: String,
    #[serde(rename = "type", default)]
    pub record_type: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldPayload>,
    #[serde(default)]
    pub files: Vec<FileMeta>,
    #[serde(default)]
    pub folder_uid: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FieldPayload {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub custom: bool,
}

impl RecordPayload {
    /// Normalize the wire record. Standard fields key on their label when
    /// present, otherwise on their type; the first occurrence of a name wins.
    pub(crate) fn into_resolved(self) -> ResolvedSecret {
        let mut fields = BTreeMap::new();
        let mut custom_fields = BTreeMap::new();
        for field in self.fields {
            let name = field
                .label
                .clone()
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| field.field_type.clone());
            if name.is_empty() {
                continue;
            }
            let value = FieldValue::Text(flatten_value(&field.value));
            let target = if field.custom {
                &mut custom_fields
            } else {
                &mut fields
            };
            target.entry(name).or_insert(value);
        }
        ResolvedSecret {
            uid: self.uid,
            title: self.title,
            record_type: self.record_type,
            notes: self.notes.filter(|n| !n.is_empty()),
            fields,
            custom_fields,
            files: self.files,
            attachment: None,
        }
    }
}

/// Flatten a wire field value to text. The vault wraps scalars in one-element
/// arrays; anything structurally richer keeps its compact JSON form so a
/// round trip through the JSON renderer stays lossless.
fn flatten_value(value: &serde_json::Value) -> String {
    use serde_json::Value;
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) if items.len() == 1 => flatten_value(&items[0]),
        other => other.to_string(),
    }
}
