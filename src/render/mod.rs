//! # Output rendering
//!
//! Pure conversion from resolved records to file bytes. Everything here is
//! deterministic and testable without a backend or a filesystem: the writer
//! gets `RenderedFile` values, it never renders.
//!
//! ## Pipeline
//!
//! 1. Selection: apply the entry's notation selector or field subset to the
//!    record. Attachments and binary single values short-circuit to verbatim
//!    bytes; formats never touch them.
//! 2. Formatting: the selected name/value pairs go through the entry's
//!    format (json / env / raw / properties / yaml / ini / template).
//! 3. `env-inject` entries emit a second `.env` sibling file in env format.
//!
//! Missing fields surface as `FieldNotFound` here, at render time, so one
//! bad entry fails alone instead of poisoning the fetch pass.

pub mod template;

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::config::{slug, FolderRef, SecretFormat, SecretRef};
use crate::error::InjectionError;
use crate::notation::{self, Selector};
use crate::vault::{FieldValue, ResolvedSecret};

pub use template::TemplateRenderer;

/// One file the writer should produce, path plus exact contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedFile {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

/// What an entry's selector carved out of its record.
enum Selection {
    /// Raw bytes written as-is; file attachments and binary values.
    Verbatim(Vec<u8>),
    /// A single named value.
    Single(String, FieldValue),
    /// Ordered name/value pairs.
    Map(Vec<(String, FieldValue)>),
}

/// Render one secret entry into its output file(s).
pub fn render_secret(
    entry: &SecretRef,
    record: &ResolvedSecret,
    templates: &TemplateRenderer,
) -> Result<Vec<RenderedFile>, InjectionError> {
    let selection = select(entry, record)?;

    let bytes = match &selection {
        Selection::Verbatim(bytes) => bytes.clone(),
        _ if entry.format == SecretFormat::Template => {
            let template = entry.template.as_deref().ok_or_else(|| {
                InjectionError::ConfigInvalid(format!(
                    "entry '{}' has template format but no template",
                    entry.label()
                ))
            })?;
            templates.render(template, record, entry.label())?.into_bytes()
        }
        Selection::Single(name, value) => {
            let pair = [(name.clone(), value.clone())];
            render_pairs(entry.format, &pair, entry)?
        }
        Selection::Map(pairs) => render_pairs(entry.format, pairs, entry)?,
    };

    let mut outputs = vec![RenderedFile {
        path: entry.output_path.clone(),
        bytes,
    }];

    if entry.env_inject {
        if let Some(pairs) = selection_pairs(&selection) {
            let mut path = entry.output_path.as_os_str().to_owned();
            path.push(".env");
            outputs.push(RenderedFile {
                path: PathBuf::from(path),
                bytes: render_env(&pairs, entry.env_prefix.as_deref()),
            });
        }
    }

    Ok(outputs)
}

/// Render a folder listing: one JSON file per record under the folder's
/// output directory, named by the slugged title (uid-suffixed on a clash).
pub fn render_folder(
    folder: &FolderRef,
    records: &[ResolvedSecret],
) -> Result<Vec<RenderedFile>, InjectionError> {
    let mut outputs = Vec::with_capacity(records.len());
    let mut taken: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        let base = slug(&record.title);
        let file_name = match taken.get(&base) {
            None => base.clone(),
            Some(_) => format!("{base}-{}", slug(&record.uid)),
        };
        *taken.entry(base).or_insert(0) += 1;

        let pairs: Vec<(String, FieldValue)> = record
            .render_map()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        outputs.push(RenderedFile {
            path: folder.output_path.join(file_name),
            bytes: render_json(&pairs)?,
        });
    }
    Ok(outputs)
}

fn select(entry: &SecretRef, record: &ResolvedSecret) -> Result<Selection, InjectionError> {
    if let Some(attachment) = &record.attachment {
        return Ok(Selection::Verbatim(attachment.bytes.clone()));
    }

    if let Some(raw) = &entry.notation {
        let parsed = notation::parse(raw)?;
        return match &parsed.selector {
            Selector::Record => Ok(Selection::Map(owned_map(record))),
            Selector::Field(name) => record
                .field(name)
                .map(|value| Selection::Single(name.clone(), value.clone()))
                .ok_or_else(|| field_not_found(record, name)),
            Selector::CustomField(name) => record
                .custom_field(name)
                .map(|value| Selection::Single(name.clone(), value.clone()))
                .ok_or_else(|| field_not_found(record, name)),
            // The fetch pass downloads file selectors into `attachment`;
            // getting here means the record has no such file.
            Selector::File(name) => Err(field_not_found(record, name)),
            Selector::Type => Ok(Selection::Single(
                "type".to_string(),
                FieldValue::Text(record.record_type.clone()),
            )),
            Selector::Title => Ok(Selection::Single(
                "title".to_string(),
                FieldValue::Text(record.title.clone()),
            )),
            Selector::Notes => record
                .notes
                .clone()
                .map(|notes| Selection::Single("notes".to_string(), FieldValue::Text(notes)))
                .ok_or_else(|| field_not_found(record, "notes")),
        };
    }

    if entry.fields.is_empty() {
        return Ok(Selection::Map(owned_map(record)));
    }

    let view = record.render_map();
    let mut pairs = Vec::with_capacity(entry.fields.len());
    for name in &entry.fields {
        let value = view
            .get(name.as_str())
            .ok_or_else(|| field_not_found(record, name))?;
        pairs.push((name.clone(), (*value).clone()));
    }
    Ok(Selection::Map(pairs))
}

fn owned_map(record: &ResolvedSecret) -> Vec<(String, FieldValue)> {
    record
        .render_map()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn selection_pairs(selection: &Selection) -> Option<Vec<(String, FieldValue)>> {
    match selection {
        Selection::Verbatim(_) => None,
        Selection::Single(name, value) => Some(vec![(name.clone(), value.clone())]),
        Selection::Map(pairs) => Some(pairs.clone()),
    }
}

fn field_not_found(record: &ResolvedSecret, field: &str) -> InjectionError {
    InjectionError::FieldNotFound {
        record: record.title.clone(),
        field: field.to_string(),
    }
}

fn render_pairs(
    format: SecretFormat,
    pairs: &[(String, FieldValue)],
    entry: &SecretRef,
) -> Result<Vec<u8>, InjectionError> {
    match format {
        SecretFormat::Json => render_json(pairs),
        SecretFormat::Env => Ok(render_env(pairs, entry.env_prefix.as_deref())),
        SecretFormat::Raw => match pairs {
            [(_, value)] => Ok(value.as_bytes().to_vec()),
            _ => Err(InjectionError::ConfigInvalid(format!(
                "entry '{}': raw format selected {} values, need exactly one",
                entry.label(),
                pairs.len()
            ))),
        },
        SecretFormat::Properties => Ok(render_properties(pairs)),
        SecretFormat::Yaml => render_yaml(pairs),
        SecretFormat::Ini => Ok(render_ini(pairs)),
        SecretFormat::Template => unreachable!("template format is dispatched before render_pairs"),
    }
}

fn string_map(pairs: &[(String, FieldValue)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(name, value)| (name.clone(), value.display_string()))
        .collect()
}

fn render_json(pairs: &[(String, FieldValue)]) -> Result<Vec<u8>, InjectionError> {
    let map = string_map(pairs);
    let mut bytes = serde_json::to_vec_pretty(&map).map_err(|e| {
        InjectionError::MalformedResponse(format!("json rendering: {e}"))
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn render_yaml(pairs: &[(String, FieldValue)]) -> Result<Vec<u8>, InjectionError> {
    let map = string_map(pairs);
    serde_yaml::to_string(&map)
        .map(String::into_bytes)
        .map_err(|e| InjectionError::MalformedResponse(format!("yaml rendering: {e}")))
}

/// `KEY=value` lines. Keys are upper-snake normalized; values with
/// newlines, quotes, or surrounding whitespace get double-quoted with
/// backslash escapes so the file stays line-parseable.
fn render_env(pairs: &[(String, FieldValue)], prefix: Option<&str>) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in pairs {
        let key = env_key(name, prefix);
        let value = value.display_string();
        out.push_str(&key);
        out.push('=');
        if needs_env_quoting(&value) {
            out.push('"');
            for c in value.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    other => out.push(other),
                }
            }
            out.push('"');
        } else {
            out.push_str(&value);
        }
        out.push('\n');
    }
    out.into_bytes()
}

fn needs_env_quoting(value: &str) -> bool {
    value.is_empty()
        || value != value.trim()
        || value
            .chars()
            .any(|c| matches!(c, '\n' | '\r' | '"' | '\\' | ' ' | '#'))
}

/// Environment variable name: uppercase, every non-alphanumeric squashed to
/// an underscore, leading digit guarded.
fn env_key(name: &str, prefix: Option<&str>) -> String {
    let mut key = String::with_capacity(name.len());
    if let Some(prefix) = prefix {
        key.push_str(prefix);
    }
    let start = key.len();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_uppercase());
        } else {
            key.push('_');
        }
    }
    if key[start..].starts_with(|c: char| c.is_ascii_digit()) {
        key.insert(start, '_');
    }
    key
}

/// Java-properties lines with the conventional backslash escapes.
fn render_properties(pairs: &[(String, FieldValue)]) -> Vec<u8> {
    let mut out = String::new();
    for (name, value) in pairs {
        out.push_str(&properties_escape(name, true));
        out.push('=');
        out.push_str(&properties_escape(&value.display_string(), false));
        out.push('\n');
    }
    out.into_bytes()
}

fn properties_escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ' ' | '=' | ':' if is_key => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out
}

/// INI with first-dot grouping: `db.host` lands under `[db]` as `host`.
/// Dotless keys come first, before any section header.
fn render_ini(pairs: &[(String, FieldValue)]) -> Vec<u8> {
    let mut top: Vec<(String, String)> = Vec::new();
    let mut sections: BTreeMap<String, Vec<(String, String)>> = BTreeMap::new();

    for (name, value) in pairs {
        let value = value.display_string();
        match name.split_once('.') {
            Some((section, key)) if !section.is_empty() && !key.is_empty() => {
                sections
                    .entry(section.to_string())
                    .or_default()
                    .push((key.to_string(), value));
            }
            _ => top.push((name.clone(), value)),
        }
    }

    let mut out = String::new();
    for (key, value) in &top {
        out.push_str(&format!("{key}={value}\n"));
    }
    for (section, entries) in &sections {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("[{section}]\n"));
        for (key, value) in entries {
            out.push_str(&format!("{key}={value}\n"));
        }
    }
    out.into_bytes()
}
