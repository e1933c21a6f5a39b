//! # Secret-reference notation
//!
//! Compact URI-style references to a record, an optional selector inside it,
//! and an optional output path:
//!
//! ```text
//! ["scheme://"] record "/" selector ["/" parameter] [":" outputPath]
//! ```
//!
//! Examples:
//!
//! ```text
//! hIHXiq6RdtZ5ub_r2DYvkQ                      whole record by uid
//! prod/databases/postgres                      whole record by folder path
//! hIHXiq6RdtZ5ub_r2DYvkQ/field/password        one standard field
//! db-creds/custom_field/connection string      one custom field
//! db-creds/file/ca.pem                         one attached file
//! db-creds/title                               the record title
//! db-creds/field/password:/app/secrets/db-pass with an output path
//! ```
//!
//! ## Disambiguation rules
//!
//! - Any `scheme://` prefix is accepted and ignored; external tooling emits
//!   scheme-qualified references and they must keep working here.
//! - The trailing `:` separating the output path is only recognized when
//!   followed immediately by `/`, so colons inside record titles survive.
//!   The scan runs right-to-left: the last `:/` wins.
//! - A record locator may itself contain `/` (folder paths). The selector is
//!   therefore recognized from the right: a bare keyword in the final
//!   segment, or a parameterized keyword in the second-to-last. When neither
//!   matches, the whole body is a record locator. Selector keywords win over
//!   titles that happen to collide with them.

use crate::error::InjectionError;

/// What part of the record a notation selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// The whole record, all fields
    Record,
    /// One standard field by name
    Field(String),
    /// One custom-labeled field by name
    CustomField(String),
    /// One attached file by name
    File(String),
    /// The record type
    Type,
    /// The record title
    Title,
    /// The record notes
    Notes,
}

impl Selector {
    /// Keyword as it appears in notation strings, `None` for whole-record.
    #[must_use]
    pub fn keyword(&self) -> Option<&'static str> {
        match self {
            Self::Record => None,
            Self::Field(_) => Some("field"),
            Self::CustomField(_) => Some("custom_field"),
            Self::File(_) => Some("file"),
            Self::Type => Some("type"),
            Self::Title => Some("title"),
            Self::Notes => Some("notes"),
        }
    }

    /// Whether the selector yields a single value rather than a field map.
    #[must_use]
    pub fn is_single_value(&self) -> bool {
        !matches!(self, Self::Record)
    }
}

/// A parsed notation string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notation {
    /// Record uid, title, or slash-separated folder path
    pub record: String,
    pub selector: Selector,
    /// Output path from the trailing `:` clause
    pub output_path: Option<String>,
}

impl Notation {
    /// Canonical string form, scheme-free. Round-trips through [`parse`].
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.record.clone();
        if let Some(keyword) = self.selector.keyword() {
            out.push('/');
            out.push_str(keyword);
        }
        match &self.selector {
            Selector::Field(p) | Selector::CustomField(p) | Selector::File(p) => {
                out.push('/');
                out.push_str(p);
            }
            _ => {}
        }
        if let Some(path) = &self.output_path {
            out.push(':');
            out.push_str(path);
        }
        out
    }
}

/// Parse a notation string.
pub fn parse(input: &str) -> Result<Notation, InjectionError> {
    let invalid = |reason: &str| InjectionError::NotationInvalid {
        notation: input.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty notation"));
    }

    let body = strip_scheme(trimmed);

    // Right-to-left: the last ':' immediately followed by '/' splits off the
    // output path. A lone ':' stays part of the record or parameter.
    let (body, output_path) = match body.rfind(":/") {
        Some(idx) => (&body[..idx], Some(body[idx + 1..].to_string())),
        None => (body, None),
    };
    if body.is_empty() {
        return Err(invalid("empty record before the output path"));
    }

    let segments: Vec<&str> = body.split('/').collect();
    let (record, selector) = match split_selector(&segments) {
        Ok(parts) => parts,
        Err(reason) => return Err(invalid(reason)),
    };
    if record.is_empty() {
        return Err(invalid("empty record"));
    }

    Ok(Notation {
        record,
        selector,
        output_path,
    })
}

/// Whether an annotation value has the shape of a notation rather than a
/// bare record name. Used by the shorthand dispatch; the authoritative
/// answer still comes from [`parse`].
#[must_use]
pub fn is_notation_shape(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.contains("://") || trimmed.contains('/')
}

fn strip_scheme(input: &str) -> &str {
    if let Some(idx) = input.find("://") {
        let scheme = &input[..idx];
        let valid = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if valid {
            return &input[idx + 3..];
        }
    }
    input
}

fn split_selector(segments: &[&str]) -> Result<(String, Selector), &'static str> {
    if segments.len() == 1 {
        return Ok((segments[0].to_string(), Selector::Record));
    }

    let last = segments[segments.len() - 1];
    match last {
        "type" => return Ok((join(&segments[..segments.len() - 1]), Selector::Type)),
        "title" => return Ok((join(&segments[..segments.len() - 1]), Selector::Title)),
        "notes" => return Ok((join(&segments[..segments.len() - 1]), Selector::Notes)),
        "field" | "custom_field" | "file" => {
            return Err("selector requires a parameter");
        }
        _ => {}
    }

    if segments.len() >= 3 {
        let keyword = segments[segments.len() - 2];
        let parameter = last;
        let make = |ctor: fn(String) -> Selector| {
            if parameter.is_empty() {
                Err("empty selector parameter")
            } else {
                Ok((join(&segments[..segments.len() - 2]), ctor(parameter.to_string())))
            }
        };
        match keyword {
            "field" => return make(Selector::Field),
            "custom_field" => return make(Selector::CustomField),
            "file" => return make(Selector::File),
            _ => {}
        }
    }

    // No keyword in the trailing segments: the whole body is a record
    // locator, slashes and all (folder-scoped titles).
    Ok((join(segments), Selector::Record))
}

fn join(segments: &[&str]) -> String {
    segments.join("/")
}
