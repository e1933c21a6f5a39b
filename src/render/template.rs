//! # Template rendering
//!
//! Wraps minijinja with strict undefined behavior and the fixed filter set
//! for user-authored output templates.
//!
//! ## Context
//!
//! Every field of the record (custom fields overlaying standard ones) is a
//! top-level variable, so `{{ password }}` works directly. Field names that
//! are not valid identifiers stay reachable through the `fields` map:
//! `{{ fields["api key"] }}`.
//!
//! ## Filters
//!
//! `upper`, `lower`, `trim`, and `default` come with minijinja; `b64enc`,
//! `b64dec`, and `sha256` are registered here. Referencing an unknown field
//! without `default` fails the entry, never the whole pass.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use minijinja::{Environment, Error, ErrorKind, UndefinedBehavior};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::InjectionError;
use crate::vault::ResolvedSecret;

/// Reusable template environment with the fixed filter set.
pub struct TemplateRenderer {
    env: Environment<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TemplateRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateRenderer").finish_non_exhaustive()
    }
}

impl TemplateRenderer {
    #[must_use]
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_filter("b64enc", b64enc);
        env.add_filter("b64dec", b64dec);
        env.add_filter("sha256", sha256_hex);
        Self { env }
    }

    /// Render one template against one record. `entry` names the plan entry
    /// in the error so a bad template points at its own annotation.
    pub fn render(
        &self,
        template: &str,
        record: &ResolvedSecret,
        entry: &str,
    ) -> Result<String, InjectionError> {
        let context = template_context(record);
        self.env
            .render_str(template, context)
            .map_err(|e| InjectionError::TemplateError {
                entry: entry.to_string(),
                reason: flatten_error(&e),
            })
    }
}

/// Build the context map: `fields` first, then every field name on top so
/// identifier-shaped names resolve bare.
fn template_context(record: &ResolvedSecret) -> minijinja::Value {
    let fields: BTreeMap<String, String> = record
        .render_map()
        .into_iter()
        .map(|(name, value)| (name.to_string(), value.display_string()))
        .collect();

    let mut context: BTreeMap<String, minijinja::Value> = BTreeMap::new();
    context.insert(
        "fields".to_string(),
        minijinja::Value::from_serialize(&fields),
    );
    for (name, value) in &fields {
        context.insert(name.clone(), minijinja::Value::from(value.clone()));
    }
    minijinja::Value::from_serialize(&context)
}

/// Carry the source chain into one message; minijinja buries the useful
/// part (the undefined variable name) in the cause.
fn flatten_error(error: &Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn b64enc(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}

fn b64dec(value: &str) -> Result<String, Error> {
    STANDARD
        .decode(value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("base64 decode: {e}")))
        .and_then(|bytes| {
            String::from_utf8(bytes).map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("base64 decode produced invalid UTF-8: {e}"),
                )
            })
        })
}

fn sha256_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
