//! # Downward-API annotations file
//!
//! The webhook mounts the pod's annotations into the agent container via the
//! downward API. Kubernetes writes one annotation per line as
//! `key="value"`, with the value Go-quoted: embedded newlines arrive as
//! `\n`, quotes as `\"`, and non-printables as `\xNN` or `\uNNNN` escapes.
//! Multi-line YAML documents in the `config` annotation depend on this
//! unescaping being right.

use std::collections::BTreeMap;

use crate::error::InjectionError;

/// Parse the content of a downward-API annotations file into a plain
/// annotation map.
pub fn parse_downward_annotations(
    content: &str,
) -> Result<BTreeMap<String, String>, InjectionError> {
    let mut map = BTreeMap::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let lineno = idx + 1;
        let Some((key, raw_value)) = line.split_once('=') else {
            return Err(InjectionError::ConfigInvalid(format!(
                "annotations file line {lineno} has no '='"
            )));
        };
        let value = unquote(raw_value).map_err(|reason| {
            InjectionError::ConfigInvalid(format!(
                "annotations file line {lineno} ({key}): {reason}"
            ))
        })?;
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

fn unquote(raw: &str) -> Result<String, String> {
    let inner = raw
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| "value is not double-quoted".to_string())?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('x') => out.push(read_hex_char(&mut chars, 2)?),
            Some('u') => out.push(read_hex_char(&mut chars, 4)?),
            Some(other) => return Err(format!("unsupported escape '\\{other}'")),
            None => return Err("dangling backslash".to_string()),
        }
    }
    Ok(out)
}

fn read_hex_char(chars: &mut std::str::Chars<'_>, digits: usize) -> Result<char, String> {
    let mut value: u32 = 0;
    for _ in 0..digits {
        let c = chars
            .next()
            .ok_or_else(|| "truncated hex escape".to_string())?;
        let digit = c
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex digit '{c}'"))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| format!("escape \\{value:x} is not a character"))
}
