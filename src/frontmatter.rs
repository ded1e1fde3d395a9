//! Element header parsing.
//!
//! Indexing never needs an element body, only the header block at the top of
//! the document:
//!
//! - Markdown elements carry a `---` fenced YAML front-matter block.
//! - YAML and JSON elements are header-only documents; the whole file is the
//!   header.
//!
//! Parsing is tolerant. A malformed or missing header yields an empty
//! [`ElementHeader`] and the entry falls back to its file stem for a name,
//! so one bad document never takes down a refresh.

use chrono::{DateTime, Utc};
use serde_yaml::Value;

use crate::models::{id_from_locator, ElementType, IndexEntry, Source};

/// Searchable metadata lifted from an element header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ElementHeader {
    pub name: Option<String>,
    pub description: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<String>,
}

/// Split a markdown document into its front-matter block and body.
///
/// Returns `(None, input)` when the first line is not a `---` fence.
pub fn split_frontmatter(input: &str) -> (Option<&str>, &str) {
    let Some(rest) = input
        .strip_prefix("---\n")
        .or_else(|| input.strip_prefix("---\r\n"))
    else {
        return (None, input);
    };

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let header = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return (Some(header), body);
        }
        offset += line.len();
    }
    // Unterminated fence: everything is header.
    (Some(rest), "")
}

/// Extract the header block of a document as text, without parsing it.
///
/// This is what a remote metadata read needs to transfer.
pub fn header_text<'a>(locator: &str, document: &'a str) -> &'a str {
    if is_markdown(locator) {
        split_frontmatter(document).0.unwrap_or("")
    } else {
        document
    }
}

/// Parse the header of a document identified by `locator`.
///
/// `text` may be the whole document or just its header block.
pub fn parse_header(locator: &str, text: &str) -> ElementHeader {
    let header = if is_markdown(locator) {
        match split_frontmatter(text) {
            (Some(block), _) => block,
            // Already a bare header block.
            (None, whole) => whole,
        }
    } else {
        text
    };

    if header.trim().is_empty() {
        return ElementHeader::default();
    }

    let value: Value = if locator.ends_with(".json") {
        match serde_json::from_str::<serde_json::Value>(header) {
            Ok(json) => serde_yaml::to_value(json).unwrap_or(Value::Null),
            Err(e) => {
                tracing::debug!(locator, error = %e, "unparseable JSON header");
                return ElementHeader::default();
            }
        }
    } else {
        match serde_yaml::from_str(header) {
            Ok(value) => value,
            Err(e) => {
                tracing::debug!(locator, error = %e, "unparseable YAML header");
                return ElementHeader::default();
            }
        }
    };

    header_from_value(&value)
}

fn header_from_value(value: &Value) -> ElementHeader {
    ElementHeader {
        name: lookup(value, &["name", "title"]).and_then(scalar_string),
        description: lookup(value, &["description", "summary"]).and_then(scalar_string),
        version: lookup(value, &["version"]).and_then(scalar_string),
        tags: lookup(value, &["tags", "keywords"]).map(string_list).unwrap_or_default(),
    }
}

/// Top-level field, or the same field inside a nested `metadata:` mapping.
fn lookup<'a>(value: &'a Value, names: &[&str]) -> Option<&'a Value> {
    let nested = value.get("metadata");
    names.iter().find_map(|name| {
        value
            .get(*name)
            .or_else(|| nested.and_then(|m| m.get(*name)))
    })
}

fn scalar_string(value: &Value) -> Option<String> {
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

/// Tags may be a YAML list or a comma-separated string.
fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_string).collect(),
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn is_markdown(locator: &str) -> bool {
    locator.ends_with(".md")
}

/// Everything needed to build an [`IndexEntry`] besides the header itself.
#[derive(Debug, Clone)]
pub struct EntryOrigin<'a> {
    pub source: Source,
    pub element_type: ElementType,
    pub locator: &'a str,
    pub content_hash: String,
    /// Modification time as reported by the storage holding the element.
    pub modified_at: DateTime<Utc>,
    pub change_marker: Option<String>,
}

/// Build the metadata-only index entry for one element.
pub fn build_entry(origin: EntryOrigin<'_>, header: ElementHeader) -> IndexEntry {
    let id = id_from_locator(origin.locator);
    IndexEntry {
        element_type: origin.element_type,
        display_name: header.name.unwrap_or_else(|| id.clone()),
        id,
        version: header.version,
        source: origin.source,
        content_hash: origin.content_hash,
        locator: origin.locator.to_string(),
        modified_at: origin.modified_at,
        tags: header.tags,
        description: header.description.unwrap_or_default(),
        change_marker: origin.change_marker,
    }
}
