//! Core data model: documents, content, chunks, links, search results.
//!
//! The lifecycle through the write path:
//!
//! ```text
//! (collection, rel_path, bytes) → convert → ConversionArtifact
//!                                     ↓
//!                              Document + Content (content-addressed)
//!                                     ↓
//!                              chunk() → Chunk* → FTS rows
//!                                     ↓
//!                              extract_links() → Link*
//!                                     ↓
//!                              embed backlog → content_vectors
//! ```
//!
//! A [`Document`] identifies a source file within a collection; the canonical
//! text it currently maps to lives in the content-addressed `content` table
//! keyed by `mirror_hash`. Two documents with identical canonical text share
//! one content row and one set of chunks and vectors.

use serde::Serialize;

use crate::canonical::sha256_hex;
use crate::error::{Error, Result};

/// Transient product of the conversion pipeline.
#[derive(Debug, Clone)]
pub struct ConversionArtifact {
    pub canonical_markdown: String,
    /// SHA-256 of `canonical_markdown`, lowercase 64-hex.
    pub mirror_hash: String,
    pub title: Option<String>,
    /// BCP-47 tag when the converter could determine one.
    pub language_hint: Option<String>,
    pub converter_id: String,
    pub converter_version: String,
    pub source_mime: String,
    pub warnings: Vec<String>,
}

/// Collection names are `[a-z0-9][a-z0-9_-]*`.
pub fn validate_collection_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        .unwrap_or(false);
    let valid_rest = name
        .chars()
        .skip(1)
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if valid_first && valid_rest {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid collection name: {:?} (expected [a-z0-9][a-z0-9_-]*)",
            name
        )))
    }
}

/// Derive the short document identifier for a `(collection, rel_path)` pair.
///
/// First 8 hex chars of `SHA256(collection ++ "\x00" ++ rel_path)`. Stable
/// across re-ingests; displayed with a leading `#`.
pub fn derive_docid(collection: &str, rel_path: &str) -> String {
    let mut input = Vec::with_capacity(collection.len() + 1 + rel_path.len());
    input.extend_from_slice(collection.as_bytes());
    input.push(0);
    input.extend_from_slice(rel_path.as_bytes());
    sha256_hex(&input)[..8].to_string()
}

/// Parse a display docid (`#` followed by 6-8 lowercase hex chars).
///
/// Returns the bare hex prefix. Matching against stored docids is by
/// prefix, so a 6-char id resolves as long as it is unambiguous.
pub fn parse_docid(input: &str) -> Result<String> {
    let hex = input.strip_prefix('#').unwrap_or(input);
    let len_ok = (6..=8).contains(&hex.len());
    let chars_ok = hex
        .chars()
        .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
    if len_ok && chars_ok {
        Ok(hex.to_string())
    } else {
        Err(Error::validation(format!(
            "invalid docid: {:?} (expected #[a-f0-9]{{6,8}})",
            input
        )))
    }
}

/// Document URI: `gno://<collection>/<rel_path>`.
pub fn document_uri(collection: &str, rel_path: &str) -> String {
    format!("gno://{}/{}", collection, rel_path)
}

/// A source file's identity and conversion state within a collection.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Document {
    pub id: i64,
    pub collection: String,
    pub rel_path: String,
    pub docid: String,
    pub uri: String,
    /// SHA-256 of the raw source bytes.
    pub source_hash: String,
    pub source_mime: Option<String>,
    pub source_ext: Option<String>,
    pub source_size: Option<i64>,
    pub source_mtime: Option<i64>,
    /// Content-addressed key of the canonical markdown; absent until the
    /// first successful conversion.
    pub mirror_hash: Option<String>,
    pub title: Option<String>,
    pub converter_id: Option<String>,
    pub converter_version: Option<String>,
    pub language_hint: Option<String>,
    /// False means tombstoned; the row is retained for history.
    pub active: bool,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
    pub last_error_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Input for a document upsert. `docid` and `uri` are derived, not supplied.
#[derive(Debug, Clone, Default)]
pub struct DocumentInput {
    pub collection: String,
    pub rel_path: String,
    pub source_hash: String,
    pub source_mime: Option<String>,
    pub source_ext: Option<String>,
    pub source_size: Option<i64>,
    pub source_mtime: Option<i64>,
    pub mirror_hash: Option<String>,
    pub title: Option<String>,
    pub converter_id: Option<String>,
    pub converter_version: Option<String>,
    pub language_hint: Option<String>,
}

/// Positional unit of a content row.
///
/// `seq` starts at 0 and is contiguous per mirror; `pos` is the byte offset
/// of the chunk's first line in the canonical markdown; line numbers are
/// 1-based inclusive.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Chunk {
    pub seq: i64,
    pub pos: i64,
    pub text: String,
    pub start_line: i64,
    pub end_line: i64,
    pub language: Option<String>,
    pub token_count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Wiki,
    Markdown,
}

impl LinkType {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkType::Wiki => "wiki",
            LinkType::Markdown => "markdown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "wiki" => Ok(LinkType::Wiki),
            "markdown" => Ok(LinkType::Markdown),
            other => Err(Error::validation(format!("invalid link type: {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSource {
    Parsed,
    User,
    Suggested,
}

impl LinkSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkSource::Parsed => "parsed",
            LinkSource::User => "user",
            LinkSource::Suggested => "suggested",
        }
    }
}

/// A reference parsed out of a document's canonical markdown.
///
/// Positions are 1-based character coordinates spanning the full link
/// syntax, brackets included.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Target as written, anchor included, display text excluded.
    pub target_ref: String,
    /// Case-folded, whitespace-collapsed, anchor stripped.
    pub target_ref_norm: String,
    pub target_anchor: Option<String>,
    pub target_collection: Option<String>,
    pub link_type: LinkType,
    pub link_text: Option<String>,
    pub start_line: i64,
    pub start_col: i64,
    pub end_line: i64,
    pub end_col: i64,
    pub source: LinkSource,
}

/// Ranked result returned by the public search operations.
///
/// Scores are always in `[0, 1]` at this surface, regardless of which
/// retrieval stage produced them.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub docid: String,
    pub score: f64,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub snippet: String,
    pub source: SourceInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet_range: Option<SnippetRange>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceInfo {
    pub rel_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnippetRange {
    pub start_line: i64,
    pub end_line: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docid_is_stable_and_short() {
        let a = derive_docid("notes", "topics/rust.md");
        let b = derive_docid("notes", "topics/rust.md");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn docid_depends_on_both_parts() {
        assert_ne!(derive_docid("a", "x"), derive_docid("b", "x"));
        assert_ne!(derive_docid("a", "x"), derive_docid("a", "y"));
        // The separator prevents ("ab", "c") colliding with ("a", "bc").
        assert_ne!(derive_docid("ab", "c"), derive_docid("a", "bc"));
    }

    #[test]
    fn parse_docid_accepts_six_to_eight_hex() {
        assert_eq!(parse_docid("#a1b2c3").unwrap(), "a1b2c3");
        assert_eq!(parse_docid("#a1b2c3d4").unwrap(), "a1b2c3d4");
        assert!(parse_docid("#a1b2c").is_err());
        assert!(parse_docid("#a1b2c3d4e").is_err());
        assert!(parse_docid("#A1B2C3").is_err());
        assert!(parse_docid("#g1b2c3").is_err());
    }

    #[test]
    fn uri_shape() {
        assert_eq!(
            document_uri("notes", "topics/rust.md"),
            "gno://notes/topics/rust.md"
        );
    }

    #[test]
    fn collection_name_validation() {
        assert!(validate_collection_name("notes").is_ok());
        assert!(validate_collection_name("n0tes_2-x").is_ok());
        assert!(validate_collection_name("9lives").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("Notes").is_err());
        assert!(validate_collection_name("-dash").is_err());
        assert!(validate_collection_name("has space").is_err());
    }
}
