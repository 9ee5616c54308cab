//! Write-path orchestration for one file.
//!
//! ```text
//! (collection, rel_path, bytes, mtime, size)
//!     → MIME detection
//!     → conversion pipeline (convert + canonicalize + hash)
//!     → store.apply_conversion (document + content + chunks + FTS + links)
//! ```
//!
//! Every stage is idempotent keyed by content: an unchanged `source_hash`
//! short-circuits before conversion, and identical canonical text maps to
//! the same mirror regardless of which file produced it. Conversion
//! failures are recorded per file (document row + `ingest_errors`) and
//! never abort a caller's batch.

use tracing::{debug, warn};

use crate::canonical::sha256_hex;
use crate::chunk::chunk_markdown;
use crate::config::LimitsConfig;
use crate::convert::{ConversionPipeline, ConvertInput};
use crate::error::Result;
use crate::links::extract_links;
use crate::mime::detect_mime;
use crate::models::{validate_collection_name, Document, DocumentInput};
use crate::store::Store;

/// One discovered file, as supplied by the filesystem collaborator.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub collection: String,
    pub rel_path: String,
    pub bytes: Vec<u8>,
    pub mtime: Option<i64>,
    pub size: Option<i64>,
}

fn extension_of(rel_path: &str) -> String {
    std::path::Path::new(rel_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// Ingest a single file end to end, returning the updated document.
///
/// On conversion failure the error is recorded on the document row and in
/// the error log, then returned; the caller decides whether to continue
/// with its next file.
pub async fn ingest_file(
    store: &Store,
    pipeline: &ConversionPipeline,
    limits: LimitsConfig,
    max_chunk_bytes: usize,
    request: IngestRequest,
) -> Result<Document> {
    validate_collection_name(&request.collection)?;
    let source_hash = sha256_hex(&request.bytes);

    // Unchanged content: nothing to redo.
    if let Some(existing) = store
        .get_document(&request.collection, &request.rel_path)
        .await?
    {
        if existing.active && existing.mirror_hash.is_some() && existing.source_hash == source_hash
        {
            debug!(
                uri = %existing.uri,
                "source hash unchanged, skipping re-conversion"
            );
            return Ok(existing);
        }
    }

    let ext = extension_of(&request.rel_path);
    let detection = detect_mime(&request.bytes, &ext);
    let size = request.size.or(Some(request.bytes.len() as i64));

    let artifact = match pipeline
        .convert(ConvertInput {
            rel_path: request.rel_path.clone(),
            bytes: request.bytes,
            mime: detection.mime.clone(),
            ext: ext.clone(),
            limits,
        })
        .await
    {
        Ok(artifact) => artifact,
        Err(error) => {
            warn!(
                collection = %request.collection,
                rel_path = %request.rel_path,
                code = error.kind.code(),
                "conversion failed"
            );
            store
                .record_ingest_error(&request.collection, &request.rel_path, &source_hash, &error)
                .await?;
            return Err(error);
        }
    };
    for warning in &artifact.warnings {
        debug!(rel_path = %request.rel_path, warning, "converter warning");
    }

    let chunks = chunk_markdown(&artifact.canonical_markdown, max_chunk_bytes);
    let links = extract_links(&artifact.canonical_markdown);

    let input = DocumentInput {
        collection: request.collection,
        rel_path: request.rel_path,
        source_hash,
        source_mime: Some(artifact.source_mime.clone()),
        source_ext: Some(ext).filter(|e| !e.is_empty()),
        source_size: size,
        source_mtime: request.mtime,
        mirror_hash: Some(artifact.mirror_hash.clone()),
        title: artifact.title.clone(),
        converter_id: Some(artifact.converter_id.clone()),
        converter_version: Some(artifact.converter_version.clone()),
        language_hint: artifact.language_hint.clone(),
    };

    store
        .apply_conversion(&input, &artifact.canonical_markdown, &chunks, &links)
        .await
}
