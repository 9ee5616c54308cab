//! Content-addressed persistent store.
//!
//! Owns every durable row: collections, documents, content, chunks, the
//! FTS index, links, and ingest errors (vectors live in
//! [`crate::vec_index`], which shares the same database). Writers use one
//! transaction per logical operation; readers see either the pre- or
//! post-transaction state, never a partial write.
//!
//! Content is addressed by `mirror_hash`. Documents point at content; two
//! documents with the same canonical text share one content row, one set
//! of chunks, and one set of vectors.

use std::collections::HashMap;
use std::path::Path;

use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::error::{Error, ErrorKind, Result};
use crate::links::normalize_ref;
use crate::migrate;
use crate::models::{
    derive_docid, document_uri, validate_collection_name, Chunk, Document, DocumentInput, Link,
    LinkType,
};

/// Tokenizers accepted for the FTS index.
pub const FTS_TOKENIZERS: [&str; 4] = ["unicode61", "porter", "simple", "trigram"];

pub fn validate_tokenizer(name: &str) -> Result<()> {
    if FTS_TOKENIZERS.contains(&name) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "unknown FTS tokenizer {:?} (expected one of {:?})",
            name, FTS_TOKENIZERS
        )))
    }
}

const DOCUMENT_COLUMNS: &str = "id, collection, rel_path, docid, uri, source_hash, source_mime, \
     source_ext, source_size, source_mtime, mirror_hash, title, converter_id, converter_version, \
     language_hint, active, last_error_code, last_error_message, last_error_at, created_at, \
     updated_at";

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// A hit from the FTS index, joined with its owning documents.
///
/// `score` is the raw FTS5 rank: more negative is better, and results are
/// pre-sorted ascending.
#[derive(Debug, Clone)]
pub struct FtsHit {
    pub mirror_hash: String,
    pub seq: i64,
    pub score: f64,
    pub docid: String,
    pub uri: String,
    pub title: Option<String>,
    pub collection: String,
    pub rel_path: String,
    pub source_mime: Option<String>,
    pub source_ext: Option<String>,
    pub source_size: Option<i64>,
}

/// Document metadata slice used to hydrate search results.
#[derive(Debug, Clone)]
pub struct DocMeta {
    pub docid: String,
    pub uri: String,
    pub title: Option<String>,
    pub collection: String,
    pub rel_path: String,
    pub source_mime: Option<String>,
    pub source_ext: Option<String>,
    pub source_size: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FtsOptions {
    pub collection: Option<String>,
    pub limit: usize,
}

/// A link row as stored, with its surrogate id and owner.
#[derive(Debug, Clone)]
pub struct StoredLink {
    pub id: i64,
    pub source_doc_id: i64,
    pub link: Link,
}

/// A backlink: a stored link plus the document it came from.
#[derive(Debug, Clone)]
pub struct Backlink {
    pub source_docid: String,
    pub source_uri: String,
    pub link: Link,
}

/// One chunk awaiting embedding for some model.
#[derive(Debug, Clone)]
pub struct BacklogItem {
    pub mirror_hash: String,
    pub seq: i64,
    pub text: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub documents: i64,
    pub active_documents: i64,
    pub content_rows: i64,
    pub chunks: i64,
    pub vectors_by_model: Vec<(String, i64)>,
    pub ingest_errors: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub content_removed: u64,
    pub fts_removed: u64,
    pub vectors_removed: u64,
}

/// `O(1)` lookup over a `get_chunks_batch` result.
///
/// The per-hash map is built lazily on first access. Duplicate `seq`
/// values keep the first row seen (first-wins); no writer in this crate
/// produces duplicates, the defense is preserved as-is.
pub struct ChunkLookup {
    chunks: HashMap<String, Vec<Chunk>>,
    maps: HashMap<String, HashMap<i64, usize>>,
}

impl ChunkLookup {
    pub fn new(chunks: HashMap<String, Vec<Chunk>>) -> Self {
        Self {
            chunks,
            maps: HashMap::new(),
        }
    }

    pub fn get(&mut self, mirror_hash: &str, seq: i64) -> Option<&Chunk> {
        if !self.maps.contains_key(mirror_hash) {
            let mut map = HashMap::new();
            if let Some(list) = self.chunks.get(mirror_hash) {
                for (idx, chunk) in list.iter().enumerate() {
                    map.entry(chunk.seq).or_insert(idx);
                }
            }
            self.maps.insert(mirror_hash.to_string(), map);
        }
        let idx = *self.maps.get(mirror_hash)?.get(&seq)?;
        self.chunks.get(mirror_hash)?.get(idx)
    }
}

pub struct Store {
    pool: SqlitePool,
    tokenizer: String,
    needs_fts_rebuild: bool,
}

impl Store {
    /// Open the database, run migrations, and record the tokenizer.
    ///
    /// If the database was created with a different tokenizer, the store
    /// still opens but [`Store::needs_fts_rebuild`] reports true until
    /// [`Store::rebuild_fts`] is called.
    pub async fn open(path: &Path, fts_tokenizer: &str) -> Result<Store> {
        validate_tokenizer(fts_tokenizer)?;
        let pool = crate::db::connect(path).await?;
        migrate::run_migrations(&pool, fts_tokenizer).await?;
        let recorded = migrate::recorded_tokenizer(&pool)
            .await?
            .unwrap_or_else(|| fts_tokenizer.to_string());
        Ok(Store {
            pool,
            tokenizer: fts_tokenizer.to_string(),
            needs_fts_rebuild: recorded != fts_tokenizer,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn needs_fts_rebuild(&self) -> bool {
        self.needs_fts_rebuild
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ── documents ──────────────────────────────────────────────────────

    /// Insert or update a document by `(collection, rel_path)`.
    ///
    /// The docid is derived on first insert and never mutated afterwards.
    pub async fn upsert_document(&self, input: &DocumentInput) -> Result<Document> {
        validate_collection_name(&input.collection)?;
        let mut tx = self.pool.begin().await?;
        let doc = Self::upsert_document_tx(&mut tx, input).await?;
        tx.commit().await?;
        Ok(doc)
    }

    async fn upsert_document_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        input: &DocumentInput,
    ) -> Result<Document> {
        sqlx::query("INSERT INTO collections (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(&input.collection)
            .execute(&mut **tx)
            .await?;

        let docid = derive_docid(&input.collection, &input.rel_path);
        let uri = document_uri(&input.collection, &input.rel_path);
        let ts = now();

        sqlx::query(
            r#"
            INSERT INTO documents (
                collection, rel_path, docid, uri, source_hash, source_mime, source_ext,
                source_size, source_mtime, mirror_hash, title, converter_id,
                converter_version, language_hint, active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(collection, rel_path) DO UPDATE SET
                source_hash = excluded.source_hash,
                source_mime = excluded.source_mime,
                source_ext = excluded.source_ext,
                source_size = excluded.source_size,
                source_mtime = excluded.source_mtime,
                mirror_hash = excluded.mirror_hash,
                title = excluded.title,
                converter_id = excluded.converter_id,
                converter_version = excluded.converter_version,
                language_hint = excluded.language_hint,
                active = 1,
                last_error_code = NULL,
                last_error_message = NULL,
                last_error_at = NULL,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&input.collection)
        .bind(&input.rel_path)
        .bind(&docid)
        .bind(&uri)
        .bind(&input.source_hash)
        .bind(&input.source_mime)
        .bind(&input.source_ext)
        .bind(input.source_size)
        .bind(input.source_mtime)
        .bind(&input.mirror_hash)
        .bind(&input.title)
        .bind(&input.converter_id)
        .bind(&input.converter_version)
        .bind(&input.language_hint)
        .bind(ts)
        .bind(ts)
        .execute(&mut **tx)
        .await?;

        let doc = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents WHERE collection = ? AND rel_path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(&input.collection)
        .bind(&input.rel_path)
        .fetch_one(&mut **tx)
        .await?;
        Ok(doc)
    }

    pub async fn get_document(&self, collection: &str, rel_path: &str) -> Result<Option<Document>> {
        let doc = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents WHERE collection = ? AND rel_path = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(collection)
        .bind(rel_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(doc)
    }

    /// Look up a document by docid prefix (6-8 hex chars).
    ///
    /// Fails with `VALIDATION` when the prefix is ambiguous.
    pub async fn get_document_by_docid(&self, docid_prefix: &str) -> Result<Document> {
        let pattern = format!("{}%", docid_prefix);
        let docs = sqlx::query_as::<_, Document>(&format!(
            "SELECT {} FROM documents WHERE docid LIKE ? LIMIT 2",
            DOCUMENT_COLUMNS
        ))
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        match docs.len() {
            0 => Err(Error::not_found(format!("no document #{}", docid_prefix))),
            1 => Ok(docs.into_iter().next().expect("len checked")),
            _ => Err(Error::validation(format!(
                "docid #{} is ambiguous",
                docid_prefix
            ))),
        }
    }

    /// Tombstone a document. The row stays for history; chunks and content
    /// are reclaimed later by [`Store::cleanup_orphans`].
    pub async fn mark_deleted(&self, collection: &str, rel_path: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE documents SET active = 0, updated_at = ? WHERE collection = ? AND rel_path = ?",
        )
        .bind(now())
        .bind(collection)
        .bind(rel_path)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a per-file failure on the document row (creating the row if
    /// this was the first discovery) and in the append-only error log.
    pub async fn record_ingest_error(
        &self,
        collection: &str,
        rel_path: &str,
        source_hash: &str,
        error: &Error,
    ) -> Result<()> {
        validate_collection_name(collection)?;
        let mut tx = self.pool.begin().await?;
        let ts = now();

        sqlx::query("INSERT INTO collections (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(collection)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO documents (
                collection, rel_path, docid, uri, source_hash, active,
                last_error_code, last_error_message, last_error_at, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, rel_path) DO UPDATE SET
                source_hash = excluded.source_hash,
                last_error_code = excluded.last_error_code,
                last_error_message = excluded.last_error_message,
                last_error_at = excluded.last_error_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection)
        .bind(rel_path)
        .bind(derive_docid(collection, rel_path))
        .bind(document_uri(collection, rel_path))
        .bind(source_hash)
        .bind(error.kind.code())
        .bind(&error.message)
        .bind(ts)
        .bind(ts)
        .bind(ts)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO ingest_errors (collection, rel_path, occurred_at, code, message, details_json) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(collection)
        .bind(rel_path)
        .bind(ts)
        .bind(error.kind.code())
        .bind(&error.message)
        .bind(error.details.as_ref().map(|d| d.to_string()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── content and chunks ─────────────────────────────────────────────

    /// Insert canonical markdown under its hash. No-op when the hash is
    /// already present.
    pub async fn upsert_content(&self, mirror_hash: &str, markdown: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO content (mirror_hash, markdown, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(mirror_hash) DO NOTHING",
        )
        .bind(mirror_hash)
        .bind(markdown)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_content(&self, mirror_hash: &str) -> Result<Option<String>> {
        let markdown = sqlx::query_scalar("SELECT markdown FROM content WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(markdown)
    }

    /// Replace all chunks (and their FTS rows) for a mirror in one
    /// transaction.
    pub async fn put_chunks(&self, mirror_hash: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::put_chunks_tx(&mut tx, mirror_hash, chunks).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn put_chunks_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        mirror_hash: &str,
        chunks: &[Chunk],
    ) -> Result<()> {
        sqlx::query("DELETE FROM chunks_fts WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE mirror_hash = ?")
            .bind(mirror_hash)
            .execute(&mut **tx)
            .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (mirror_hash, seq, pos, text, start_line, end_line, language, token_count) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(mirror_hash)
            .bind(chunk.seq)
            .bind(chunk.pos)
            .bind(&chunk.text)
            .bind(chunk.start_line)
            .bind(chunk.end_line)
            .bind(&chunk.language)
            .bind(chunk.token_count)
            .execute(&mut **tx)
            .await?;

            sqlx::query("INSERT INTO chunks_fts (text, mirror_hash, seq) VALUES (?, ?, ?)")
                .bind(&chunk.text)
                .bind(mirror_hash)
                .bind(chunk.seq)
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    pub async fn get_chunks(&self, mirror_hash: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT seq, pos, text, start_line, end_line, language, token_count \
             FROM chunks WHERE mirror_hash = ? ORDER BY seq",
        )
        .bind(mirror_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    /// Fetch chunks for many mirrors in a single query.
    pub async fn get_chunks_batch(
        &self,
        mirror_hashes: &[String],
    ) -> Result<HashMap<String, Vec<Chunk>>> {
        let mut out: HashMap<String, Vec<Chunk>> = HashMap::new();
        if mirror_hashes.is_empty() {
            return Ok(out);
        }

        let mut builder = sqlx::QueryBuilder::new(
            "SELECT mirror_hash, seq, pos, text, start_line, end_line, language, token_count \
             FROM chunks WHERE mirror_hash IN (",
        );
        let mut separated = builder.separated(", ");
        for hash in mirror_hashes {
            separated.push_bind(hash);
        }
        builder.push(") ORDER BY mirror_hash, seq");

        let rows = builder.build().fetch_all(&self.pool).await?;
        for row in &rows {
            let hash: String = row.get("mirror_hash");
            out.entry(hash).or_default().push(chunk_from_row(row));
        }
        Ok(out)
    }

    // ── full-text search ───────────────────────────────────────────────

    /// BM25 search over chunk text.
    ///
    /// The raw query is compiled to an FTS5 expression with each token
    /// quoted (implicit AND), so user input cannot produce syntax errors.
    pub async fn search_fts(&self, query: &str, options: &FtsOptions) -> Result<Vec<FtsHit>> {
        let match_expr = fts_match_expression(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }
        let limit = if options.limit == 0 { 50 } else { options.limit } as i64;

        let mut sql = String::from(
            "SELECT chunks_fts.mirror_hash AS mirror_hash, CAST(chunks_fts.seq AS INTEGER) AS seq, \
             chunks_fts.rank AS score, d.docid, d.uri, d.title, d.collection, d.rel_path, \
             d.source_mime, d.source_ext, d.source_size \
             FROM chunks_fts \
             JOIN documents d ON d.mirror_hash = chunks_fts.mirror_hash AND d.active = 1 \
             WHERE chunks_fts MATCH ?",
        );
        if options.collection.is_some() {
            sql.push_str(" AND d.collection = ?");
        }
        sql.push_str(" ORDER BY chunks_fts.rank LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&match_expr);
        if let Some(collection) = &options.collection {
            q = q.bind(collection);
        }
        let rows = q.bind(limit).fetch_all(&self.pool).await?;

        Ok(rows
            .iter()
            .map(|row| FtsHit {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get::<i64, _>("seq"),
                score: row.get("score"),
                docid: row.get("docid"),
                uri: row.get("uri"),
                title: row.get("title"),
                collection: row.get("collection"),
                rel_path: row.get("rel_path"),
                source_mime: row.get("source_mime"),
                source_ext: row.get("source_ext"),
                source_size: row.get("source_size"),
            })
            .collect())
    }

    /// Active documents grouped by the mirror they point at.
    pub async fn get_documents_by_mirrors(
        &self,
        mirror_hashes: &[String],
    ) -> Result<HashMap<String, Vec<DocMeta>>> {
        let mut out: HashMap<String, Vec<DocMeta>> = HashMap::new();
        if mirror_hashes.is_empty() {
            return Ok(out);
        }
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT mirror_hash, docid, uri, title, collection, rel_path, source_mime, \
             source_ext, source_size FROM documents WHERE active = 1 AND mirror_hash IN (",
        );
        let mut separated = builder.separated(", ");
        for hash in mirror_hashes {
            separated.push_bind(hash);
        }
        builder.push(") ORDER BY docid");
        let rows = builder.build().fetch_all(&self.pool).await?;
        for row in &rows {
            let hash: String = row.get("mirror_hash");
            out.entry(hash).or_default().push(DocMeta {
                docid: row.get("docid"),
                uri: row.get("uri"),
                title: row.get("title"),
                collection: row.get("collection"),
                rel_path: row.get("rel_path"),
                source_mime: row.get("source_mime"),
                source_ext: row.get("source_ext"),
                source_size: row.get("source_size"),
            });
        }
        Ok(out)
    }

    /// Stored embeddings for a mirror under one model, in seq order.
    pub async fn get_vectors_for_mirror(
        &self,
        mirror_hash: &str,
        model: &str,
    ) -> Result<Vec<Vec<f32>>> {
        let rows = sqlx::query(
            "SELECT embedding FROM content_vectors \
             WHERE mirror_hash = ? AND model = ? ORDER BY seq",
        )
        .bind(mirror_hash)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                crate::vec_index::blob_to_vec(&blob)
            })
            .collect()
    }

    /// Drop and recreate the FTS table with the tokenizer this store was
    /// opened with, repopulating from `chunks`.
    pub async fn rebuild_fts(&mut self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DROP TABLE IF EXISTS chunks_fts")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "CREATE VIRTUAL TABLE chunks_fts USING fts5(\
             text, mirror_hash UNINDEXED, seq UNINDEXED, tokenize = '{}')",
            self.tokenizer
        ))
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query(
            "INSERT INTO chunks_fts (text, mirror_hash, seq) \
             SELECT text, mirror_hash, seq FROM chunks",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO meta (key, value) VALUES ('fts_tokenizer', ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(&self.tokenizer)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.needs_fts_rebuild = false;
        Ok(result.rows_affected())
    }

    // ── links ──────────────────────────────────────────────────────────

    /// Replace all parsed links for a document.
    pub async fn put_links(&self, source_doc_id: i64, links: &[Link]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::put_links_tx(&mut tx, source_doc_id, links).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn put_links_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        source_doc_id: i64,
        links: &[Link],
    ) -> Result<()> {
        sqlx::query("DELETE FROM links WHERE source_doc_id = ? AND source = 'parsed'")
            .bind(source_doc_id)
            .execute(&mut **tx)
            .await?;
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO links (
                    source_doc_id, target_ref, target_ref_norm, target_anchor,
                    target_collection, link_type, link_text,
                    start_line, start_col, end_line, end_col, source
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(source_doc_id)
            .bind(&link.target_ref)
            .bind(&link.target_ref_norm)
            .bind(&link.target_anchor)
            .bind(&link.target_collection)
            .bind(link.link_type.as_str())
            .bind(&link.link_text)
            .bind(link.start_line)
            .bind(link.start_col)
            .bind(link.end_line)
            .bind(link.end_col)
            .bind(link.source.as_str())
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Outgoing links of a document, ordered by source position.
    pub async fn get_links_for_doc(
        &self,
        source_doc_id: i64,
        link_type: Option<LinkType>,
    ) -> Result<Vec<StoredLink>> {
        let mut sql = String::from(
            "SELECT id, source_doc_id, target_ref, target_ref_norm, target_anchor, \
             target_collection, link_type, link_text, start_line, start_col, end_line, \
             end_col, source FROM links WHERE source_doc_id = ?",
        );
        if link_type.is_some() {
            sql.push_str(" AND link_type = ?");
        }
        sql.push_str(" ORDER BY start_line, start_col");

        let mut q = sqlx::query(&sql).bind(source_doc_id);
        if let Some(lt) = link_type {
            q = q.bind(lt.as_str());
        }
        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(stored_link_from_row).collect()
    }

    /// Links from other documents whose target resolves to this document,
    /// ordered by `(source_uri, start_line, start_col)`.
    pub async fn get_backlinks_for_doc(&self, doc: &Document) -> Result<Vec<Backlink>> {
        let norms = target_norms_for(doc);
        if norms.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = sqlx::QueryBuilder::new(
            "SELECT l.target_ref, l.target_ref_norm, l.target_anchor, l.target_collection, \
             l.link_type, l.link_text, l.start_line, l.start_col, l.end_line, l.end_col, \
             l.source, d.docid AS source_docid, d.uri AS source_uri \
             FROM links l \
             JOIN documents d ON d.id = l.source_doc_id AND d.active = 1 \
             WHERE d.id != ",
        );
        builder.push_bind(doc.id);
        builder.push(" AND l.target_ref_norm IN (");
        let mut separated = builder.separated(", ");
        for norm in &norms {
            separated.push_bind(norm);
        }
        builder.push(") AND (l.target_collection IS NULL OR l.target_collection = ");
        builder.push_bind(&doc.collection);
        builder.push(") ORDER BY source_uri, l.start_line, l.start_col");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(Backlink {
                    source_docid: row.get("source_docid"),
                    source_uri: row.get("source_uri"),
                    link: link_from_row(row)?,
                })
            })
            .collect()
    }

    /// Advisory resolution: does any active document match this normalized
    /// target (scoped to a collection when given)?
    pub async fn resolve_link_target(
        &self,
        target_ref_norm: &str,
        collection: Option<&str>,
    ) -> Result<Option<String>> {
        let rows = sqlx::query(
            "SELECT docid, collection, rel_path, title FROM documents WHERE active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            if let Some(scope) = collection {
                let doc_collection: String = row.get("collection");
                if doc_collection != scope {
                    continue;
                }
            }
            let rel_path: String = row.get("rel_path");
            let title: Option<String> = row.get("title");
            let matches = title
                .as_deref()
                .map(|t| normalize_ref(t) == target_ref_norm)
                .unwrap_or(false)
                || path_norms(&rel_path).contains(&target_ref_norm.to_string());
            if matches {
                return Ok(Some(row.get("docid")));
            }
        }
        Ok(None)
    }

    // ── backlog ────────────────────────────────────────────────────────

    /// Chunks with no vector for `model`, in `(mirror_hash, seq)` order,
    /// strictly after the cursor.
    pub async fn get_backlog(
        &self,
        model: &str,
        limit: usize,
        after: Option<&(String, i64)>,
    ) -> Result<Vec<BacklogItem>> {
        let (cursor_hash, cursor_seq) = match after {
            Some((hash, seq)) => (hash.clone(), *seq),
            None => (String::new(), i64::MIN),
        };
        let rows = sqlx::query(
            r#"
            SELECT c.mirror_hash, c.seq, c.text,
                   (SELECT d.title FROM documents d
                     WHERE d.mirror_hash = c.mirror_hash AND d.active = 1
                     ORDER BY d.docid LIMIT 1) AS title
            FROM chunks c
            LEFT JOIN content_vectors v
                ON v.mirror_hash = c.mirror_hash AND v.seq = c.seq AND v.model = ?
            WHERE v.mirror_hash IS NULL
              AND (c.mirror_hash > ? OR (c.mirror_hash = ? AND c.seq > ?))
            ORDER BY c.mirror_hash, c.seq
            LIMIT ?
            "#,
        )
        .bind(model)
        .bind(&cursor_hash)
        .bind(&cursor_hash)
        .bind(cursor_seq)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BacklogItem {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                text: row.get("text"),
                title: row.get("title"),
            })
            .collect())
    }

    // ── maintenance ────────────────────────────────────────────────────

    /// Remove rows no active document refers to: content (cascading to
    /// chunks and vectors), stray FTS rows, and stray vector rows.
    /// Transactional and reentrant.
    pub async fn cleanup_orphans(&self) -> Result<CleanupReport> {
        let mut tx = self.pool.begin().await?;

        let content = sqlx::query(
            "DELETE FROM content WHERE mirror_hash NOT IN \
             (SELECT mirror_hash FROM documents WHERE active = 1 AND mirror_hash IS NOT NULL)",
        )
        .execute(&mut *tx)
        .await?;

        // FTS5 stores every column as text, so the seq comparison needs an
        // explicit cast.
        let fts = sqlx::query(
            "DELETE FROM chunks_fts WHERE rowid IN (\
             SELECT chunks_fts.rowid FROM chunks_fts \
             LEFT JOIN chunks c ON c.mirror_hash = chunks_fts.mirror_hash \
             AND c.seq = CAST(chunks_fts.seq AS INTEGER) \
             WHERE c.mirror_hash IS NULL)",
        )
        .execute(&mut *tx)
        .await?;

        let vectors = sqlx::query(
            "DELETE FROM content_vectors WHERE NOT EXISTS (\
             SELECT 1 FROM chunks c WHERE c.mirror_hash = content_vectors.mirror_hash \
             AND c.seq = content_vectors.seq)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CleanupReport {
            content_removed: content.rows_affected(),
            fts_removed: fts.rows_affected(),
            vectors_removed: vectors.rows_affected(),
        })
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let documents = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let active_documents =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;
        let content_rows = sqlx::query_scalar("SELECT COUNT(*) FROM content")
            .fetch_one(&self.pool)
            .await?;
        let chunks = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let ingest_errors = sqlx::query_scalar("SELECT COUNT(*) FROM ingest_errors")
            .fetch_one(&self.pool)
            .await?;
        let vector_rows =
            sqlx::query("SELECT model, COUNT(*) AS n FROM content_vectors GROUP BY model")
                .fetch_all(&self.pool)
                .await?;
        Ok(StoreStats {
            documents,
            active_documents,
            content_rows,
            chunks,
            vectors_by_model: vector_rows
                .iter()
                .map(|row| (row.get("model"), row.get("n")))
                .collect(),
            ingest_errors,
        })
    }

    // ── combined write path ────────────────────────────────────────────

    /// Apply one document's conversion atomically: content, document row,
    /// chunk replacement, FTS rows, and parsed links in a single
    /// transaction.
    pub async fn apply_conversion(
        &self,
        input: &DocumentInput,
        canonical_markdown: &str,
        chunks: &[Chunk],
        links: &[Link],
    ) -> Result<Document> {
        validate_collection_name(&input.collection)?;
        let mirror_hash = input
            .mirror_hash
            .as_deref()
            .ok_or_else(|| Error::validation("apply_conversion requires a mirror_hash"))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO content (mirror_hash, markdown, created_at) VALUES (?, ?, ?) \
             ON CONFLICT(mirror_hash) DO NOTHING",
        )
        .bind(mirror_hash)
        .bind(canonical_markdown)
        .bind(now())
        .execute(&mut *tx)
        .await?;

        let doc = Self::upsert_document_tx(&mut tx, input).await?;
        Self::put_chunks_tx(&mut tx, mirror_hash, chunks).await?;
        Self::put_links_tx(&mut tx, doc.id, links).await?;

        tx.commit().await?;
        Ok(doc)
    }
}

fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        seq: row.get("seq"),
        pos: row.get("pos"),
        text: row.get("text"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        language: row.get("language"),
        token_count: row.get("token_count"),
    }
}

fn link_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Link> {
    let link_type: String = row.get("link_type");
    let source: String = row.get("source");
    Ok(Link {
        target_ref: row.get("target_ref"),
        target_ref_norm: row.get("target_ref_norm"),
        target_anchor: row.get("target_anchor"),
        target_collection: row.get("target_collection"),
        link_type: LinkType::parse(&link_type)?,
        link_text: row.get("link_text"),
        start_line: row.get("start_line"),
        start_col: row.get("start_col"),
        end_line: row.get("end_line"),
        end_col: row.get("end_col"),
        source: match source.as_str() {
            "user" => crate::models::LinkSource::User,
            "suggested" => crate::models::LinkSource::Suggested,
            _ => crate::models::LinkSource::Parsed,
        },
    })
}

fn stored_link_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<StoredLink> {
    Ok(StoredLink {
        id: row.get("id"),
        source_doc_id: row.get("source_doc_id"),
        link: link_from_row(row)?,
    })
}

/// The normalized refs under which a document can be addressed: its
/// title, its path, its path without extension, and its file stem.
fn target_norms_for(doc: &Document) -> Vec<String> {
    let mut norms = Vec::new();
    if let Some(title) = &doc.title {
        norms.push(normalize_ref(title));
    }
    norms.extend(path_norms(&doc.rel_path));
    norms.retain(|n| !n.is_empty());
    norms.dedup();
    norms
}

fn path_norms(rel_path: &str) -> Vec<String> {
    let mut norms = vec![normalize_ref(rel_path)];
    let path = std::path::Path::new(rel_path);
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let without = &rel_path[..rel_path.len() - ext.len() - 1];
        norms.push(normalize_ref(without));
    }
    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
        norms.push(normalize_ref(stem));
    }
    norms
}

/// Compile user input to an FTS5 MATCH expression: each whitespace token
/// is double-quoted (implicit AND between tokens).
fn fts_match_expression(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| format!("\"{}\"", token.replace('"', "")))
        .filter(|t| t.len() > 2)
        .collect::<Vec<_>>()
        .join(" ")
}
