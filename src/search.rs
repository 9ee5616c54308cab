//! Lexical and vector retrieval stages.
//!
//! Both searchers return document-level candidate lists, one list per
//! query variant, ready for rank fusion. Scores are normalized to
//! `[0, 1]` at this boundary:
//!
//! - BM25: `score = 1 - 1/(1 + e^(-raw))` over the raw FTS5 rank. Any
//!   monotone decreasing map would satisfy the contract; this one is
//!   fixed for schema version 1.
//! - Vector: `score = (1 - cosine_distance)` clamped to `[0, 1]`.
//!
//! Chunk hydration is batched: one `get_chunks_batch` call covers every
//! hit of every variant (per-hash fetch loops are a regression, not a
//! style choice).

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::model::{normalize_unit, Embedder};
use crate::store::{ChunkLookup, FtsOptions, Store};
use crate::vec_index::VectorIndex;

/// Characters of chunk text shown in a snippet.
const SNIPPET_CHARS: usize = 240;

/// A document-level retrieval candidate.
#[derive(Debug, Clone)]
pub struct DocCandidate {
    pub docid: String,
    pub uri: String,
    pub title: Option<String>,
    pub collection: String,
    pub rel_path: String,
    pub mime: Option<String>,
    pub ext: Option<String>,
    pub size_bytes: Option<i64>,
    pub mirror_hash: String,
    /// Best-matching chunk for this document.
    pub seq: i64,
    /// Normalized score in `[0, 1]`.
    pub score: f64,
    pub snippet: String,
    pub snippet_range: Option<(i64, i64)>,
    /// Full text of the best chunk, for reranking.
    pub chunk_text: String,
}

/// Map a raw FTS5 rank (more negative = better) into `[0, 1]`,
/// monotone decreasing.
pub fn bm25_score_norm(raw: f64) -> f64 {
    1.0 - 1.0 / (1.0 + (-raw).exp())
}

fn make_snippet(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let truncated: String = flat.chars().take(SNIPPET_CHARS).collect();
    format!("{}…", truncated.trim_end())
}

/// BM25 retrieval over the FTS index.
pub struct Bm25Searcher<'a> {
    store: &'a Store,
}

impl<'a> Bm25Searcher<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// One candidate list per query variant, each deduplicated to the
    /// best chunk per document and sorted best-first.
    pub async fn search_lists(
        &self,
        variants: &[String],
        collection: Option<&str>,
        k: usize,
    ) -> Result<Vec<Vec<DocCandidate>>> {
        let mut raw_lists = Vec::with_capacity(variants.len());
        let mut all_hashes: HashSet<String> = HashSet::new();

        for variant in variants {
            let hits = self
                .store
                .search_fts(
                    variant,
                    &FtsOptions {
                        collection: collection.map(|c| c.to_string()),
                        limit: k,
                    },
                )
                .await?;
            for hit in &hits {
                all_hashes.insert(hit.mirror_hash.clone());
            }
            raw_lists.push(hits);
        }

        // Single batched hydration for every variant's hits.
        let hashes: Vec<String> = all_hashes.into_iter().collect();
        let mut lookup = ChunkLookup::new(self.store.get_chunks_batch(&hashes).await?);

        let mut lists = Vec::with_capacity(raw_lists.len());
        for hits in raw_lists {
            let mut best_per_doc: HashMap<String, DocCandidate> = HashMap::new();
            for hit in hits {
                let score = bm25_score_norm(hit.score);
                let entry = best_per_doc.get(&hit.docid);
                if entry.map(|c| score <= c.score).unwrap_or(false) {
                    continue;
                }
                let Some(chunk) = lookup.get(&hit.mirror_hash, hit.seq) else {
                    continue;
                };
                best_per_doc.insert(
                    hit.docid.clone(),
                    DocCandidate {
                        docid: hit.docid,
                        uri: hit.uri,
                        title: hit.title,
                        collection: hit.collection,
                        rel_path: hit.rel_path,
                        mime: hit.source_mime,
                        ext: hit.source_ext,
                        size_bytes: hit.source_size,
                        mirror_hash: hit.mirror_hash,
                        seq: hit.seq,
                        score,
                        snippet: make_snippet(&chunk.text),
                        snippet_range: Some((chunk.start_line, chunk.end_line)),
                        chunk_text: chunk.text.clone(),
                    },
                );
            }
            let mut list: Vec<DocCandidate> = best_per_doc.into_values().collect();
            list.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.docid.cmp(&b.docid))
            });
            list.truncate(k);
            lists.push(list);
        }
        Ok(lists)
    }
}

/// Vector retrieval over the ANN side-index.
pub struct VectorSearcher<'a> {
    store: &'a Store,
    index: &'a VectorIndex,
    embedder: &'a dyn Embedder,
}

impl<'a> VectorSearcher<'a> {
    pub fn new(store: &'a Store, index: &'a VectorIndex, embedder: &'a dyn Embedder) -> Self {
        Self {
            store,
            index,
            embedder,
        }
    }

    /// One candidate list per query variant. Fails with
    /// `VEC_UNAVAILABLE` when the side-index cannot search.
    pub async fn search_lists(
        &self,
        variants: &[String],
        collection: Option<&str>,
        k: usize,
        threshold: Option<f64>,
    ) -> Result<Vec<Vec<DocCandidate>>> {
        let mut nearest_lists = Vec::with_capacity(variants.len());
        let mut all_hashes: HashSet<String> = HashSet::new();

        for variant in variants {
            let mut query_vec = self.embedder.embed(variant).await?;
            normalize_unit(&mut query_vec);
            let nearest = self.index.search_nearest(&query_vec, k, collection).await?;
            for hit in &nearest {
                all_hashes.insert(hit.mirror_hash.clone());
            }
            nearest_lists.push(nearest);
        }

        let hashes: Vec<String> = all_hashes.into_iter().collect();
        let mut lookup = ChunkLookup::new(self.store.get_chunks_batch(&hashes).await?);
        let docs_by_mirror = self.store.get_documents_by_mirrors(&hashes).await?;

        let mut lists = Vec::with_capacity(nearest_lists.len());
        for nearest in nearest_lists {
            let mut best_per_doc: HashMap<String, DocCandidate> = HashMap::new();
            for hit in nearest {
                let score = (1.0 - hit.distance).clamp(0.0, 1.0);
                if threshold.map(|t| score < t).unwrap_or(false) {
                    continue;
                }
                let Some(chunk) = lookup.get(&hit.mirror_hash, hit.seq) else {
                    continue;
                };
                let snippet = make_snippet(&chunk.text);
                let range = Some((chunk.start_line, chunk.end_line));
                let chunk_text = chunk.text.clone();
                for doc in docs_by_mirror.get(&hit.mirror_hash).into_iter().flatten() {
                    if let Some(scope) = collection {
                        if doc.collection != scope {
                            continue;
                        }
                    }
                    let entry = best_per_doc.get(&doc.docid);
                    if entry.map(|c| score <= c.score).unwrap_or(false) {
                        continue;
                    }
                    best_per_doc.insert(
                        doc.docid.clone(),
                        DocCandidate {
                            docid: doc.docid.clone(),
                            uri: doc.uri.clone(),
                            title: doc.title.clone(),
                            collection: doc.collection.clone(),
                            rel_path: doc.rel_path.clone(),
                            mime: doc.source_mime.clone(),
                            ext: doc.source_ext.clone(),
                            size_bytes: doc.source_size,
                            mirror_hash: hit.mirror_hash.clone(),
                            seq: hit.seq,
                            score,
                            snippet: snippet.clone(),
                            snippet_range: range,
                            chunk_text: chunk_text.clone(),
                        },
                    );
                }
            }
            let mut list: Vec<DocCandidate> = best_per_doc.into_values().collect();
            list.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.docid.cmp(&b.docid))
            });
            list.truncate(k);
            lists.push(list);
        }
        Ok(lists)
    }
}
