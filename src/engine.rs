//! Public operations facade.
//!
//! Bundles the store, the vector index, the conversion pipeline, and the
//! attached model ports behind the operations surface consumed by the
//! CLI/MCP collaborators:
//!
//! | Operation | Method |
//! |-----------|--------|
//! | `convert` | [`Engine::convert`] |
//! | `ingest` | [`Engine::ingest`] |
//! | `embed_backlog` | [`Engine::embed_backlog`] |
//! | `search_bm25` | [`Engine::search_bm25`] |
//! | `search_vector` | [`Engine::search_vector`] |
//! | `query` | [`Engine::query`] |
//! | `get_links` / `get_backlinks` / `get_similar` | [`Engine::get_links`] … |
//!
//! Scores leaving this surface are always in `[0, 1]`.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::convert::{default_pipeline, ConversionPipeline, ConvertInput};
use crate::embed_backlog::{BacklogProcessor, BacklogReport};
use crate::error::{Error, Result};
use crate::expand::{QueryExpander, QueryExpansion};
use crate::fusion::{blend_rerank, min_max_normalize, reciprocal_rank_fusion, FusedCandidate};
use crate::graph::{self, BacklinksResult, LinksResult, SimilarDoc, SimilarOptions};
use crate::ingest::{ingest_file, IngestRequest};
use crate::model::{Embedder, Generator, Reranker};
use crate::models::{ConversionArtifact, Document, SearchHit, SnippetRange, SourceInfo};
use crate::search::{Bm25Searcher, DocCandidate, VectorSearcher};
use crate::store::{Store, StoreStats};
use crate::vec_index::VectorIndex;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub collection: Option<String>,
    /// 0 means the configured default.
    pub limit: usize,
    /// Minimum similarity, vector search only.
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub collection: Option<String>,
    pub limit: usize,
    /// Expand the query through the generator before retrieval.
    pub expand: bool,
    /// Rescore fused candidates with the cross-encoder.
    pub rerank: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            collection: None,
            limit: 0,
            expand: true,
            rerank: true,
        }
    }
}

pub struct Engine {
    store: Store,
    config: Config,
    pipeline: Arc<ConversionPipeline>,
    vec_index: Option<VectorIndex>,
    embedder: Option<Arc<dyn Embedder>>,
    reranker: Option<Arc<dyn Reranker>>,
    generator: Option<Arc<dyn Generator>>,
}

impl Engine {
    /// Open the store at the configured path with the configured
    /// tokenizer. Model ports attach separately.
    pub async fn open(config: Config) -> Result<Engine> {
        config.validate()?;
        let store = Store::open(&config.db.path, &config.fts.tokenizer).await?;
        Ok(Engine {
            store,
            config,
            pipeline: default_pipeline(),
            vec_index: None,
            embedder: None,
            reranker: None,
            generator: None,
        })
    }

    /// Attach an embedder and open the vector side-index for its model.
    pub async fn attach_embedder(&mut self, embedder: Arc<dyn Embedder>) -> Result<()> {
        let index = VectorIndex::open(
            self.store.pool().clone(),
            embedder.model_uri(),
            embedder.dimensions(),
        )
        .await?;
        self.vec_index = Some(index);
        self.embedder = Some(embedder);
        Ok(())
    }

    pub fn attach_reranker(&mut self, reranker: Arc<dyn Reranker>) {
        self.reranker = Some(reranker);
    }

    pub fn attach_generator(&mut self, generator: Arc<dyn Generator>) {
        self.generator = Some(generator);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn vector_index(&self) -> Option<&VectorIndex> {
        self.vec_index.as_ref()
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    pub async fn cleanup_orphans(&self) -> Result<crate::store::CleanupReport> {
        self.store.cleanup_orphans().await
    }

    // ── write path ─────────────────────────────────────────────────────

    /// Convert bytes without touching the store.
    pub async fn convert(
        &self,
        rel_path: &str,
        bytes: Vec<u8>,
        mime: &str,
        ext: &str,
    ) -> Result<ConversionArtifact> {
        self.pipeline
            .convert(ConvertInput {
                rel_path: rel_path.to_string(),
                bytes,
                mime: mime.to_string(),
                ext: ext.to_string(),
                limits: self.config.limits,
            })
            .await
    }

    /// Ingest one discovered file.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Document> {
        ingest_file(
            &self.store,
            &self.pipeline,
            self.config.limits,
            self.config.chunking.max_chunk_bytes,
            request,
        )
        .await
    }

    /// Tombstone a document.
    pub async fn remove(&self, collection: &str, rel_path: &str) -> Result<bool> {
        self.store.mark_deleted(collection, rel_path).await
    }

    /// Embed everything in the backlog for `model_uri`.
    pub async fn embed_backlog(
        &self,
        model_uri: &str,
        batch_size: Option<usize>,
    ) -> Result<BacklogReport> {
        let (index, embedder) = self.vector_parts()?;
        if embedder.model_uri() != model_uri {
            return Err(Error::validation(format!(
                "attached embedder is {:?}, not {:?}",
                embedder.model_uri(),
                model_uri
            )));
        }
        let mut processor = BacklogProcessor::new(&self.store, index, embedder.as_ref())
            .with_batch_size(batch_size.unwrap_or(self.config.model.batch_size));
        processor.run(None).await
    }

    fn vector_parts(&self) -> Result<(&VectorIndex, &Arc<dyn Embedder>)> {
        match (&self.vec_index, &self.embedder) {
            (Some(index), Some(embedder)) => Ok((index, embedder)),
            _ => Err(Error::vec_unavailable("no embedder attached")),
        }
    }

    // ── read path ──────────────────────────────────────────────────────

    fn effective_limit(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.retrieval.final_limit
        } else {
            requested
        }
    }

    /// Pure lexical search.
    pub async fn search_bm25(&self, query: &str, options: &SearchOptions) -> Result<Vec<SearchHit>> {
        let limit = self.effective_limit(options.limit);
        let variants = vec![query.to_string()];
        let lists = Bm25Searcher::new(&self.store)
            .search_lists(
                &variants,
                options.collection.as_deref(),
                self.config.retrieval.candidate_k,
            )
            .await?;
        let mut hits: Vec<SearchHit> = lists
            .into_iter()
            .next()
            .unwrap_or_default()
            .iter()
            .map(|c| hit_from(c, c.score))
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }

    /// Pure vector search over the query text alone.
    pub async fn search_vector(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let (index, embedder) = self.vector_parts()?;
        let limit = self.effective_limit(options.limit);
        let variants = vec![query.to_string()];
        let lists = VectorSearcher::new(&self.store, index, embedder.as_ref())
            .search_lists(
                &variants,
                options.collection.as_deref(),
                self.config.retrieval.candidate_k,
                options
                    .threshold
                    .or(Some(self.config.retrieval.similarity_threshold)),
            )
            .await?;
        let mut hits: Vec<SearchHit> = lists
            .into_iter()
            .next()
            .unwrap_or_default()
            .iter()
            .map(|c| hit_from(c, c.score))
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }

    /// The full hybrid pipeline: expansion, parallel lexical + vector
    /// retrieval, RRF fusion, cross-encoder rerank.
    ///
    /// Degradations are graceful and logged: no generator (or
    /// `expand: false`) means identity expansion; an unavailable vector
    /// index means lexical-only retrieval; a reranker failure falls back
    /// to pure RRF ordering.
    pub async fn query(&self, query: &str, options: &QueryOptions) -> Result<Vec<SearchHit>> {
        let limit = self.effective_limit(options.limit);
        let candidate_k = self.config.retrieval.candidate_k;
        let collection = options.collection.as_deref();

        let expansion = match (&self.generator, options.expand) {
            (Some(generator), true) => QueryExpander::new(generator.as_ref()).expand(query).await,
            _ => QueryExpansion::identity(query),
        };

        let mut lists = Bm25Searcher::new(&self.store)
            .search_lists(&expansion.lexical_queries, collection, candidate_k)
            .await?;

        if let Ok((index, embedder)) = self.vector_parts() {
            if index.search_available() {
                let mut variants = expansion.vector_queries.clone();
                if !expansion.hyde_passage.is_empty() {
                    variants.push(expansion.hyde_passage.clone());
                }
                match VectorSearcher::new(&self.store, index, embedder.as_ref())
                    .search_lists(&variants, collection, candidate_k, None)
                    .await
                {
                    Ok(vector_lists) => lists.extend(vector_lists),
                    Err(e) => {
                        warn!(error = %e, "vector retrieval failed, continuing lexical-only")
                    }
                }
            }
        }

        // Best candidate per docid across every list, for hydration.
        let mut by_docid: HashMap<String, DocCandidate> = HashMap::new();
        for candidate in lists.iter().flatten() {
            let keep = by_docid
                .get(&candidate.docid)
                .map(|existing| candidate.score > existing.score)
                .unwrap_or(true);
            if keep {
                by_docid.insert(candidate.docid.clone(), candidate.clone());
            }
        }

        let key_lists: Vec<Vec<String>> = lists
            .iter()
            .map(|list| list.iter().map(|c| c.docid.clone()).collect())
            .collect();
        let fused = reciprocal_rank_fusion(&key_lists, self.config.retrieval.rrf_k);
        let top: Vec<FusedCandidate> = fused
            .into_iter()
            .take(self.config.retrieval.rerank_top_n)
            .collect();
        if top.is_empty() {
            return Ok(Vec::new());
        }

        let ordered = match (&self.reranker, options.rerank) {
            (Some(reranker), true) => {
                let texts: Vec<String> = top
                    .iter()
                    .map(|c| by_docid[&c.key].chunk_text.clone())
                    .collect();
                match reranker.rerank(query, &texts).await {
                    Ok(scores) if scores.len() == top.len() => blend_rerank(
                        &top,
                        &scores,
                        self.config.retrieval.rerank_alpha,
                    )
                    .into_iter()
                    .map(|b| (top[b.index].key.clone(), b.final_score))
                    .collect(),
                    Ok(scores) => {
                        warn!(
                            expected = top.len(),
                            got = scores.len(),
                            "reranker returned wrong score count, using pure fusion"
                        );
                        pure_rrf_order(&top)
                    }
                    Err(e) => {
                        warn!(error = %e, "reranker failed, using pure fusion");
                        pure_rrf_order(&top)
                    }
                }
            }
            _ => pure_rrf_order(&top),
        };

        let mut hits: Vec<SearchHit> = ordered
            .iter()
            .filter_map(|(docid, score)| by_docid.get(docid).map(|c| hit_from(c, *score)))
            .collect();
        hits.truncate(limit);
        Ok(hits)
    }

    // ── graph ──────────────────────────────────────────────────────────

    pub async fn get_links(&self, docid: &str, link_type: Option<&str>) -> Result<LinksResult> {
        graph::outgoing_links(&self.store, docid, link_type).await
    }

    pub async fn get_backlinks(&self, docid: &str) -> Result<BacklinksResult> {
        graph::backlinks(&self.store, docid).await
    }

    pub async fn get_similar(
        &self,
        docid: &str,
        options: &SimilarOptions,
    ) -> Result<Vec<SimilarDoc>> {
        let (index, _) = self.vector_parts()?;
        graph::similar_documents(&self.store, index, docid, options).await
    }

    pub async fn close(self) {
        self.store.close().await;
    }
}

/// Order fused candidates by RRF alone, min-max-scaled into `[0, 1]`.
fn pure_rrf_order(top: &[FusedCandidate]) -> Vec<(String, f64)> {
    let norms = min_max_normalize(&top.iter().map(|c| c.rrf_score).collect::<Vec<f64>>());
    top.iter()
        .zip(norms)
        .map(|(c, norm)| (c.key.clone(), norm))
        .collect()
}

fn hit_from(candidate: &DocCandidate, score: f64) -> SearchHit {
    SearchHit {
        docid: format!("#{}", candidate.docid),
        score: score.clamp(0.0, 1.0),
        uri: candidate.uri.clone(),
        title: candidate.title.clone(),
        snippet: candidate.snippet.clone(),
        source: SourceInfo {
            rel_path: candidate.rel_path.clone(),
            mime: candidate.mime.clone(),
            ext: candidate.ext.clone(),
            size_bytes: candidate.size_bytes,
        },
        snippet_range: candidate.snippet_range.map(|(start_line, end_line)| SnippetRange {
            start_line,
            end_line,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DbConfig;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            db: DbConfig {
                path: dir.join("engine.sqlite"),
            },
            fts: Default::default(),
            chunking: Default::default(),
            retrieval: Default::default(),
            model: Default::default(),
            limits: Default::default(),
        }
    }

    fn request(rel_path: &str, bytes: &[u8]) -> IngestRequest {
        IngestRequest {
            collection: "notes".to_string(),
            rel_path: rel_path.to_string(),
            bytes: bytes.to_vec(),
            mtime: None,
            size: None,
        }
    }

    #[tokio::test]
    async fn bm25_only_query_without_any_models() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(tmp.path())).await.unwrap();
        engine
            .ingest(request(
                "rust.md",
                b"# Rust Notes\n\nOwnership and borrowing in rust.\n",
            ))
            .await
            .unwrap();
        engine
            .ingest(request("other.md", b"# Other\n\nNothing relevant here.\n"))
            .await
            .unwrap();

        let hits = engine
            .query("ownership rust", &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].docid.starts_with('#'));
        assert!((0.0..=1.0).contains(&hits[0].score));
        assert_eq!(hits[0].source.rel_path, "rust.md");
        assert!(hits[0].snippet_range.is_some());
    }

    #[tokio::test]
    async fn search_vector_without_embedder_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(tmp.path())).await.unwrap();
        let err = engine
            .search_vector("anything", &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::VecUnavailable);
    }

    #[tokio::test]
    async fn embed_backlog_validates_model_uri() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(tmp.path())).await.unwrap();
        let err = engine.embed_backlog("hf:some/model", None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::VecUnavailable);
    }

    #[tokio::test]
    async fn search_bm25_respects_limit_and_collection() {
        let tmp = tempfile::tempdir().unwrap();
        let engine = Engine::open(test_config(tmp.path())).await.unwrap();
        for i in 0..5 {
            engine
                .ingest(request(
                    &format!("doc{}.md", i),
                    format!("# Doc {}\n\nshared keyword corpus entry {}.\n", i, i).as_bytes(),
                ))
                .await
                .unwrap();
        }
        let hits = engine
            .search_bm25(
                "corpus",
                &SearchOptions {
                    limit: 3,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);

        let none = engine
            .search_bm25(
                "corpus",
                &SearchOptions {
                    collection: Some("empty".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
