//! Embedding backlog processor.
//!
//! Walks chunks that have no vector for the active model, in batches,
//! keyed by a monotonic `(mirror_hash, seq)` cursor. The cursor advances
//! to the last item of every fetched batch even when the batch fails, so
//! one bad row can never stall the loop; failed rows stay in the backlog
//! and are retried on the next processor instance.
//!
//! Chunks are formatted contextually before embedding: when the owning
//! document has a title the embedded text is `title + "\n\n" + text`.
//!
//! At the end of a run, if any side-index write left the vector index
//! dirty, the processor calls sync exactly once; a sync failure is
//! reported in the result without invalidating completed embeddings.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::Embedder;
use crate::store::{BacklogItem, Store};
use crate::vec_index::{VectorIndex, VectorRow};

pub const DEFAULT_BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BacklogReport {
    pub embedded: u64,
    pub errors: u64,
    pub sync_error: Option<String>,
}

pub struct BacklogProcessor<'a> {
    store: &'a Store,
    index: &'a VectorIndex,
    embedder: &'a dyn Embedder,
    batch_size: usize,
    cursor: Option<(String, i64)>,
}

impl<'a> BacklogProcessor<'a> {
    pub fn new(store: &'a Store, index: &'a VectorIndex, embedder: &'a dyn Embedder) -> Self {
        Self {
            store,
            index,
            embedder,
            batch_size: DEFAULT_BATCH_SIZE,
            cursor: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// `title + "\n\n" + text` when a title exists, else the text alone.
    fn format_item(item: &BacklogItem) -> String {
        match item.title.as_deref().filter(|t| !t.is_empty()) {
            Some(title) => format!("{}\n\n{}", title, item.text),
            None => item.text.clone(),
        }
    }

    /// Drain the backlog from the current cursor position.
    ///
    /// Cancellation (via `stop`) is honored between batches, never
    /// mid-batch.
    pub async fn run(&mut self, stop: Option<&AtomicBool>) -> Result<BacklogReport> {
        if self.embedder.dimensions() != self.index.dimensions() {
            return Err(Error::validation(format!(
                "embedder produces {} dimensions, index expects {}",
                self.embedder.dimensions(),
                self.index.dimensions()
            )));
        }

        let mut report = BacklogReport::default();

        loop {
            if stop.map(|s| s.load(Ordering::SeqCst)).unwrap_or(false) {
                debug!("backlog run cancelled between batches");
                break;
            }

            let batch = self
                .store
                .get_backlog(self.index.model(), self.batch_size, self.cursor.as_ref())
                .await?;
            if batch.is_empty() {
                break;
            }
            // Progress guarantee: advance past this batch no matter what
            // happens to it.
            let last = batch.last().expect("batch is non-empty");
            self.cursor = Some((last.mirror_hash.clone(), last.seq));

            let texts: Vec<String> = batch.iter().map(Self::format_item).collect();
            let vectors = match self.embedder.embed_batch(&texts).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(batch = batch.len(), error = %e, "embedding batch failed");
                    report.errors += batch.len() as u64;
                    continue;
                }
            };
            if vectors.len() != batch.len() {
                warn!(
                    expected = batch.len(),
                    got = vectors.len(),
                    "embedding batch returned wrong vector count"
                );
                report.errors += batch.len() as u64;
                continue;
            }

            let rows: Vec<VectorRow> = batch
                .iter()
                .zip(vectors)
                .map(|(item, vector)| VectorRow {
                    mirror_hash: item.mirror_hash.clone(),
                    seq: item.seq,
                    vector,
                })
                .collect();
            match self.index.upsert_vectors(&rows).await {
                Ok(_) => report.embedded += batch.len() as u64,
                Err(e) => {
                    warn!(batch = batch.len(), error = %e, "vector upsert failed");
                    report.errors += batch.len() as u64;
                }
            }
        }

        if self.index.vec_dirty() {
            if let Err(e) = self.index.sync().await {
                report.sync_error = Some(e.to_string());
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    use crate::canonical::canonicalize_and_hash;
    use crate::chunk::chunk_markdown;
    use crate::models::DocumentInput;

    /// Scripted embedder: fails the first `fail_batches` calls, then
    /// succeeds; records every batch it receives.
    struct ScriptedEmbedder {
        dims: usize,
        fail_batches: Mutex<u32>,
        seen: Mutex<Vec<Vec<String>>>,
        short_by: usize,
    }

    impl ScriptedEmbedder {
        fn new(dims: usize, fail_batches: u32) -> Self {
            Self {
                dims,
                fail_batches: Mutex::new(fail_batches),
                seen: Mutex::new(Vec::new()),
                short_by: 0,
            }
        }
    }

    #[async_trait]
    impl Embedder for ScriptedEmbedder {
        fn model_uri(&self) -> &str {
            "test-model"
        }

        fn dimensions(&self) -> usize {
            self.dims
        }

        async fn embed(&self, text: &str) -> crate::error::Result<Vec<f32>> {
            let mut out = self.embed_batch(&[text.to_string()]).await?;
            Ok(out.pop().unwrap())
        }

        async fn embed_batch(&self, texts: &[String]) -> crate::error::Result<Vec<Vec<f32>>> {
            self.seen.lock().unwrap().push(texts.to_vec());
            let mut remaining = self.fail_batches.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::new(
                    crate::error::ErrorKind::AdapterFailure,
                    "scripted failure",
                ));
            }
            let n = texts.len().saturating_sub(self.short_by);
            Ok((0..n)
                .map(|i| {
                    let mut v = vec![0.0f32; self.dims];
                    v[i % self.dims] = 1.0;
                    v
                })
                .collect())
        }
    }

    async fn setup_with_docs(
        docs: &[(&str, &str)],
    ) -> (tempfile::TempDir, Store, VectorIndex) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(&tmp.path().join("b.sqlite"), "unicode61")
            .await
            .unwrap();
        for (rel_path, text) in docs {
            let (canonical, hash) = canonicalize_and_hash(text);
            let chunks = chunk_markdown(&canonical, 2000);
            let input = DocumentInput {
                collection: "notes".to_string(),
                rel_path: rel_path.to_string(),
                source_hash: format!("src-{}", rel_path),
                mirror_hash: Some(hash),
                title: canonical
                    .lines()
                    .find_map(|l| l.strip_prefix("# ").map(|t| t.to_string())),
                ..Default::default()
            };
            store
                .apply_conversion(&input, &canonical, &chunks, &[])
                .await
                .unwrap();
        }
        let index = VectorIndex::open(store.pool().clone(), "test-model", 4)
            .await
            .unwrap();
        (tmp, store, index)
    }

    #[tokio::test]
    async fn happy_path_embeds_everything() {
        let (_tmp, store, index) = setup_with_docs(&[
            ("a.md", "# A\n\nalpha\n"),
            ("b.md", "# B\n\nbeta\n"),
            ("c.md", "# C\n\ngamma\n"),
        ])
        .await;
        let embedder = ScriptedEmbedder::new(4, 0);
        let mut processor = BacklogProcessor::new(&store, &index, &embedder);
        let report = processor.run(None).await.unwrap();
        assert_eq!(report.embedded, 3);
        assert_eq!(report.errors, 0);
        assert_eq!(report.sync_error, None);
        assert!(!index.vec_dirty());
    }

    #[tokio::test]
    async fn failed_batch_advances_cursor_without_retry() {
        let (_tmp, store, index) = setup_with_docs(&[
            ("a.md", "# A\n\nalpha\n"),
            ("b.md", "# B\n\nbeta\n"),
            ("c.md", "# C\n\ngamma\n"),
        ])
        .await;
        let embedder = ScriptedEmbedder::new(4, 1);
        let mut processor = BacklogProcessor::new(&store, &index, &embedder);

        let report = processor.run(None).await.unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.errors, 3);
        assert_eq!(report.sync_error, None);

        // Same processor, same input: the cursor is already past every
        // item, so nothing is fetched and nothing is retried.
        let again = processor.run(None).await.unwrap();
        assert_eq!(again.embedded, 0);
        assert_eq!(again.errors, 0);
        assert_eq!(embedder.seen.lock().unwrap().len(), 1);

        // A fresh processor starts from the beginning and succeeds now.
        let mut fresh = BacklogProcessor::new(&store, &index, &embedder);
        let recovered = fresh.run(None).await.unwrap();
        assert_eq!(recovered.embedded, 3);
        assert_eq!(recovered.errors, 0);
    }

    #[tokio::test]
    async fn reruns_are_idempotent() {
        let (_tmp, store, index) =
            setup_with_docs(&[("a.md", "# A\n\nalpha\n"), ("b.md", "# B\n\nbeta\n")]).await;
        let embedder = ScriptedEmbedder::new(4, 0);
        let first = BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap();
        assert_eq!(first.embedded, 2);
        let second = BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.errors, 0);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_vectors")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn title_context_prepended_to_chunk_text() {
        let (_tmp, store, index) = setup_with_docs(&[("a.md", "# Alpha Title\n\nbody text\n")]).await;
        let embedder = ScriptedEmbedder::new(4, 0);
        BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap();
        let seen = embedder.seen.lock().unwrap();
        assert!(seen[0][0].starts_with("Alpha Title\n\n"));
    }

    #[tokio::test]
    async fn short_vector_count_fails_whole_batch() {
        let (_tmp, store, index) =
            setup_with_docs(&[("a.md", "# A\n\nalpha\n"), ("b.md", "# B\n\nbeta\n")]).await;
        let mut embedder = ScriptedEmbedder::new(4, 0);
        embedder.short_by = 1;
        let report = BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.errors, 2);
    }

    #[tokio::test]
    async fn batching_respects_batch_size() {
        let (_tmp, store, index) = setup_with_docs(&[
            ("a.md", "# A\n\nalpha\n"),
            ("b.md", "# B\n\nbeta\n"),
            ("c.md", "# C\n\ngamma\n"),
        ])
        .await;
        let embedder = ScriptedEmbedder::new(4, 0);
        let report = BacklogProcessor::new(&store, &index, &embedder)
            .with_batch_size(2)
            .run(None)
            .await
            .unwrap();
        assert_eq!(report.embedded, 3);
        let seen = embedder.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].len(), 2);
        assert_eq!(seen[1].len(), 1);
    }

    #[tokio::test]
    async fn cancellation_between_batches() {
        let (_tmp, store, index) =
            setup_with_docs(&[("a.md", "# A\n\nalpha\n"), ("b.md", "# B\n\nbeta\n")]).await;
        let embedder = ScriptedEmbedder::new(4, 0);
        let stop = AtomicBool::new(true);
        let report = BacklogProcessor::new(&store, &index, &embedder)
            .run(Some(&stop))
            .await
            .unwrap();
        assert_eq!(report.embedded, 0);
        assert_eq!(report.errors, 0);
        assert!(embedder.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sync_error_reported_when_side_index_unavailable() {
        let (_tmp, store, mut index) = setup_with_docs(&[("a.md", "# A\n\nalpha\n")]).await;
        index.force_search_unavailable();
        let embedder = ScriptedEmbedder::new(4, 0);
        let report = BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap();
        // The durable write succeeded; only the side-index is behind.
        assert_eq!(report.embedded, 1);
        assert!(report.sync_error.is_some());
        assert!(index.vec_dirty());
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected_up_front() {
        let (_tmp, store, index) = setup_with_docs(&[("a.md", "# A\n\nalpha\n")]).await;
        let embedder = ScriptedEmbedder::new(8, 0);
        let err = BacklogProcessor::new(&store, &index, &embedder)
            .run(None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }
}
