//! Document-graph accessors: outgoing links, backlinks, and
//! similar-document lookup over stored embeddings.

use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::normalize_unit;
use crate::models::{parse_docid, Document, Link, LinkType};
use crate::store::{Backlink, Store};
use crate::vec_index::VectorIndex;

/// Default similarity floor for [`similar_documents`].
pub const DEFAULT_SIMILAR_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub link: Link,
    /// Advisory: docid of a document currently matching the target, if
    /// any. Not stored on the link row.
    pub resolved_docid: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LinksResult {
    pub docid: String,
    pub uri: String,
    pub links: Vec<LinkEntry>,
}

#[derive(Debug, Clone)]
pub struct BacklinksResult {
    pub docid: String,
    pub uri: String,
    pub backlinks: Vec<Backlink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimilarDoc {
    pub docid: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub collection: String,
    /// Cosine similarity in `[0, 1]`.
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct SimilarOptions {
    pub limit: usize,
    pub threshold: f64,
    pub cross_collection: bool,
}

impl Default for SimilarOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            threshold: DEFAULT_SIMILAR_THRESHOLD,
            cross_collection: false,
        }
    }
}

async fn document_for(store: &Store, docid: &str) -> Result<Document> {
    let prefix = parse_docid(docid)?;
    store.get_document_by_docid(&prefix).await
}

/// Outgoing links of a document, ordered by `(start_line, start_col)`,
/// with advisory resolution per link.
pub async fn outgoing_links(
    store: &Store,
    docid: &str,
    link_type: Option<&str>,
) -> Result<LinksResult> {
    let link_type = link_type.map(LinkType::parse).transpose()?;
    let doc = document_for(store, docid).await?;
    let stored = store.get_links_for_doc(doc.id, link_type).await?;

    let mut links = Vec::with_capacity(stored.len());
    for entry in stored {
        let scope = entry
            .link
            .target_collection
            .clone()
            .unwrap_or_else(|| doc.collection.clone());
        let resolved_docid = store
            .resolve_link_target(&entry.link.target_ref_norm, Some(&scope))
            .await?;
        links.push(LinkEntry {
            link: entry.link,
            resolved_docid,
        });
    }
    Ok(LinksResult {
        docid: doc.docid,
        uri: doc.uri,
        links,
    })
}

/// Links in other documents that point at this one, ordered by
/// `(source_uri, start_line, start_col)`.
pub async fn backlinks(store: &Store, docid: &str) -> Result<BacklinksResult> {
    let doc = document_for(store, docid).await?;
    let backlinks = store.get_backlinks_for_doc(&doc).await?;
    Ok(BacklinksResult {
        docid: doc.docid,
        uri: doc.uri,
        backlinks,
    })
}

/// Documents semantically similar to the given one.
///
/// The query vector is the L2-normalized mean of the document's stored
/// chunk embeddings; a document with no embeddings yields an empty
/// result. Neighbor search over-fetches (`min(20 · limit, 200)`), scoped
/// to the document's collection unless `cross_collection`, excludes the
/// document itself, deduplicates by docid, and drops scores below the
/// threshold.
pub async fn similar_documents(
    store: &Store,
    index: &VectorIndex,
    docid: &str,
    options: &SimilarOptions,
) -> Result<Vec<SimilarDoc>> {
    if !index.search_available() {
        return Err(Error::vec_unavailable(
            "similarity lookup unavailable: vec extension not loaded",
        ));
    }
    let doc = document_for(store, docid).await?;
    let Some(mirror_hash) = doc.mirror_hash.clone() else {
        return Ok(Vec::new());
    };

    let vectors = store
        .get_vectors_for_mirror(&mirror_hash, index.model())
        .await?;
    if vectors.is_empty() {
        return Ok(Vec::new());
    }

    let dims = index.dimensions();
    let mut mean = vec![0.0f32; dims];
    for vector in &vectors {
        for (m, v) in mean.iter_mut().zip(vector) {
            *m += v;
        }
    }
    let n = vectors.len() as f32;
    for m in mean.iter_mut() {
        *m /= n;
    }
    normalize_unit(&mut mean);

    let fetch_k = (20 * options.limit).min(200);
    let scope = if options.cross_collection {
        None
    } else {
        Some(doc.collection.as_str())
    };
    let nearest = index.search_nearest(&mean, fetch_k, scope).await?;

    let hashes: Vec<String> = nearest
        .iter()
        .map(|h| h.mirror_hash.clone())
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .collect();
    let docs_by_mirror = store.get_documents_by_mirrors(&hashes).await?;

    let mut seen = std::collections::HashSet::new();
    let mut out: Vec<SimilarDoc> = Vec::new();
    for hit in &nearest {
        let score = (1.0 - hit.distance).clamp(0.0, 1.0);
        if score < options.threshold {
            continue;
        }
        for meta in docs_by_mirror.get(&hit.mirror_hash).into_iter().flatten() {
            if meta.docid == doc.docid {
                continue;
            }
            if !options.cross_collection && meta.collection != doc.collection {
                continue;
            }
            if !seen.insert(meta.docid.clone()) {
                continue;
            }
            out.push(SimilarDoc {
                docid: meta.docid.clone(),
                uri: meta.uri.clone(),
                title: meta.title.clone(),
                collection: meta.collection.clone(),
                score,
            });
        }
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.docid.cmp(&b.docid))
    });
    out.truncate(options.limit);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::canonicalize_and_hash;
    use crate::chunk::chunk_markdown;
    use crate::links::extract_links;
    use crate::models::DocumentInput;
    use crate::vec_index::VectorRow;

    async fn setup() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(&tmp.path().join("g.sqlite"), "unicode61")
            .await
            .unwrap();
        (tmp, store)
    }

    async fn ingest(store: &Store, collection: &str, rel_path: &str, text: &str) -> Document {
        let (canonical, hash) = canonicalize_and_hash(text);
        let chunks = chunk_markdown(&canonical, 2000);
        let links = extract_links(&canonical);
        let input = DocumentInput {
            collection: collection.to_string(),
            rel_path: rel_path.to_string(),
            source_hash: format!("src-{}", rel_path),
            mirror_hash: Some(hash),
            title: canonical
                .lines()
                .find_map(|l| l.strip_prefix("# ").map(|t| t.to_string())),
            ..Default::default()
        };
        store
            .apply_conversion(&input, &canonical, &chunks, &links)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn outgoing_links_with_resolution() {
        let (_tmp, store) = setup().await;
        let hub = ingest(
            &store,
            "notes",
            "hub.md",
            "# Hub\n\nSee [[Known Page]] and [[Unknown Page]].\n",
        )
        .await;
        ingest(&store, "notes", "known.md", "# Known Page\n\nbody\n").await;

        let result = outgoing_links(&store, &format!("#{}", hub.docid), None)
            .await
            .unwrap();
        assert_eq!(result.links.len(), 2);
        assert!(result.links[0].resolved_docid.is_some());
        assert!(result.links[1].resolved_docid.is_none());
    }

    #[tokio::test]
    async fn link_type_filter_is_validated() {
        let (_tmp, store) = setup().await;
        let doc = ingest(&store, "notes", "a.md", "# A\n\n[[B]]\n").await;
        let err = outgoing_links(&store, &format!("#{}", doc.docid), Some("hyperlink"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn unknown_docid_is_not_found() {
        let (_tmp, store) = setup().await;
        let err = outgoing_links(&store, "#abcdef", None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn backlinks_ordered_by_source() {
        let (_tmp, store) = setup().await;
        let target = ingest(&store, "notes", "target.md", "# The Target\n\nbody\n").await;
        ingest(&store, "notes", "z-late.md", "# Z\n\n[[The Target]]\n").await;
        ingest(&store, "notes", "a-early.md", "# A\n\n[[The Target]]\n").await;

        let result = backlinks(&store, &format!("#{}", target.docid)).await.unwrap();
        assert_eq!(result.backlinks.len(), 2);
        assert!(result.backlinks[0].source_uri < result.backlinks[1].source_uri);
    }

    #[tokio::test]
    async fn similar_excludes_self_and_respects_threshold() {
        let (_tmp, store) = setup().await;
        let a = ingest(&store, "notes", "a.md", "# A\n\nalpha body\n").await;
        let b = ingest(&store, "notes", "b.md", "# B\n\nbeta body\n").await;
        let c = ingest(&store, "notes", "c.md", "# C\n\nunrelated\n").await;
        let index = VectorIndex::open(store.pool().clone(), "m", 3).await.unwrap();

        let put = |hash: &str, v: Vec<f32>| VectorRow {
            mirror_hash: hash.to_string(),
            seq: 0,
            vector: v,
        };
        index
            .upsert_vectors(&[
                put(a.mirror_hash.as_deref().unwrap(), vec![1.0, 0.0, 0.0]),
                put(b.mirror_hash.as_deref().unwrap(), vec![0.9, 0.1, 0.0]),
                put(c.mirror_hash.as_deref().unwrap(), vec![0.0, 0.0, 1.0]),
            ])
            .await
            .unwrap();

        let similar = similar_documents(
            &store,
            &index,
            &format!("#{}", a.docid),
            &SimilarOptions::default(),
        )
        .await
        .unwrap();

        assert!(similar.iter().all(|s| s.docid != a.docid));
        assert_eq!(similar.len(), 1); // c is orthogonal, below threshold
        assert_eq!(similar[0].docid, b.docid);
        assert!(similar[0].score > 0.9);
    }

    #[tokio::test]
    async fn similar_scopes_by_collection_unless_crossed() {
        let (_tmp, store) = setup().await;
        let a = ingest(&store, "notes", "a.md", "# A\n\nalpha\n").await;
        let other = ingest(&store, "work", "w.md", "# W\n\nwork body\n").await;
        let index = VectorIndex::open(store.pool().clone(), "m", 3).await.unwrap();
        index
            .upsert_vectors(&[
                VectorRow {
                    mirror_hash: a.mirror_hash.clone().unwrap(),
                    seq: 0,
                    vector: vec![1.0, 0.0, 0.0],
                },
                VectorRow {
                    mirror_hash: other.mirror_hash.clone().unwrap(),
                    seq: 0,
                    vector: vec![0.95, 0.05, 0.0],
                },
            ])
            .await
            .unwrap();

        let scoped = similar_documents(
            &store,
            &index,
            &format!("#{}", a.docid),
            &SimilarOptions::default(),
        )
        .await
        .unwrap();
        assert!(scoped.is_empty());

        let crossed = similar_documents(
            &store,
            &index,
            &format!("#{}", a.docid),
            &SimilarOptions {
                cross_collection: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(crossed.len(), 1);
        assert_eq!(crossed[0].collection, "work");
    }

    #[tokio::test]
    async fn similar_without_embeddings_is_empty() {
        let (_tmp, store) = setup().await;
        let a = ingest(&store, "notes", "a.md", "# A\n\nalpha\n").await;
        let index = VectorIndex::open(store.pool().clone(), "m", 3).await.unwrap();
        let similar = similar_documents(
            &store,
            &index,
            &format!("#{}", a.docid),
            &SimilarOptions::default(),
        )
        .await
        .unwrap();
        assert!(similar.is_empty());
    }
}
