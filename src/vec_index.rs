//! ANN side-index over stored chunk vectors.
//!
//! The durable source of truth is the `content_vectors` table; the vec0
//! virtual table is a derived view used only for k-NN search, reconciled
//! by [`VectorIndex::sync`]. Upserts write the durable table inside a
//! transaction first; side-index writes happen after commit and are
//! allowed to fail — any failure sets the in-memory `vec_dirty` flag so a
//! later sync can repair the index. The flag is per-instance and not
//! persisted; after a restart [`VectorIndex::needs_vec_sync`] recomputes
//! the state by diffing row counts.
//!
//! When the vec extension is not loaded, `search_available` is false:
//! vector search fails with `VEC_UNAVAILABLE` while durable upserts keep
//! succeeding.

use std::sync::atomic::{AtomicBool, Ordering};

use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::warn;

use crate::error::{Error, ErrorKind, Result};

/// Encode a vector as a little-endian f32 BLOB (`dim * 4` bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

/// Decode a little-endian f32 BLOB. Fails unless the length is a
/// multiple of 4.
pub fn blob_to_vec(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::validation(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

#[derive(Debug, Clone)]
pub struct VectorRow {
    pub mirror_hash: String,
    pub seq: i64,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Nearest {
    pub mirror_hash: String,
    pub seq: i64,
    /// Cosine distance, ascending (smaller = closer).
    pub distance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub rows: usize,
    pub side_index_ok: usize,
    pub side_index_failed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub added: u64,
    pub removed: u64,
}

pub struct VectorIndex {
    pool: SqlitePool,
    model: String,
    dims: usize,
    table: String,
    search_available: bool,
    dirty: AtomicBool,
}

impl VectorIndex {
    /// Open the side-index for one model on an already-migrated database.
    pub async fn open(pool: SqlitePool, model: &str, dims: usize) -> Result<VectorIndex> {
        if dims == 0 {
            return Err(Error::validation("vector index dimensions must be positive"));
        }
        let table = format!("chunk_vec_idx_{}", dims);
        let mut search_available = crate::db::probe_vec(&pool).await;
        if search_available {
            let ddl = format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING vec0(\
                 embedding float[{}] distance_metric=cosine, \
                 mirror_hash text, seq integer, model text)",
                table, dims
            );
            if let Err(e) = sqlx::query(&ddl).execute(&pool).await {
                warn!(error = %e, "vec0 table creation failed; vector search disabled");
                search_available = false;
            }
        }
        let index = VectorIndex {
            pool,
            model: model.to_string(),
            dims,
            table,
            search_available,
            dirty: AtomicBool::new(false),
        };
        // The dirty flag is not persisted; recompute it from the count
        // diff so a side-index left stale by a crash or external rebuild
        // is picked up by the next sync.
        if index.needs_vec_sync().await? {
            index.dirty.store(true, Ordering::SeqCst);
        }
        Ok(index)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    pub fn search_available(&self) -> bool {
        self.search_available
    }

    pub fn vec_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn check_dims(&self, vec: &[f32]) -> Result<()> {
        if vec.len() != self.dims {
            return Err(Error::validation(format!(
                "vector has {} dimensions, index expects {}",
                vec.len(),
                self.dims
            )));
        }
        Ok(())
    }

    /// Store vectors durably and mirror them into the side-index.
    ///
    /// Vectors are unit-normalized before storage (the search metric is
    /// cosine). The durable write is one transaction; side-index failures
    /// set `vec_dirty` without rolling it back.
    pub async fn upsert_vectors(&self, rows: &[VectorRow]) -> Result<UpsertReport> {
        for row in rows {
            self.check_dims(&row.vector)?;
        }
        let normalized: Vec<(String, i64, Vec<u8>)> = rows
            .iter()
            .map(|row| {
                let mut v = row.vector.clone();
                crate::model::normalize_unit(&mut v);
                (row.mirror_hash.clone(), row.seq, vec_to_blob(&v))
            })
            .collect();

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (hash, seq, blob) in &normalized {
            sqlx::query(
                "INSERT INTO content_vectors (mirror_hash, seq, model, dims, embedding, embedded_at) \
                 VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(mirror_hash, seq, model) DO UPDATE SET \
                 dims = excluded.dims, embedding = excluded.embedding, \
                 embedded_at = excluded.embedded_at",
            )
            .bind(hash)
            .bind(seq)
            .bind(&self.model)
            .bind(self.dims as i64)
            .bind(blob)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let mut report = UpsertReport {
            rows: rows.len(),
            ..Default::default()
        };
        for (hash, seq, blob) in &normalized {
            match self.side_upsert(hash, *seq, blob).await {
                Ok(()) => report.side_index_ok += 1,
                Err(e) => {
                    report.side_index_failed += 1;
                    self.dirty.store(true, Ordering::SeqCst);
                    warn!(mirror_hash = %hash, seq, error = %e, "side-index upsert failed");
                }
            }
        }
        Ok(report)
    }

    async fn side_upsert(&self, mirror_hash: &str, seq: i64, blob: &[u8]) -> Result<()> {
        if !self.search_available {
            return Err(Error::vec_unavailable("vec extension not loaded"));
        }
        sqlx::query(&format!(
            "DELETE FROM {} WHERE mirror_hash = ? AND seq = ? AND model = ?",
            self.table
        ))
        .bind(mirror_hash)
        .bind(seq)
        .bind(&self.model)
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (embedding, mirror_hash, seq, model) VALUES (?, ?, ?, ?)",
            self.table
        ))
        .bind(blob)
        .bind(mirror_hash)
        .bind(seq)
        .bind(&self.model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete all vectors for a mirror under this index's model.
    pub async fn delete_vectors_for_mirror(&self, mirror_hash: &str) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM content_vectors WHERE mirror_hash = ? AND model = ?")
                .bind(mirror_hash)
                .bind(&self.model)
                .execute(&self.pool)
                .await?;
        if self.search_available {
            let side = sqlx::query(&format!(
                "DELETE FROM {} WHERE mirror_hash = ? AND model = ?",
                self.table
            ))
            .bind(mirror_hash)
            .bind(&self.model)
            .execute(&self.pool)
            .await;
            if let Err(e) = side {
                self.dirty.store(true, Ordering::SeqCst);
                warn!(mirror_hash = %mirror_hash, error = %e, "side-index delete failed");
            }
        } else if result.rows_affected() > 0 {
            self.dirty.store(true, Ordering::SeqCst);
        }
        Ok(result.rows_affected())
    }

    /// Reconcile the side-index to the durable table: insert missing
    /// rows, drop rows whose durable counterpart is gone. Clears
    /// `vec_dirty` on success.
    pub async fn sync(&self) -> Result<SyncReport> {
        if !self.search_available {
            return Err(Error::new(
                ErrorKind::VecSyncFailed,
                "cannot sync: vec extension not loaded",
            ));
        }

        let missing = sqlx::query(&format!(
            "SELECT cv.mirror_hash, cv.seq, cv.embedding FROM content_vectors cv \
             WHERE cv.model = ? AND NOT EXISTS (\
             SELECT 1 FROM {} v WHERE v.mirror_hash = cv.mirror_hash \
             AND v.seq = cv.seq AND v.model = cv.model)",
            self.table
        ))
        .bind(&self.model)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::new(ErrorKind::VecSyncFailed, e.to_string()))?;

        let mut added = 0u64;
        for row in &missing {
            let hash: String = row.get("mirror_hash");
            let seq: i64 = row.get("seq");
            let blob: Vec<u8> = row.get("embedding");
            self.side_upsert(&hash, seq, &blob)
                .await
                .map_err(|e| Error::new(ErrorKind::VecSyncFailed, e.to_string()))?;
            added += 1;
        }

        let removed = sqlx::query(&format!(
            "DELETE FROM {} WHERE model = ? AND rowid IN (\
             SELECT v.rowid FROM {} v WHERE v.model = ? AND NOT EXISTS (\
             SELECT 1 FROM content_vectors cv WHERE cv.mirror_hash = v.mirror_hash \
             AND cv.seq = v.seq AND cv.model = v.model))",
            self.table, self.table
        ))
        .bind(&self.model)
        .bind(&self.model)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::new(ErrorKind::VecSyncFailed, e.to_string()))?;

        self.dirty.store(false, Ordering::SeqCst);
        Ok(SyncReport {
            added,
            removed: removed.rows_affected(),
        })
    }

    /// Drop every side-index row for this model and repopulate from the
    /// durable table.
    pub async fn rebuild(&self) -> Result<u64> {
        if !self.search_available {
            return Err(Error::vec_unavailable("vec extension not loaded"));
        }
        sqlx::query(&format!("DELETE FROM {} WHERE model = ?", self.table))
            .bind(&self.model)
            .execute(&self.pool)
            .await?;
        let report = self.sync().await?;
        Ok(report.added)
    }

    /// Whether the side-index and durable table disagree (used to restore
    /// the dirty state after a restart).
    pub async fn needs_vec_sync(&self) -> Result<bool> {
        let durable: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM content_vectors WHERE model = ?")
                .bind(&self.model)
                .fetch_one(&self.pool)
                .await?;
        if !self.search_available {
            return Ok(durable > 0);
        }
        let side: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE model = ?",
            self.table
        ))
        .bind(&self.model)
        .fetch_one(&self.pool)
        .await?;
        Ok(durable != side)
    }

    /// k-NN by cosine distance, ascending.
    ///
    /// With a collection filter the index over-fetches and post-filters
    /// against active documents, since the side-index itself knows
    /// nothing about collections.
    pub async fn search_nearest(
        &self,
        query_vec: &[f32],
        k: usize,
        collection: Option<&str>,
    ) -> Result<Vec<Nearest>> {
        if !self.search_available {
            return Err(Error::vec_unavailable(
                "vector search unavailable: vec extension not loaded",
            ));
        }
        self.check_dims(query_vec)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let fetch_k = if collection.is_some() {
            (k * 8).clamp(k, 400)
        } else {
            k
        };
        let blob = vec_to_blob(query_vec);
        let rows = sqlx::query(&format!(
            "SELECT mirror_hash, seq, distance FROM {} \
             WHERE embedding MATCH ? AND k = ? AND model = ? ORDER BY distance",
            self.table
        ))
        .bind(&blob)
        .bind(fetch_k as i64)
        .bind(&self.model)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<Nearest> = rows
            .iter()
            .map(|row| Nearest {
                mirror_hash: row.get("mirror_hash"),
                seq: row.get("seq"),
                distance: row.get("distance"),
            })
            .collect();

        if let Some(collection) = collection {
            let allowed: Vec<String> = sqlx::query_scalar(
                "SELECT DISTINCT mirror_hash FROM documents \
                 WHERE active = 1 AND collection = ? AND mirror_hash IS NOT NULL",
            )
            .bind(collection)
            .fetch_all(&self.pool)
            .await?;
            let allowed: std::collections::HashSet<String> = allowed.into_iter().collect();
            hits.retain(|h| allowed.contains(&h.mirror_hash));
        }

        hits.truncate(k);
        Ok(hits)
    }

    #[cfg(test)]
    pub(crate) fn force_search_unavailable(&mut self) {
        self.search_available = false;
    }

    #[cfg(test)]
    pub(crate) fn pool_for_tests(&self) -> &SqlitePool {
        &self.pool
    }
}
