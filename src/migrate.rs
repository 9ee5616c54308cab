//! Versioned, forward-only schema migrations.
//!
//! The schema version is a monotonic integer stored in the `meta` table.
//! Migrations run in order inside a single transaction; opening a database
//! whose recorded version is newer than this build refuses with
//! `VALIDATION` (no downgrades).
//!
//! # Schema (version 1)
//!
//! ```text
//! ┌──────────────┐      ┌──────────────┐      ┌─────────────────┐
//! │ collections  │◀──┐  │   content    │◀──┐  │     chunks      │
//! │ name (PK)    │   │  │ mirror_hash  │   │  │ (mirror_hash,   │
//! └──────────────┘   │  │     (PK)     │   │  │  seq) PK        │
//!                    │  │ markdown     │   │  │ pos, text,      │
//! ┌──────────────┐   │  │ created_at   │   │  │ start/end_line  │
//! │  documents   │───┘  └──────────────┘   │  └────────┬────────┘
//! │ id (PK)      │                         │           │
//! │ collection ──┘ mirror_hash (no FK) ────┘  ┌────────▼────────┐
//! │ rel_path     │                            │ content_vectors │
//! │ docid (UQ)   │      ┌──────────────┐      │ (mirror_hash,   │
//! │ source_hash  │      │  chunks_fts  │      │  seq, model) PK │
//! │ active       │      │  (FTS5)      │      │ embedding BLOB  │
//! │ last_error_* │      └──────────────┘      └─────────────────┘
//! └──────┬───────┘
//!        │              ┌──────────────┐      ┌─────────────────┐
//!        └─────────────▶│    links     │      │  ingest_errors  │
//!                       └──────────────┘      └─────────────────┘
//! ```
//!
//! `documents.mirror_hash` deliberately has no foreign key: a document row
//! may exist before its content is materialized (e.g. after a conversion
//! failure).

use sqlx::sqlite::SqlitePool;

use crate::error::{Error, Result};

/// Schema version this build writes.
pub const SCHEMA_VERSION: i64 = 1;

const META_SCHEMA_VERSION: &str = "schema_version";
const META_FTS_TOKENIZER: &str = "fts_tokenizer";

pub async fn get_meta(pool: &SqlitePool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

/// Run all pending migrations and record the tokenizer choice.
///
/// Idempotent. Returns the schema version in effect afterwards.
pub async fn run_migrations(pool: &SqlitePool, fts_tokenizer: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *tx)
    .await?;

    let recorded: Option<String> =
        sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(META_SCHEMA_VERSION)
            .fetch_optional(&mut *tx)
            .await?;
    let recorded: i64 = recorded.and_then(|v| v.parse().ok()).unwrap_or(0);

    if recorded > SCHEMA_VERSION {
        return Err(Error::validation(format!(
            "database schema version {} is newer than supported version {}",
            recorded, SCHEMA_VERSION
        )));
    }

    if recorded < 1 {
        migrate_v1(&mut tx, fts_tokenizer).await?;
    }

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(META_SCHEMA_VERSION)
    .bind(SCHEMA_VERSION.to_string())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(SCHEMA_VERSION)
}

async fn migrate_v1(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    fts_tokenizer: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
            rel_path TEXT NOT NULL,
            docid TEXT NOT NULL UNIQUE,
            uri TEXT NOT NULL,
            source_hash TEXT NOT NULL,
            source_mime TEXT,
            source_ext TEXT,
            source_size INTEGER,
            source_mtime INTEGER,
            mirror_hash TEXT,
            title TEXT,
            converter_id TEXT,
            converter_version TEXT,
            language_hint TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            last_error_code TEXT,
            last_error_message TEXT,
            last_error_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(collection, rel_path)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content (
            mirror_hash TEXT PRIMARY KEY,
            markdown TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            mirror_hash TEXT NOT NULL REFERENCES content(mirror_hash) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            pos INTEGER NOT NULL,
            text TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            language TEXT,
            token_count INTEGER,
            PRIMARY KEY (mirror_hash, seq)
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    // FTS5 has no IF NOT EXISTS; probe sqlite_master first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(&mut **tx)
    .await?;
    if !fts_exists {
        sqlx::query(&format!(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                text,
                mirror_hash UNINDEXED,
                seq UNINDEXED,
                tokenize = '{}'
            )
            "#,
            fts_tokenizer
        ))
        .execute(&mut **tx)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_vectors (
            mirror_hash TEXT NOT NULL,
            seq INTEGER NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            embedded_at INTEGER NOT NULL,
            PRIMARY KEY (mirror_hash, seq, model),
            FOREIGN KEY (mirror_hash, seq)
                REFERENCES chunks(mirror_hash, seq) ON DELETE CASCADE
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS links (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_doc_id INTEGER NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
            target_ref TEXT NOT NULL,
            target_ref_norm TEXT NOT NULL,
            target_anchor TEXT,
            target_collection TEXT,
            link_type TEXT NOT NULL CHECK (link_type IN ('wiki', 'markdown')),
            link_text TEXT,
            start_line INTEGER NOT NULL,
            start_col INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            end_col INTEGER NOT NULL,
            source TEXT NOT NULL DEFAULT 'parsed'
                CHECK (source IN ('parsed', 'user', 'suggested'))
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_errors (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            rel_path TEXT NOT NULL,
            occurred_at INTEGER NOT NULL,
            code TEXT NOT NULL,
            message TEXT NOT NULL,
            details_json TEXT
        )
        "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_mirror ON documents(mirror_hash)")
        .execute(&mut **tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection)")
        .execute(&mut **tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_source ON links(source_doc_id)")
        .execute(&mut **tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_target ON links(target_ref_norm)")
        .execute(&mut **tx)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_content_vectors_model ON content_vectors(model)")
        .execute(&mut **tx)
        .await?;

    sqlx::query(
        "INSERT INTO meta (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(META_FTS_TOKENIZER)
    .bind(fts_tokenizer)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Tokenizer recorded at migration time.
pub async fn recorded_tokenizer(pool: &SqlitePool) -> Result<Option<String>> {
    get_meta(pool, META_FTS_TOKENIZER).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("m.sqlite")).await.unwrap();
        assert_eq!(run_migrations(&pool, "unicode61").await.unwrap(), 1);
        assert_eq!(run_migrations(&pool, "unicode61").await.unwrap(), 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn records_version_and_tokenizer() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("m.sqlite")).await.unwrap();
        run_migrations(&pool, "porter").await.unwrap();
        assert_eq!(
            get_meta(&pool, META_SCHEMA_VERSION).await.unwrap().as_deref(),
            Some("1")
        );
        assert_eq!(
            recorded_tokenizer(&pool).await.unwrap().as_deref(),
            Some("porter")
        );
        pool.close().await;
    }

    #[tokio::test]
    async fn refuses_downgrade() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = db::connect(&tmp.path().join("m.sqlite")).await.unwrap();
        run_migrations(&pool, "unicode61").await.unwrap();
        sqlx::query("UPDATE meta SET value = '999' WHERE key = ?")
            .bind(META_SCHEMA_VERSION)
            .execute(&pool)
            .await
            .unwrap();
        let err = run_migrations(&pool, "unicode61").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
        pool.close().await;
    }
}
