//! SQLite connection pool with WAL mode and the sqlite-vec extension.
//!
//! The vec extension is registered process-wide via `sqlite3_auto_extension`
//! before the first connection opens, so every pooled connection sees the
//! `vec0` module. Registration happens at most once; if it fails (or the
//! extension is compiled out), connections still work and vector search is
//! reported unavailable by [`probe_vec`].

use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

static VEC_REGISTERED: OnceLock<bool> = OnceLock::new();

/// Register sqlite-vec as a process-wide auto extension.
///
/// Safe to call repeatedly; only the first call does work.
fn register_vec_extension() -> bool {
    *VEC_REGISTERED.get_or_init(|| {
        let rc = unsafe {
            libsqlite3_sys::sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut libsqlite3_sys::sqlite3,
                    *mut *mut i8,
                    *const libsqlite3_sys::sqlite3_api_routines,
                ) -> i32,
            >(
                sqlite_vec::sqlite3_vec_init as *const ()
            )))
        };
        rc == libsqlite3_sys::SQLITE_OK
    })
}

/// Open (or create) the database at `path` and return a connection pool.
///
/// WAL journal mode for single-writer many-readers concurrency; foreign
/// keys enforced on every connection.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    register_vec_extension();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
        .map_err(crate::error::Error::from)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Whether the vec0 module is actually usable on this pool.
pub async fn probe_vec(pool: &SqlitePool) -> bool {
    sqlx::query_scalar::<_, String>("SELECT vec_version()")
        .fetch_one(pool)
        .await
        .is_ok()
}
