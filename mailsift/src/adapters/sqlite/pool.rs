use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

use super::schema;
use crate::error::MailsiftError;

pub type DbPool = Pool<SqliteConnectionManager>;

/// Open (or create) the metadata database and make sure the schema exists.
///
/// `busy_timeout` bounds how long a commit waits on a locked database before
/// failing with `Timeout`.
pub fn create_pool(db_path: &Path, busy_timeout: Duration) -> Result<DbPool, MailsiftError> {
    let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -8000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;",
        )
    });

    let pool = Pool::builder()
        .max_size(8)
        .build(manager)?;

    let conn = pool.get()?;
    schema::initialize_schema(&conn)?;

    Ok(pool)
}

/// In-memory database (for testing).
///
/// Every connection of a memory manager is a separate database, so the pool
/// holds exactly one. Callers must not hold two connections at once.
pub fn in_memory() -> Result<DbPool, MailsiftError> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder().max_size(1).build(manager).map_err(|e| {
        MailsiftError::Database(format!("Failed to create database pool: {}", e))
    })?;

    let conn = pool.get()?;
    schema::initialize_schema(&conn)?;

    Ok(pool)
}
