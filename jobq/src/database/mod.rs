//! Database module for jobq.
//!
//! This module provides the persistence layer using SQLite with sqlx:
//! connection pools, migrations, immediate transactions, models and repositories.

pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Upper bound for the read pool size.
const MAX_READ_POOL_SIZE: u32 = 10;

/// Busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// WAL auto-checkpoint threshold in pages (~4MB with 4KB pages).
const WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

/// Journal size limit in bytes.
const JOURNAL_SIZE_LIMIT_BYTES: i64 = 16 * 1024 * 1024;

fn connect_options(database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))
        .foreign_keys(true)
        .create_if_missing(true))
}

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "PRAGMA journal_size_limit = {}",
        JOURNAL_SIZE_LIMIT_BYTES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn build_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<DbPool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        tracing::warn!(pool = pool_name, mode = %mode, "Journal mode is not WAL; re-setting");
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Read pool size: twice the available cores, capped.
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(MAX_READ_POOL_SIZE)
}

/// Initialize a read pool with WAL mode.
///
/// The scheduler's candidate queries and its single-statement lock writes go
/// through this pool; the lock write relies on the busy timeout (and
/// [`retry::retry_on_sqlite_busy`]) rather than on a serialized connection.
pub async fn init_pool_with_size(
    database_url: &str,
    max_connections: u32,
) -> Result<DbPool, sqlx::Error> {
    let pool = build_pool(database_url, max_connections, Duration::from_secs(30)).await?;
    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!(max_connections, "Database pool initialized");
    Ok(pool)
}

/// Initialize the read pool with the default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    init_pool_with_size(database_url, default_read_pool_size()).await
}

/// Initialize a serialized write pool with `max_connections = 1`.
///
/// Multi-statement writes that use `BEGIN IMMEDIATE` (the closer's cascade)
/// go through this pool, so only one connection ever waits on the SQLite
/// write lock.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool, sqlx::Error> {
    let pool = build_pool(database_url, 1, Duration::from_secs(60)).await?;
    ensure_wal_mode(&pool, "write_pool").await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");
    Ok(pool)
}

/// Apply the bundled schema migrations.
pub async fn run_migrations(pool: &DbPool) -> crate::Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Open read and write pools for `database_url` and apply migrations.
pub async fn connect(database_url: &str) -> crate::Result<(DbPool, WritePool)> {
    let pool = init_pool(database_url).await?;
    run_migrations(&pool).await?;
    let write_pool = init_write_pool(database_url).await?;
    Ok((pool, write_pool))
}

/// Start a `BEGIN IMMEDIATE` transaction on the write pool.
pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction, sqlx::Error> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Manual `BEGIN IMMEDIATE` transaction.
///
/// The write lock is taken up front, so two cascades never deadlock trying
/// to upgrade a deferred read transaction. Dropping an unfinished transaction
/// closes its connection, which makes SQLite roll it back.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    pub async fn commit(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), sqlx::Error> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

/// Test database backed by a temporary file.
///
/// In-memory SQLite databases are per-connection, so pooled tests need a file.
#[cfg(test)]
pub(crate) struct TestDb {
    pub pool: DbPool,
    pub write_pool: WritePool,
    _dir: tempfile::TempDir,
}

#[cfg(test)]
impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let url = format!(
            "sqlite:{}?mode=rwc",
            dir.path()
                .join("jobq-test.db")
                .to_string_lossy()
                .replace('\\', "/")
        );
        let (pool, write_pool) = connect(&url).await.unwrap();
        Self {
            pool,
            write_pool,
            _dir: dir,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_pool() {
        let pool = init_pool("sqlite::memory:").await.unwrap();

        // In-memory databases use "memory" journal mode, file-based ones "wal".
        let result: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();

        assert!(result.0 == "memory" || result.0 == "wal");
    }

    #[tokio::test]
    async fn test_connect_creates_schema() {
        let db = TestDb::new().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"jobs"));
        assert!(names.contains(&"job_dependencies"));
        assert!(names.contains(&"job_related_entities"));
    }

    #[tokio::test]
    async fn test_immediate_transaction_rollback() {
        let db = TestDb::new().await;

        let mut tx = begin_immediate(&db.write_pool).await.unwrap();
        sqlx::query(
            "INSERT INTO jobs (state, queue, command, created_at, execute_after) VALUES ('pending', 'default', 'x', 0, 0)",
        )
        .execute(&mut *tx)
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
