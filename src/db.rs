//! SQLite connection management: pooling, PRAGMA plumbing, DDL transactions
//! and versioned migrations. Contains no business logic.
//!
//! Grounded on `_sqlite_utils.py`. The Python source pins one connection per
//! OS thread via a `threading.local`-backed factory over synchronous
//! `sqlite3`; this crate is async (`sqlx`/`tokio`, per the teacher's stack),
//! so the equivalent here is a bounded [`sqlx::SqlitePool`] — see SPEC_FULL
//! §5's translation note.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqliteConnection, SqlitePool};

use crate::error::{ReaderError, StorageError};

pub const APPLICATION_ID: u32 = u32::from_be_bytes(*b"reaD");

/// Runtime knobs the teacher's CLI would otherwise read from a TOML file;
/// here they're an explicit constructor argument (ambient-stack addition,
/// SPEC_FULL §10).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
    pub chunk_size: i64,
    pub default_interval_minutes: i64,
    pub default_jitter: f64,
    pub search_enabled_by_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_connections: 5,
            busy_timeout: Duration::from_millis(5_000),
            acquire_timeout: Duration::from_secs(10),
            chunk_size: 256,
            default_interval_minutes: 60,
            default_jitter: 0.0,
            search_enabled_by_default: false,
        }
    }
}

/// A pool of connections to one SQLite database, plus the knobs used to
/// open every new connection in it (mirrors `LocalConnectionFactory`'s
/// per-connection setup, minus the thread-affinity bookkeeping that an
/// async pool already subsumes).
#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
    pub path: String,
    pub config: EngineConfig,
}

impl Database {
    /// Opens (creating if necessary) the database at `path`, applies
    /// pragmas, verifies/sets the application id, and — if `migration` is
    /// given — runs it.
    pub async fn open(
        path: &str,
        config: EngineConfig,
        migration: Option<&HeavyMigration>,
    ) -> Result<Self, ReaderError> {
        let is_private = path == ":memory:" || path.is_empty();

        if !is_private {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ReaderError::Storage(StorageError::Other(e.to_string()))
                    })?;
                }
            }
        }

        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
            .create_if_missing(true)
            .busy_timeout(config.busy_timeout)
            .foreign_keys(true);

        let max_connections = if is_private { 1 } else { config.max_connections };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(if is_private { 1 } else { 0 })
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(classify_open_error)?;

        {
            let mut conn = pool.acquire().await.map_err(classify_open_error)?;
            ensure_application_id(&mut conn, APPLICATION_ID).await?;
            conn.execute("PRAGMA journal_mode = WAL;").await.ok();
        }

        if let Some(migration) = migration {
            migration.migrate(&pool).await?;
        }

        Ok(Database {
            pool,
            path: path.to_string(),
            config,
        })
    }
}

fn classify_open_error(err: sqlx::Error) -> ReaderError {
    let msg = err.to_string().to_lowercase();
    if msg.contains("database is locked")
        || msg.contains("database table is locked")
        || msg.contains("unable to open database file")
    {
        return ReaderError::Storage(StorageError::Other(
            "another process has this database open".to_string(),
        ));
    }
    ReaderError::Storage(StorageError::Sqlx(err))
}

/// Writes the 4-byte application id on first open; refuses to operate on a
/// database stamped with a different one.
pub async fn ensure_application_id(
    conn: &mut SqliteConnection,
    id: u32,
) -> Result<bool, ReaderError> {
    let old_id = get_int_pragma(conn, "application_id").await?;
    if old_id != 0 {
        if old_id as u32 != id {
            return Err(ReaderError::Storage(StorageError::ApplicationId(format!(
                "invalid existing application id: 0x{old_id:x}"
            ))));
        }
        return Ok(false);
    }

    let count = table_count(conn).await?;
    if count != 0 {
        return Err(ReaderError::Storage(StorageError::Other(
            "database with no application id already has tables".to_string(),
        )));
    }

    set_int_pragma(conn, "application_id", id as i64).await?;
    Ok(true)
}

pub async fn get_int_pragma(conn: &mut SqliteConnection, pragma: &str) -> Result<i64, ReaderError> {
    let row: (i64,) = sqlx::query_as(&format!("PRAGMA {pragma};"))
        .fetch_one(conn)
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
    Ok(row.0)
}

pub async fn set_int_pragma(
    conn: &mut SqliteConnection,
    pragma: &str,
    value: i64,
) -> Result<(), ReaderError> {
    conn.execute(format!("PRAGMA {pragma} = {value};").as_str())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
    Ok(())
}

pub async fn table_count(conn: &mut SqliteConnection) -> Result<i64, ReaderError> {
    let row: (i64,) = sqlx::query_as("SELECT count(*) FROM sqlite_master;")
        .fetch_one(conn)
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
    Ok(row.0)
}

/// Disables FK enforcement for the duration of `f`, restoring it
/// afterwards. Must be called outside any transaction — SQLite ignores
/// `PRAGMA foreign_keys` changes issued mid-transaction.
pub async fn foreign_keys_off<S, F, T>(conn: &mut SqliteConnection, state: &S, f: F) -> Result<T, ReaderError>
where
    F: for<'c> FnOnce(&'c mut SqliteConnection, &'c S) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, ReaderError>> + Send + 'c>>,
{
    let was_on = get_int_pragma(conn, "foreign_keys").await? != 0;
    set_int_pragma(conn, "foreign_keys", 0).await?;
    let result = f(conn, state).await;
    set_int_pragma(conn, "foreign_keys", if was_on { 1 } else { 0}).await?;
    result
}

/// Raises [`StorageError::Integrity`] if `PRAGMA foreign_key_check` reports
/// any violation.
pub async fn foreign_key_check(conn: &mut SqliteConnection) -> Result<(), ReaderError> {
    let rows = sqlx::query("PRAGMA foreign_key_check;")
        .fetch_all(conn)
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
    if rows.is_empty() {
        return Ok(());
    }
    Err(ReaderError::Storage(StorageError::Integrity(
        "FOREIGN KEY constraint failed".to_string(),
    )))
}

type MigrationFn = for<'c> fn(
    &'c mut SqliteConnection,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), ReaderError>> + Send + 'c>>;

type CreateFn = MigrationFn;

/// Versioned schema bootstrap/upgrade, matching `_sqlite_utils.py`'s
/// `HeavyMigration`.
pub struct HeavyMigration {
    pub create: CreateFn,
    pub version: i64,
    pub migrations: std::collections::BTreeMap<i64, MigrationFn>,
    pub missing_suffix: &'static str,
}

impl HeavyMigration {
    pub async fn migrate(&self, pool: &SqlitePool) -> Result<(), ReaderError> {
        let mut conn = pool.acquire().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        let ran_any = foreign_keys_off(&mut conn, self, |conn, this| Box::pin(async move {
            conn.execute("BEGIN;").await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

            let result = this.migrate_inner(conn).await;

            match &result {
                Ok(_) => {
                    conn.execute("COMMIT;").await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
                }
                Err(_) => {
                    conn.execute("ROLLBACK;").await.ok();
                }
            }
            result
        }))
        .await?;

        if ran_any {
            conn.execute("VACUUM;").await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        }
        Ok(())
    }

    async fn migrate_inner(&self, conn: &mut SqliteConnection) -> Result<bool, ReaderError> {
        let version = get_int_pragma(conn, "user_version").await?;

        if version == 0 {
            if table_count(conn).await? != 0 {
                return Err(ReaderError::Storage(StorageError::Other(
                    "database with no version already has tables".to_string(),
                )));
            }
            (self.create)(conn).await?;
            set_int_pragma(conn, "user_version", self.version).await?;
            return Ok(true);
        }

        if version == self.version {
            return Ok(false);
        }
        if version > self.version {
            return Err(ReaderError::Storage(StorageError::SchemaVersion(format!(
                "invalid version: {version}"
            ))));
        }

        let mut from_version = version;
        while from_version < self.version {
            let to_version = from_version + 1;
            let Some(migration) = self.migrations.get(&from_version) else {
                return Err(ReaderError::Storage(StorageError::SchemaVersion(format!(
                    "no migration from {from_version} to {to_version}; expected migrations for all versions later than {version}{}",
                    self.missing_suffix
                ))));
            };
            migration(conn).await?;
            set_int_pragma(conn, "user_version", to_version).await?;
            foreign_key_check(conn).await.map_err(|e| {
                if let ReaderError::Storage(StorageError::Integrity(msg)) = e {
                    ReaderError::Storage(StorageError::Integrity(format!(
                        "after migrating to version {to_version}: {msg}"
                    )))
                } else {
                    e
                }
            })?;
            from_version = to_version;
        }
        Ok(true)
    }
}

/// Asserts a write affected exactly one row, matching
/// `rowcount_exactly_one`.
pub fn rowcount_exactly_one(rows_affected: u64, make_err: impl FnOnce() -> ReaderError) -> Result<(), ReaderError> {
    if rows_affected == 0 {
        return Err(make_err());
    }
    debug_assert_eq!(rows_affected, 1, "shouldn't have more than 1 row");
    Ok(())
}
