//! Append-only change log, populated by triggers on `entries`/`feeds`.
//!
//! Grounded on `_storage/_changes.py`: same table shape, same four
//! triggers, same enable/disable/get/done semantics. `rowid` ordering is
//! kept on `get()` for the same reason the source keeps it — determinism
//! in tests.

use sqlx::{Executor, Row, SqlitePool};

use crate::error::{ReaderError, StorageError};
use crate::types::{Action, Change};

/// Installs the `changes` table (already created by [`crate::schema`]) and
/// its four triggers, seeds `entries.sequence`, and backfills one INSERT
/// change per existing entry.
pub async fn enable(pool: &SqlitePool) -> Result<(), ReaderError> {
    let mut tx = pool.begin().await.map_err(sqlx_err)?;

    for stmt in TRIGGER_DDL {
        tx.execute(*stmt).await.map_err(sqlx_err)?;
    }

    tx.execute("UPDATE entries SET sequence = randomblob(16);")
        .await
        .map_err(sqlx_err)?;

    tx.execute(
        "INSERT INTO changes (sequence, feed, id, key, action) \
         SELECT sequence, feed, id, '', 1 FROM entries;",
    )
    .await
    .map_err(sqlx_err)?;

    tx.commit().await.map_err(sqlx_err)?;
    Ok(())
}

/// Drops the triggers and clears sequences. The `changes` table itself is
/// part of the base schema and is left in place, empty.
pub async fn disable(pool: &SqlitePool) -> Result<(), ReaderError> {
    let mut tx = pool.begin().await.map_err(sqlx_err)?;
    for name in TRIGGER_NAMES {
        tx.execute(format!("DROP TRIGGER IF EXISTS {name};").as_str())
            .await
            .map_err(sqlx_err)?;
    }
    tx.execute("DELETE FROM changes;").await.map_err(sqlx_err)?;
    tx.execute("UPDATE entries SET sequence = NULL;")
        .await
        .map_err(sqlx_err)?;
    tx.commit().await.map_err(sqlx_err)?;
    Ok(())
}

pub async fn is_enabled(pool: &SqlitePool) -> Result<bool, ReaderError> {
    let row: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM sqlite_master WHERE type='trigger' AND name = ?;",
    )
    .bind(TRIGGER_NAMES[0])
    .fetch_one(pool)
    .await
    .map_err(sqlx_err)?;
    Ok(row.0 > 0)
}

/// Returns up to `limit` pending changes (bounded by the caller's
/// `chunk_size`), optionally filtered to one action.
pub async fn get(
    pool: &SqlitePool,
    action: Option<Action>,
    limit: i64,
) -> Result<Vec<Change>, ReaderError> {
    if !is_enabled(pool).await? {
        return Err(ReaderError::ChangeTrackingNotEnabled);
    }

    let sql = match action {
        Some(_) => {
            "SELECT sequence, feed, id, key, action FROM changes \
             WHERE action = ? ORDER BY rowid LIMIT ?;"
        }
        None => "SELECT sequence, feed, id, key, action FROM changes ORDER BY rowid LIMIT ?;",
    };

    let mut query = sqlx::query(sql);
    if let Some(a) = action {
        query = query.bind(a as i64);
    }
    query = query.bind(limit);

    let rows = query.fetch_all(pool).await.map_err(sqlx_err)?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let seq: Vec<u8> = row.try_get(0).map_err(sqlx_err)?;
        let feed: String = row.try_get(1).map_err(sqlx_err)?;
        let id: String = row.try_get(2).map_err(sqlx_err)?;
        let key: String = row.try_get(3).map_err(sqlx_err)?;
        let action: i64 = row.try_get(4).map_err(sqlx_err)?;
        let mut seq_arr = [0u8; 16];
        seq_arr.copy_from_slice(&seq[..16.min(seq.len())]);
        out.push(Change {
            sequence: seq_arr,
            feed_url: feed.into(),
            id: id.into(),
            key,
            action: Action::from_db(action),
        });
    }
    Ok(out)
}

/// Acknowledges (deletes) exactly the given changes by composite key.
/// `changes.len()` must not exceed the caller's `chunk_size` — the caller
/// is expected to `get()`/`done()` in matching page sizes.
pub async fn done(pool: &SqlitePool, changes: &[Change]) -> Result<(), ReaderError> {
    let mut tx = pool.begin().await.map_err(sqlx_err)?;
    for c in changes {
        sqlx::query(
            "DELETE FROM changes WHERE sequence = ? AND feed = ? AND id = ? AND key = ? AND action = ?;",
        )
        .bind(c.sequence.to_vec())
        .bind(c.feed_url.as_ref())
        .bind(c.id.as_ref())
        .bind(&c.key)
        .bind(c.action as i64)
        .execute(&mut *tx)
        .await
        .map_err(sqlx_err)?;
    }
    tx.commit().await.map_err(sqlx_err)?;
    Ok(())
}

fn sqlx_err(e: sqlx::Error) -> ReaderError {
    ReaderError::Storage(StorageError::Sqlx(e))
}

const TRIGGER_NAMES: [&str; 4] = [
    "changes_entry_insert",
    "changes_entry_update",
    "changes_entry_delete",
    "changes_feed_changed",
];

const TRIGGER_DDL: &[&str] = &[
    r#"
    CREATE TRIGGER changes_entry_insert
    AFTER INSERT ON entries
    BEGIN
        UPDATE entries SET sequence = randomblob(16)
        WHERE feed = new.feed AND id = new.id;

        INSERT OR REPLACE INTO changes (sequence, feed, id, key, action)
        SELECT sequence, feed, id, '', 1 FROM entries
        WHERE feed = new.feed AND id = new.id;
    END;
    "#,
    r#"
    CREATE TRIGGER changes_entry_update
    AFTER UPDATE OF title, summary, content ON entries
    WHEN
        old.id = new.id AND old.feed = new.feed
        AND (
            coalesce(old.title, '') != coalesce(new.title, '')
            OR coalesce(old.summary, '') != coalesce(new.summary, '')
            OR coalesce(old.content, '') != coalesce(new.content, '')
        )
    BEGIN
        INSERT INTO changes (sequence, feed, id, key, action)
        VALUES (old.sequence, old.feed, old.id, '', 2);

        UPDATE entries SET sequence = randomblob(16)
        WHERE feed = new.feed AND id = new.id;

        INSERT OR REPLACE INTO changes (sequence, feed, id, key, action)
        SELECT sequence, feed, id, '', 1 FROM entries
        WHERE feed = new.feed AND id = new.id;
    END;
    "#,
    r#"
    CREATE TRIGGER changes_entry_delete
    AFTER DELETE ON entries
    BEGIN
        INSERT INTO changes (sequence, feed, id, key, action)
        VALUES (old.sequence, old.feed, old.id, '', 2);
    END;
    "#,
    // Separate from the entry-update trigger because ON UPDATE CASCADE on
    // entries.feed bypasses the INSERT OR REPLACE policy the entry-update
    // trigger relies on.
    r#"
    CREATE TRIGGER changes_feed_changed
    AFTER UPDATE OF url, title, user_title ON feeds
    WHEN
        coalesce(old.url, '') != coalesce(new.url, '')
        OR coalesce(old.title, '') != coalesce(new.title, '')
        OR coalesce(old.user_title, '') != coalesce(new.user_title, '')
    BEGIN
        INSERT INTO changes (sequence, feed, id, key, action)
        SELECT sequence, old.url, id, '', 2 FROM entries WHERE feed = new.url;

        UPDATE entries SET sequence = randomblob(16) WHERE feed = new.url;

        INSERT OR REPLACE INTO changes (sequence, feed, id, key, action)
        SELECT sequence, feed, id, '', 1 FROM entries WHERE feed = new.url;
    END;
    "#,
];
