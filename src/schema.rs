//! Table/index DDL and the migration ladder.
//!
//! Grounded on `_storage/_schema.py`: `feeds`, `entries`, the three tag
//! tables, and the two indexes that mirror the `entries_by_recent` sort
//! key. Search's own tables live in `search.rs` since they belong to the
//! sibling `.search` database, not this schema.

use std::collections::BTreeMap;
use std::pin::Pin;

use sqlx::{Executor, SqliteConnection};

use crate::db::HeavyMigration;
use crate::error::{ReaderError, StorageError};

pub const VERSION: i64 = 1;

const CREATE_FEEDS: &str = r#"
CREATE TABLE feeds (
    url TEXT PRIMARY KEY NOT NULL,
    updated TIMESTAMP,
    title TEXT,
    link TEXT,
    author TEXT,
    subtitle TEXT,
    version TEXT,
    user_title TEXT,
    added TIMESTAMP NOT NULL,
    last_updated TIMESTAMP,
    last_exception TEXT,
    updates_enabled INTEGER NOT NULL DEFAULT 1,
    stale INTEGER NOT NULL DEFAULT 0,
    http_etag TEXT,
    http_last_modified TEXT,
    data_hash BLOB
);
"#;

const CREATE_ENTRIES: &str = r#"
CREATE TABLE entries (
    id TEXT NOT NULL,
    feed TEXT NOT NULL,
    title TEXT,
    link TEXT,
    updated TIMESTAMP,
    author TEXT,
    published TIMESTAMP,
    summary TEXT,
    content TEXT,
    enclosures TEXT,
    read INTEGER NOT NULL DEFAULT 0,
    read_modified TIMESTAMP,
    important INTEGER,
    important_modified TIMESTAMP,
    added_by TEXT NOT NULL,
    first_updated TIMESTAMP NOT NULL,
    first_updated_epoch TIMESTAMP NOT NULL,
    feed_order INTEGER NOT NULL DEFAULT 0,
    recent_sort TIMESTAMP NOT NULL,
    original_feed TEXT,
    data_hash BLOB,
    data_hash_changed INTEGER,
    last_updated TIMESTAMP NOT NULL,
    sequence BLOB,
    PRIMARY KEY (id, feed),
    FOREIGN KEY (feed) REFERENCES feeds(url) ON UPDATE CASCADE ON DELETE CASCADE
);
"#;

const CREATE_GLOBAL_TAGS: &str = r#"
CREATE TABLE global_tags (
    key TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (key)
);
"#;

const CREATE_FEED_TAGS: &str = r#"
CREATE TABLE feed_tags (
    feed TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (feed, key),
    FOREIGN KEY (feed) REFERENCES feeds(url) ON UPDATE CASCADE ON DELETE CASCADE
);
"#;

const CREATE_ENTRY_TAGS: &str = r#"
CREATE TABLE entry_tags (
    id TEXT NOT NULL,
    feed TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL DEFAULT 'null',
    PRIMARY KEY (id, feed, key),
    FOREIGN KEY (id, feed) REFERENCES entries(id, feed) ON UPDATE CASCADE ON DELETE CASCADE
);
"#;

/// Mirrors the `recent` sort key exactly, in DESC order.
const CREATE_ENTRIES_BY_RECENT: &str = r#"
CREATE INDEX entries_by_recent ON entries (
    recent_sort DESC,
    coalesce(published, updated, first_updated) DESC,
    feed DESC,
    last_updated DESC,
    (-feed_order) DESC,
    id DESC
);
"#;

const CREATE_ENTRIES_BY_FEED: &str = r#"
CREATE INDEX entries_by_feed ON entries (feed);
"#;

const CREATE_CHANGES: &str = r#"
CREATE TABLE changes (
    sequence BLOB NOT NULL,
    feed TEXT NOT NULL,
    id TEXT NOT NULL,
    key TEXT NOT NULL DEFAULT '',
    action INTEGER NOT NULL,
    PRIMARY KEY (sequence, feed, id, key)
);
"#;

fn create_all<'c>(
    conn: &'c mut SqliteConnection,
) -> Pin<Box<dyn std::future::Future<Output = Result<(), ReaderError>> + Send + 'c>> {
    Box::pin(async move {
        for stmt in [
            CREATE_FEEDS,
            CREATE_ENTRIES,
            CREATE_GLOBAL_TAGS,
            CREATE_FEED_TAGS,
            CREATE_ENTRY_TAGS,
            CREATE_ENTRIES_BY_RECENT,
            CREATE_ENTRIES_BY_FEED,
            CREATE_CHANGES,
        ] {
            conn.execute(stmt)
                .await
                .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        }
        Ok(())
    })
}

/// Returns the full migration ladder for the main database. There is
/// exactly one version so far (this crate's v0→v1 bootstrap already wires
/// in the sequence column and change tracker tables that the distilled
/// source only adds in its v38→v39 migration — see `MISSING_SUFFIX` below
/// for how a *future* such migration would be registered).
pub fn migration() -> HeavyMigration {
    HeavyMigration {
        create: create_all,
        version: VERSION,
        migrations: BTreeMap::new(),
        missing_suffix: "; some migrations may have been removed in a later release",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_by_recent_mirrors_recent_sort_key() {
        assert!(CREATE_ENTRIES_BY_RECENT.contains("recent_sort DESC"));
        assert!(CREATE_ENTRIES_BY_RECENT.contains("coalesce(published, updated, first_updated) DESC"));
    }
}
