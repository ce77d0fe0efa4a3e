//! Typed CRUD/query operations over the schema: feeds, entries, tags.
//!
//! Grounded on `_storage/__init__.py` (the `Storage` facade wiring
//! together the per-domain mixins) and the teacher's `storage/schema.rs`
//! (`Database::open`/pool setup), adapted to the domain here rather than
//! articles/feeds-for-a-TUI.

pub mod entries;
pub mod feeds;
pub mod tags;

use sqlx::SqlitePool;

use crate::db::{Database, EngineConfig};
use crate::error::ReaderError;
use crate::schema;

/// Owns the main database (feeds/entries/tags/changes) and the knobs that
/// govern pagination chunk size.
#[derive(Clone)]
pub struct Storage {
    pub db: Database,
}

impl Storage {
    pub async fn open(path: &str, config: EngineConfig) -> Result<Self, ReaderError> {
        let migration = schema::migration();
        let db = Database::open(path, config, Some(&migration)).await?;
        Ok(Storage { db })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db.pool
    }

    pub fn chunk_size(&self) -> i64 {
        self.db.config.chunk_size
    }
}

/// Splits `items` into chunks of at most `size`, matching the teacher's
/// `QueryBuilder`-batching idiom (`storage/articles.rs`'s
/// `upsert_articles`, chunks of 50) generalised to an arbitrary size —
/// here, the storage's configured `chunk_size`.
pub fn chunks<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    if size == 0 {
        return vec![items];
    }
    let mut out = Vec::new();
    let mut iter = items.into_iter().peekable();
    while iter.peek().is_some() {
        out.push(iter.by_ref().take(size).collect());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_splits_evenly_and_on_remainder() {
        let v: Vec<i32> = (0..7).collect();
        let c = chunks(v, 3);
        assert_eq!(c, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[test]
    fn chunks_of_empty_is_empty() {
        let v: Vec<i32> = vec![];
        assert!(chunks(v, 3).is_empty());
    }
}
