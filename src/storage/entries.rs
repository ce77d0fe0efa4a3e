//! Entry CRUD, filtering, counts, and the update-pipeline's write path.
//!
//! Grounded on `_storage/_entries.py`.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::db::rowcount_exactly_one;
use crate::error::{EntryError, FeedError, ReaderError, StorageError};
use crate::sql::{Query, SqlValue};
use crate::types::{
    AddedBy, Content, Enclosure, Entry, EntryCounts, EntryData, EntryFilter, EntryForUpdate,
    EntrySort, EntryUpdateIntent, TagAtom, TriState, FilterTriState,
};

use super::Storage;

impl Storage {
    /// Inserts a user-added entry (`added_by = user`); fails if the
    /// `(feed, id)` pair already exists.
    pub async fn add_entry(&self, entry: &EntryData, now: DateTime<Utc>) -> Result<(), ReaderError> {
        let content = serde_json::to_string(&entry.content).unwrap_or_default();
        let enclosures = serde_json::to_string(&entry.enclosures).unwrap_or_default();
        let data_hash = crate::hash::get_hash(&crate::hash::entry_hashable(entry));

        let result = sqlx::query(
            "INSERT INTO entries (id, feed, title, link, updated, author, published, summary, \
             content, enclosures, added_by, first_updated, first_updated_epoch, feed_order, \
             recent_sort, data_hash, data_hash_changed, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, ?);",
        )
        .bind(entry.id.as_ref())
        .bind(entry.feed_url.as_ref())
        .bind(&entry.title)
        .bind(&entry.link)
        .bind(entry.updated.map(|d| d.naive_utc()))
        .bind(&entry.author)
        .bind(entry.published.map(|d| d.naive_utc()))
        .bind(&entry.summary)
        .bind(content)
        .bind(enclosures)
        .bind(AddedBy::User.as_str())
        .bind(now.naive_utc())
        .bind(now.naive_utc())
        .bind(now.naive_utc())
        .bind(data_hash)
        .bind(now.naive_utc())
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().to_lowercase().contains("unique") => Err(
                ReaderError::Entry(EntryError::Exists(entry.feed_url.to_string(), entry.id.to_string())),
            ),
            Err(sqlx::Error::Database(e)) if e.message().to_lowercase().contains("foreign key") => {
                Err(ReaderError::Feed(FeedError::NotFound(entry.feed_url.to_string())))
            }
            Err(e) => Err(ReaderError::Storage(StorageError::Sqlx(e))),
        }
    }

    /// Deletes entries by `(feed_url, id)`, checking each one was added by
    /// `expected_origin` first — matches `_entries.py`'s origin guard for
    /// user-deletable entries.
    pub async fn delete_entries(
        &self,
        entries: &[(String, String)],
        expected_origin: Option<AddedBy>,
    ) -> Result<(), ReaderError> {
        let mut tx = self.pool().begin().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        for (feed_url, id) in entries {
            if let Some(expected) = expected_origin {
                let row = sqlx::query("SELECT added_by FROM entries WHERE feed = ? AND id = ?;")
                    .bind(feed_url)
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
                    .ok_or_else(|| ReaderError::Entry(EntryError::NotFound(feed_url.clone(), id.clone())))?;
                let added_by: String = row.try_get(0).unwrap_or_default();
                let actual = AddedBy::from_str(&added_by);
                if actual != expected {
                    return Err(ReaderError::Entry(EntryError::WrongOrigin(
                        feed_url.clone(),
                        id.clone(),
                        expected.as_str().to_string(),
                        actual.as_str().to_string(),
                    )));
                }
            }

            let result = sqlx::query("DELETE FROM entries WHERE feed = ? AND id = ?;")
                .bind(feed_url)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
            rowcount_exactly_one(result.rows_affected(), || {
                ReaderError::Entry(EntryError::NotFound(feed_url.clone(), id.clone()))
            })?;
        }

        tx.commit().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(())
    }

    pub async fn set_entry_read(
        &self,
        feed_url: &str,
        id: &str,
        read: bool,
        modified: Option<DateTime<Utc>>,
    ) -> Result<(), ReaderError> {
        let result = sqlx::query(
            "UPDATE entries SET read = ?, read_modified = ? WHERE feed = ? AND id = ?;",
        )
        .bind(read)
        .bind(modified.map(|d| d.naive_utc()))
        .bind(feed_url)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Entry(EntryError::NotFound(feed_url.to_string(), id.to_string()))
        })
    }

    pub async fn set_entry_important(
        &self,
        feed_url: &str,
        id: &str,
        important: TriState,
        modified: Option<DateTime<Utc>>,
    ) -> Result<(), ReaderError> {
        let result = sqlx::query(
            "UPDATE entries SET important = ?, important_modified = ? WHERE feed = ? AND id = ?;",
        )
        .bind(important.to_db())
        .bind(modified.map(|d| d.naive_utc()))
        .bind(feed_url)
        .bind(id)
        .execute(self.pool())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Entry(EntryError::NotFound(feed_url.to_string(), id.to_string()))
        })
    }

    /// Per-id lookups for the decider, one query per id inside a single
    /// transaction (the simple-loop choice documented for the "single-query
    /// optimization" open question).
    pub async fn get_entries_for_update(
        &self,
        ids: &[(String, String)],
    ) -> Result<Vec<Option<EntryForUpdate>>, ReaderError> {
        let mut tx = self.pool().begin().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        let mut out = Vec::with_capacity(ids.len());
        for (feed_url, id) in ids {
            let row = sqlx::query(
                "SELECT updated, published, data_hash, data_hash_changed, recent_sort FROM entries \
                 WHERE feed = ? AND id = ?;",
            )
            .bind(feed_url)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

            out.push(row.map(|row| EntryForUpdate {
                updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(0).ok().flatten().map(to_utc),
                published: row.try_get::<Option<chrono::NaiveDateTime>, _>(1).ok().flatten().map(to_utc),
                data_hash: row.try_get(2).unwrap_or(None),
                data_hash_changed: row.try_get::<Option<i64>, _>(3).unwrap_or(None).unwrap_or(0),
                recent_sort: row
                    .try_get::<chrono::NaiveDateTime, _>(4)
                    .map(to_utc)
                    .unwrap_or_else(|_| Utc::now()),
            }));
        }
        tx.commit().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(out)
    }

    /// Writes intents for one feed: `INSERT OR REPLACE`, chunked by the
    /// storage's configured `chunk_size`, each chunk its own transaction
    /// (non-atomic across chunks, matching `_entries.py`'s `executemany`
    /// batching). User-set fields (`read`, `important`, their `_modified`
    /// timestamps) are preserved across the replace via a sub-SELECT.
    /// `first_updated`, `first_updated_epoch`, and `recent_sort` are simply
    /// absent from the `DO UPDATE SET` list, so a conflicting write leaves
    /// the existing row's values in place rather than overwriting them with
    /// the freshly bound (first-seen-now) values.
    pub async fn add_or_update_entries(&self, intents: &[EntryUpdateIntent]) -> Result<(), ReaderError> {
        for chunk in super::chunks(intents.to_vec(), self.chunk_size() as usize) {
            let mut tx = self.pool().begin().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
            for intent in &chunk {
                let e = &intent.entry;
                let content = serde_json::to_string(&e.content).unwrap_or_default();
                let enclosures = serde_json::to_string(&e.enclosures).unwrap_or_default();

                sqlx::query(
                    "INSERT INTO entries (\
                        id, feed, title, link, updated, author, published, summary, content, \
                        enclosures, added_by, first_updated, first_updated_epoch, feed_order, \
                        recent_sort, data_hash, data_hash_changed, last_updated, \
                        read, read_modified, important, important_modified, sequence \
                     ) VALUES (\
                        ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, \
                        coalesce((SELECT read FROM entries WHERE id = ? AND feed = ?), 0), \
                        (SELECT read_modified FROM entries WHERE id = ? AND feed = ?), \
                        (SELECT important FROM entries WHERE id = ? AND feed = ?), \
                        (SELECT important_modified FROM entries WHERE id = ? AND feed = ?), \
                        (SELECT sequence FROM entries WHERE id = ? AND feed = ?) \
                     ) \
                     ON CONFLICT (id, feed) DO UPDATE SET \
                        title = excluded.title, link = excluded.link, updated = excluded.updated, \
                        author = excluded.author, published = excluded.published, \
                        summary = excluded.summary, content = excluded.content, \
                        enclosures = excluded.enclosures, feed_order = excluded.feed_order, \
                        data_hash = excluded.data_hash, \
                        data_hash_changed = excluded.data_hash_changed, \
                        last_updated = excluded.last_updated;",
                )
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .bind(&e.title)
                .bind(&e.link)
                .bind(e.updated.map(|d| d.naive_utc()))
                .bind(&e.author)
                .bind(e.published.map(|d| d.naive_utc()))
                .bind(&e.summary)
                .bind(content)
                .bind(enclosures)
                .bind(AddedBy::Feed.as_str())
                .bind(intent.first_updated.naive_utc())
                .bind(intent.first_updated_epoch.naive_utc())
                .bind(intent.feed_order)
                .bind(intent.recent_sort.naive_utc())
                .bind(intent.data_hash.clone())
                .bind(intent.data_hash_changed)
                .bind(intent.last_updated.naive_utc())
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .bind(e.id.as_ref())
                .bind(e.feed_url.as_ref())
                .execute(&mut *tx)
                .await
                .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
            }
            tx.commit().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        }
        Ok(())
    }

    pub async fn get_entry(&self, feed_url: &str, id: &str) -> Result<Entry, ReaderError> {
        let sql = format!("SELECT {ENTRY_COLUMN_LIST} FROM entries WHERE feed = ? AND id = ?;");
        let row = sqlx::query(&sql)
            .bind(feed_url)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
            .ok_or_else(|| ReaderError::Entry(EntryError::NotFound(feed_url.to_string(), id.to_string())))?;
        Ok(entry_factory(&row))
    }

    /// Sort-key expressions for [`EntrySort::Recent`], used both for
    /// `ORDER BY` and for resolving a `starting_after` cursor. [`EntrySort::Random`]
    /// has no stable keys, so it has no entry here — callers must not pass
    /// `starting_after` with it.
    fn sort_keys(sort: EntrySort) -> Option<(&'static [&'static str], bool)> {
        match sort {
            EntrySort::Recent => Some((
                &[
                    "recent_sort",
                    "coalesce(published, updated, first_updated)",
                    "feed",
                    "last_updated",
                    "(-feed_order)",
                    "id",
                ],
                true,
            )),
            EntrySort::Random => None,
        }
    }

    /// Resolves `starting_after`'s sort-key tuple for [`Self::sort_keys`],
    /// so a caller can page through `get_entries` by passing back the
    /// `(feed_url, id)` of the last entry it saw.
    async fn entry_sort_key(
        &self,
        feed_url: &str,
        id: &str,
        sort: EntrySort,
    ) -> Result<Vec<SqlValue>, ReaderError> {
        let (keys, _) = Self::sort_keys(sort)
            .expect("caller already rejected starting_after with an unsortable EntrySort");
        let sql = format!("SELECT {} FROM entries WHERE feed = ? AND id = ?;", keys.join(", "));
        let row = sqlx::query(&sql)
            .bind(feed_url)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
            .ok_or_else(|| ReaderError::Entry(EntryError::NotFound(feed_url.to_string(), id.to_string())))?;
        Ok(vec![
            SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(0).unwrap_or_default()),
            SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(1).unwrap_or_default()),
            SqlValue::Text(row.try_get::<String, _>(2).unwrap_or_default()),
            SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(3).unwrap_or_default()),
            SqlValue::Int(row.try_get::<i64, _>(4).unwrap_or(0)),
            SqlValue::Text(row.try_get::<String, _>(5).unwrap_or_default()),
        ])
    }

    /// Lists entries matching `filter` in `sort` order. `limit` caps the
    /// page size; `starting_after` (a `(feed_url, id)` pair) resumes after
    /// the last entry returned by a previous page. Combining `starting_after`
    /// with [`EntrySort::Random`] is rejected, since a random order has no
    /// stable cursor to resume from — matching `core.py`'s `ValueError` for
    /// `starting_after` with `sort='random'`.
    pub async fn get_entries(
        &self,
        filter: &EntryFilter,
        sort: EntrySort,
        limit: Option<i64>,
        starting_after: Option<(&str, &str)>,
    ) -> Result<Vec<Entry>, ReaderError> {
        if starting_after.is_some() && sort == EntrySort::Random {
            return Err(ReaderError::InvalidArgument(
                "starting_after is not supported with sort = random".to_string(),
            ));
        }

        let mut query = Query::new();
        select_entry_columns(&mut query);
        query.from_("entries");
        apply_entry_filter(&mut query, filter);

        match Self::sort_keys(sort) {
            Some((keys, desc)) => {
                query.scrolling_window_order_by(keys, desc);
            }
            None => {
                query.order_by("random()");
            }
        }

        if let Some((feed_url, id)) = starting_after {
            let cursor = self.entry_sort_key(feed_url, id, sort).await?;
            query.add_last(&cursor);
        }
        if let Some(limit) = limit {
            query.limit(limit.to_string());
        }

        let (sql, params) = query.render();
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = bind_value(q, p);
        }
        let rows = q
            .fetch_all(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(rows.iter().map(entry_factory).collect())
    }

    /// Total/read/important/unimportant/with-enclosures counts, plus
    /// average new-entries-per-day over the last 1/3/12 months, matching
    /// `_entries.py::get_entry_counts`.
    pub async fn get_entry_counts(&self, filter: &EntryFilter, now: DateTime<Utc>) -> Result<EntryCounts, ReaderError> {
        let mut query = Query::new();
        query
            .select("count(*)")
            .select("coalesce(sum(read == 1), 0)")
            .select("coalesce(sum(important == 1), 0)")
            .select("coalesce(sum(important == 0), 0)")
            .select("coalesce(sum(enclosures IS NOT NULL AND enclosures != '[]'), 0)")
            .from_("entries");
        apply_entry_filter(&mut query, filter);

        let (sql, params) = query.render();
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = bind_value(q, p);
        }
        let row = q
            .fetch_one(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        let averages = self.get_entry_averages(filter, now).await?;
        Ok(EntryCounts {
            total: row.try_get(0).unwrap_or(0),
            read: row.try_get(1).unwrap_or(0),
            important: row.try_get(2).unwrap_or(0),
            unimportant: row.try_get(3).unwrap_or(0),
            with_enclosures: row.try_get(4).unwrap_or(0),
            averages,
        })
    }

    async fn get_entry_averages(
        &self,
        filter: &EntryFilter,
        now: DateTime<Utc>,
    ) -> Result<(f64, f64, f64), ReaderError> {
        let mut out = [0.0_f64; 3];
        for (i, days) in [30, 91, 365].into_iter().enumerate() {
            let since = now - chrono::Duration::days(days);
            let mut query = Query::new();
            query.select("count(*)").from_("entries");
            apply_entry_filter(&mut query, filter);
            query.bind("__since", since.naive_utc());
            query.where_("first_updated >= :__since");

            let (sql, params) = query.render();
            let mut q = sqlx::query(&sql);
            for p in &params {
                q = bind_value(q, p);
            }
            let row = q
                .fetch_one(self.pool())
                .await
                .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
            let count: i64 = row.try_get(0).unwrap_or(0);
            out[i] = count as f64 / days as f64;
        }
        Ok((out[0], out[1], out[2]))
    }
}

fn to_utc(naive: chrono::NaiveDateTime) -> DateTime<Utc> {
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

fn bind_value<'q>(
    q: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    v: &'q SqlValue,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match v {
        SqlValue::Null => q.bind(None::<i64>),
        SqlValue::Int(i) => q.bind(*i),
        SqlValue::Real(r) => q.bind(*r),
        SqlValue::Text(s) => q.bind(s.as_str()),
        SqlValue::Blob(b) => q.bind(b.as_slice()),
        SqlValue::DateTime(dt) => q.bind(*dt),
    }
}

const ENTRY_COLUMN_LIST: &str = "feed, id, title, link, updated, author, published, summary, \
    content, enclosures, read, read_modified, important, important_modified, first_updated, \
    first_updated_epoch, last_updated, feed_order, recent_sort, original_feed, added_by, sequence";

fn select_entry_columns(query: &mut Query) {
    for col in ENTRY_COLUMN_LIST.split(", ") {
        query.select(col);
    }
}

fn entry_factory(row: &sqlx::sqlite::SqliteRow) -> Entry {
    let content: String = row.try_get(8).unwrap_or_default();
    let enclosures: String = row.try_get(9).unwrap_or_default();
    let important: Option<i64> = row.try_get(12).unwrap_or(None);
    let sequence: Option<Vec<u8>> = row.try_get(21).unwrap_or(None);
    let original_feed: Option<String> = row.try_get(19).unwrap_or(None);
    let added_by: String = row.try_get(20).unwrap_or_default();

    Entry {
        feed_url: row.try_get::<String, _>(0).unwrap_or_default().into(),
        id: row.try_get::<String, _>(1).unwrap_or_default().into(),
        title: row.try_get(2).unwrap_or(None),
        link: row.try_get(3).unwrap_or(None),
        updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(4).ok().flatten().map(to_utc),
        author: row.try_get(5).unwrap_or(None),
        published: row.try_get::<Option<chrono::NaiveDateTime>, _>(6).ok().flatten().map(to_utc),
        summary: row.try_get(7).unwrap_or(None),
        content: serde_json::from_str::<Vec<Content>>(&content).unwrap_or_default(),
        enclosures: serde_json::from_str::<Vec<Enclosure>>(&enclosures).unwrap_or_default(),
        read: row.try_get::<i64, _>(10).unwrap_or(0) != 0,
        read_modified: row.try_get::<Option<chrono::NaiveDateTime>, _>(11).ok().flatten().map(to_utc),
        important: TriState::from_db(important),
        important_modified: row.try_get::<Option<chrono::NaiveDateTime>, _>(13).ok().flatten().map(to_utc),
        first_updated: row.try_get::<chrono::NaiveDateTime, _>(14).map(to_utc).unwrap_or_else(|_| Utc::now()),
        first_updated_epoch: row.try_get::<chrono::NaiveDateTime, _>(15).map(to_utc).unwrap_or_else(|_| Utc::now()),
        last_updated: row.try_get::<chrono::NaiveDateTime, _>(16).map(to_utc).unwrap_or_else(|_| Utc::now()),
        feed_order: row.try_get(17).unwrap_or(0),
        recent_sort: row.try_get::<chrono::NaiveDateTime, _>(18).map(to_utc).unwrap_or_else(|_| Utc::now()),
        original_feed: original_feed.map(Into::into),
        added_by: AddedBy::from_str(&added_by),
        sequence: sequence.and_then(|s| {
            if s.len() == 16 {
                let mut arr = [0u8; 16];
                arr.copy_from_slice(&s);
                Some(arr)
            } else {
                None
            }
        }),
    }
}

/// Translates an [`EntryFilter`] into `WHERE` clauses: scalar fields plus
/// the DNF tag filter over `entry_tags`.
fn apply_entry_filter(query: &mut Query, filter: &EntryFilter) {
    if let Some(feed_url) = &filter.feed_url {
        query.bind("feed_url", feed_url.clone());
        query.where_("feed = :feed_url");
    }
    if let Some(entry_id) = &filter.entry_id {
        query.bind("entry_id", entry_id.clone());
        query.where_("id = :entry_id");
    }
    if let Some(read) = filter.read {
        query.where_(format!("read = {}", if read { 1 } else { 0 }));
    }
    if let Some(important) = filter.important {
        match important {
            FilterTriState::True => query.where_("important = 1"),
            FilterTriState::False => query.where_("important = 0"),
            FilterTriState::Unset => query.where_("important IS NULL"),
        };
    }
    if !filter.tags.is_empty() {
        query.with_("__entry_tags", "SELECT key FROM entry_tags WHERE id = entries.id AND feed = entries.feed");
        let mut clauses = Vec::new();
        for (ci, clause) in filter.tags.iter().enumerate() {
            let mut atoms = Vec::new();
            for (ai, atom) in clause.iter().enumerate() {
                match atom {
                    TagAtom::Bool(any) => {
                        let op = if *any { "EXISTS" } else { "NOT EXISTS" };
                        atoms.push(format!("{op} (SELECT * FROM __entry_tags)"));
                    }
                    TagAtom::Key { negated, name } => {
                        let param = format!("__tag_{ci}_{ai}");
                        query.bind(&param, name.clone());
                        let op = if *negated { "NOT IN" } else { "IN" };
                        atoms.push(format!(":{param} {op} (SELECT key FROM __entry_tags)"));
                    }
                }
            }
            clauses.push(format!("({})", atoms.join(" AND ")));
        }
        query.where_(format!("({})", clauses.join(" OR ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineConfig;

    async fn open_mem() -> Storage {
        Storage::open(":memory:", EngineConfig::default()).await.unwrap()
    }

    fn sample_entry(feed_url: &str, id: &str) -> EntryData {
        EntryData {
            feed_url: feed_url.into(),
            id: id.into(),
            title: Some("title".into()),
            link: None,
            updated: None,
            author: None,
            published: None,
            summary: None,
            content: vec![],
            enclosures: vec![],
        }
    }

    #[tokio::test]
    async fn add_entry_then_duplicate_fails_with_exists() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap();
        let err = storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap_err();
        assert!(matches!(err, ReaderError::Entry(EntryError::Exists(_, _))));
    }

    #[tokio::test]
    async fn set_entry_read_round_trips() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap();
        storage.set_entry_read("http://a", "e1", true, Some(Utc::now())).await.unwrap();
        let entry = storage.get_entry("http://a", "e1").await.unwrap();
        assert!(entry.read);
    }

    #[tokio::test]
    async fn delete_entries_checks_origin() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap();
        let err = storage
            .delete_entries(&[("http://a".to_string(), "e1".to_string())], Some(AddedBy::Feed))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Entry(EntryError::WrongOrigin(..))));
    }

    #[tokio::test]
    async fn get_entries_starting_after_resumes_the_page() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e2"), Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e3"), Utc::now()).await.unwrap();

        let first = storage
            .get_entries(&EntryFilter::default(), EntrySort::Recent, Some(2), None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let second = storage
            .get_entries(
                &EntryFilter::default(),
                EntrySort::Recent,
                None,
                Some((first[1].feed_url.as_ref(), first[1].id.as_ref())),
            )
            .await
            .unwrap();
        let seen: std::collections::HashSet<_> =
            first.iter().chain(second.iter()).map(|e| e.id.to_string()).collect();
        assert_eq!(seen.len(), 3);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn set_entry_read_on_missing_entry_raises_not_found() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        let err = storage.set_entry_read("http://a", "missing", true, None).await.unwrap_err();
        assert!(matches!(err, ReaderError::Entry(EntryError::NotFound(..))));
    }

    #[tokio::test]
    async fn get_entries_starting_after_rejects_random_sort() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_entry(&sample_entry("http://a", "e1"), Utc::now()).await.unwrap();
        let err = storage
            .get_entries(&EntryFilter::default(), EntrySort::Random, None, Some(("http://a", "e1")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::InvalidArgument(_)));
    }
}
