//! Feed CRUD, filtering, and the three `update_feed` write modes.
//!
//! Grounded on `_storage/_feeds.py`.

use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::db::rowcount_exactly_one;
use crate::error::{FeedError, ReaderError, StorageError};
use crate::sql::{Query, SqlValue};
use crate::types::{
    ExceptionInfo, Feed, FeedCounts, FeedFilter, FeedForUpdate, FeedSort, FeedUpdateIntent,
    TagAtom,
};

use super::Storage;

impl Storage {
    pub async fn add_feed(&self, url: &str, added: DateTime<Utc>) -> Result<(), ReaderError> {
        let result = sqlx::query("INSERT INTO feeds (url, added, updates_enabled) VALUES (?, ?, 1);")
            .bind(url)
            .bind(added.naive_utc())
            .execute(self.pool())
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.message().to_lowercase().contains("unique") => {
                Err(ReaderError::Feed(FeedError::Exists(url.to_string())))
            }
            Err(e) => Err(ReaderError::Storage(StorageError::Sqlx(e))),
        }
    }

    pub async fn delete_feed(&self, url: &str) -> Result<(), ReaderError> {
        let result = sqlx::query("DELETE FROM feeds WHERE url = ?;")
            .bind(url)
            .execute(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    /// Preserves entries & tags (via FK `ON UPDATE CASCADE`), resets
    /// caching/exception state, and records the previous URL in entries'
    /// `original_feed`.
    pub async fn change_feed_url(&self, old: &str, new: &str) -> Result<(), ReaderError> {
        let mut tx = self
            .pool()
            .begin()
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        let result = sqlx::query("UPDATE feeds SET url = ? WHERE url = ?;")
            .bind(new)
            .bind(old)
            .execute(&mut *tx)
            .await;
        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(e)) if e.message().to_lowercase().contains("unique") => {
                return Err(ReaderError::Feed(FeedError::Exists(new.to_string())));
            }
            Err(e) => return Err(ReaderError::Storage(StorageError::Sqlx(e))),
        };
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(old.to_string()))
        })?;

        sqlx::query(
            "UPDATE feeds SET updated = NULL, version = NULL, http_etag = NULL, \
             http_last_modified = NULL, stale = 0, last_updated = NULL, last_exception = NULL \
             WHERE url = ?;",
        )
        .bind(new)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        sqlx::query(
            "UPDATE entries SET original_feed = coalesce(original_feed, ?) WHERE feed = ?;",
        )
        .bind(old)
        .bind(new)
        .execute(&mut *tx)
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        tx.commit().await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(())
    }

    pub async fn set_feed_user_title(&self, url: &str, title: Option<&str>) -> Result<(), ReaderError> {
        let result = sqlx::query("UPDATE feeds SET user_title = ? WHERE url = ?;")
            .bind(title)
            .bind(url)
            .execute(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    pub async fn set_feed_updates_enabled(&self, url: &str, enabled: bool) -> Result<(), ReaderError> {
        let result = sqlx::query("UPDATE feeds SET updates_enabled = ? WHERE url = ?;")
            .bind(enabled)
            .bind(url)
            .execute(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    pub async fn set_feed_stale(&self, url: &str, stale: bool) -> Result<(), ReaderError> {
        let result = sqlx::query("UPDATE feeds SET stale = ? WHERE url = ?;")
            .bind(stale)
            .bind(url)
            .execute(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    pub async fn get_feed_counts(&self, filter: &FeedFilter) -> Result<FeedCounts, ReaderError> {
        let mut query = Query::new();
        query
            .select("count(*)")
            .select("coalesce(sum(last_exception IS NOT NULL), 0)")
            .select("coalesce(sum(updates_enabled == 1), 0)")
            .from_("feeds");
        apply_feed_filter(&mut query, filter);

        let (sql, params) = query.render();
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = bind_value(q, p);
        }
        let row = q
            .fetch_one(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(FeedCounts {
            total: row.try_get(0).unwrap_or(0),
            broken: row.try_get(1).unwrap_or(0),
            updates_enabled: row.try_get(2).unwrap_or(0),
        })
    }

    /// Three write modes, disambiguated by which optional fields are set:
    /// full rewrite, last-updated-only, or exception-only.
    pub async fn update_feed(&self, intent: &FeedUpdateIntent) -> Result<(), ReaderError> {
        if let Some(feed) = &intent.feed {
            assert_eq!(intent.url.as_ref(), feed.url.as_ref(), "updating feed URL not supported");
            assert!(intent.last_exception.is_none(), "last_exception must be none if feed is set");
            return self.update_feed_full(intent, feed.clone()).await;
        }

        assert!(intent.http_etag.is_none(), "http_etag must be none if feed is none");
        assert!(
            intent.http_last_modified.is_none(),
            "http_last_modified must be none if feed is none"
        );

        match &intent.last_exception {
            None => {
                let last_updated = intent
                    .last_updated
                    .expect("last_updated must be set if last_exception is none");
                self.update_feed_last_updated(&intent.url, last_updated).await
            }
            Some(exc) => {
                assert!(
                    intent.last_updated.is_none(),
                    "last_updated must not be set if last_exception is not none"
                );
                self.update_feed_last_exception(&intent.url, exc).await
            }
        }
    }

    async fn update_feed_full(
        &self,
        intent: &FeedUpdateIntent,
        feed: crate::types::FeedData,
    ) -> Result<(), ReaderError> {
        let data_hash = crate::hash::get_hash(&crate::hash::feed_hashable(&feed));
        let result = sqlx::query(
            "UPDATE feeds SET title = ?, link = ?, updated = ?, author = ?, subtitle = ?, \
             version = ?, http_etag = ?, http_last_modified = ?, data_hash = ?, stale = 0, \
             last_updated = ?, last_exception = NULL WHERE url = ?;",
        )
        .bind(&feed.title)
        .bind(&feed.link)
        .bind(feed.updated.map(|d| d.naive_utc()))
        .bind(&feed.author)
        .bind(&feed.subtitle)
        .bind(&feed.version)
        .bind(&intent.http_etag)
        .bind(&intent.http_last_modified)
        .bind(data_hash)
        .bind(intent.last_updated.map(|d| d.naive_utc()))
        .bind(intent.url.as_ref())
        .execute(self.pool())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(intent.url.to_string()))
        })
    }

    async fn update_feed_last_updated(
        &self,
        url: &str,
        last_updated: DateTime<Utc>,
    ) -> Result<(), ReaderError> {
        let result = sqlx::query(
            "UPDATE feeds SET last_updated = ?, last_exception = NULL WHERE url = ?;",
        )
        .bind(last_updated.naive_utc())
        .bind(url)
        .execute(self.pool())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    async fn update_feed_last_exception(
        &self,
        url: &str,
        exc: &ExceptionInfo,
    ) -> Result<(), ReaderError> {
        let json = serde_json::to_string(exc).expect("ExceptionInfo always serializes");
        let result = sqlx::query("UPDATE feeds SET last_exception = ? WHERE url = ?;")
            .bind(json)
            .bind(url)
            .execute(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        rowcount_exactly_one(result.rows_affected(), || {
            ReaderError::Feed(FeedError::NotFound(url.to_string()))
        })
    }

    /// Fetches the snapshot the decider needs for every feed matching
    /// `filter`.
    pub async fn get_feeds_for_update(
        &self,
        filter: &FeedFilter,
    ) -> Result<Vec<FeedForUpdate>, ReaderError> {
        let mut query = Query::new();
        query
            .select("url")
            .select("updated")
            .select("http_etag")
            .select("http_last_modified")
            .select("stale")
            .select("last_updated")
            .select("last_exception IS NOT NULL")
            .select("data_hash")
            .from_("feeds");
        apply_feed_filter(&mut query, filter);
        query.order_by("url ASC");

        let (sql, params) = query.render();
        let mut q = sqlx::query(&sql);
        for p in &params {
            q = bind_value(q, p);
        }
        let rows = q
            .fetch_all(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let url: String = row.try_get(0).unwrap_or_default();
            out.push(FeedForUpdate {
                url: url.into(),
                updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(1).ok().flatten().map(to_utc),
                http_etag: row.try_get(2).unwrap_or(None),
                http_last_modified: row.try_get(3).unwrap_or(None),
                stale: row.try_get::<i64, _>(4).unwrap_or(0) != 0,
                last_updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(5).ok().flatten().map(to_utc),
                last_exception: row.try_get::<i64, _>(6).unwrap_or(0) != 0,
                data_hash: row.try_get(7).unwrap_or(None),
            });
        }
        Ok(out)
    }

    pub async fn get_feed_for_update(&self, url: &str) -> Result<FeedForUpdate, ReaderError> {
        let filter = FeedFilter { url: Some(url.to_string()), ..Default::default() };
        let mut rows = self.get_feeds_for_update(&filter).await?;
        rows.pop().ok_or_else(|| ReaderError::Feed(FeedError::NotFound(url.to_string())))
    }

    pub async fn get_feed(&self, url: &str) -> Result<Feed, ReaderError> {
        let row = sqlx::query(
            "SELECT url, updated, title, link, author, subtitle, version, user_title, added, \
             last_updated, last_exception, updates_enabled FROM feeds WHERE url = ?;",
        )
        .bind(url)
        .fetch_optional(self.pool())
        .await
        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
        .ok_or_else(|| ReaderError::Feed(FeedError::NotFound(url.to_string())))?;

        let last_exception: Option<String> = row.try_get(10).unwrap_or(None);
        Ok(Feed {
            url: row.try_get::<String, _>(0).unwrap_or_default().into(),
            updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(1).ok().flatten().map(to_utc),
            title: row.try_get(2).unwrap_or(None),
            link: row.try_get(3).unwrap_or(None),
            author: row.try_get(4).unwrap_or(None),
            subtitle: row.try_get(5).unwrap_or(None),
            version: row.try_get(6).unwrap_or(None),
            user_title: row.try_get(7).unwrap_or(None),
            added: row.try_get::<chrono::NaiveDateTime, _>(8).map(to_utc).unwrap_or_else(|_| Utc::now()),
            last_updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(9).ok().flatten().map(to_utc),
            last_exception: last_exception.and_then(|s| serde_json::from_str(&s).ok()),
            updates_enabled: row.try_get::<i64, _>(11).unwrap_or(1) != 0,
        })
    }

    /// Sort-key expressions used both for `ORDER BY` and for resolving a
    /// `starting_after` cursor to a row-value tuple.
    fn feed_sort_keys(sort: FeedSort) -> (&'static [&'static str], bool) {
        match sort {
            FeedSort::Title => (&["lower(coalesce(user_title, title, ''))", "url"], false),
            FeedSort::Added => (&["added", "url"], true),
        }
    }

    /// Resolves `starting_after`'s sort-key tuple for [`Self::feed_sort_keys`],
    /// so a caller can page through `get_feeds` by passing back the URL of
    /// the last feed it saw.
    async fn feed_sort_key(&self, url: &str, sort: FeedSort) -> Result<Vec<SqlValue>, ReaderError> {
        let (keys, _) = Self::feed_sort_keys(sort);
        let sql = format!("SELECT {} FROM feeds WHERE url = ?;", keys.join(", "));
        let row = sqlx::query(&sql)
            .bind(url)
            .fetch_optional(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?
            .ok_or_else(|| ReaderError::Feed(FeedError::NotFound(url.to_string())))?;
        Ok(match sort {
            FeedSort::Title => vec![
                SqlValue::Text(row.try_get::<String, _>(0).unwrap_or_default()),
                SqlValue::Text(row.try_get::<String, _>(1).unwrap_or_default()),
            ],
            FeedSort::Added => vec![
                SqlValue::DateTime(row.try_get::<chrono::NaiveDateTime, _>(0).unwrap_or_default()),
                SqlValue::Text(row.try_get::<String, _>(1).unwrap_or_default()),
            ],
        })
    }

    /// Lists feeds matching `filter` in `sort` order. `limit` caps the page
    /// size; `starting_after` (a feed URL) resumes after the last feed
    /// returned by a previous page, the way `_storage/_feeds.py::get_feeds`
    /// resolves its `starting_after` argument via `get_feed_last`.
    pub async fn get_feeds(
        &self,
        filter: &FeedFilter,
        sort: FeedSort,
        limit: Option<i64>,
        starting_after: Option<&str>,
    ) -> Result<Vec<Feed>, ReaderError> {
        let mut query = Query::new();
        query
            .select("url")
            .select("updated")
            .select("title")
            .select("link")
            .select("author")
            .select("subtitle")
            .select("version")
            .select("user_title")
            .select("added")
            .select("last_updated")
            .select("last_exception")
            .select("updates_enabled")
            .from_("feeds");
        apply_feed_filter(&mut query, filter);

        let (keys, desc) = Self::feed_sort_keys(sort);
        query.scrolling_window_order_by(keys, desc);

        if let Some(url) = starting_after {
            let cursor = self.feed_sort_key(url, sort).await?;
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

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let last_exception: Option<String> = row.try_get(10).unwrap_or(None);
            out.push(Feed {
                url: row.try_get::<String, _>(0).unwrap_or_default().into(),
                updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(1).ok().flatten().map(to_utc),
                title: row.try_get(2).unwrap_or(None),
                link: row.try_get(3).unwrap_or(None),
                author: row.try_get(4).unwrap_or(None),
                subtitle: row.try_get(5).unwrap_or(None),
                version: row.try_get(6).unwrap_or(None),
                user_title: row.try_get(7).unwrap_or(None),
                added: row.try_get::<chrono::NaiveDateTime, _>(8).map(to_utc).unwrap_or_else(|_| Utc::now()),
                last_updated: row.try_get::<Option<chrono::NaiveDateTime>, _>(9).ok().flatten().map(to_utc),
                last_exception: last_exception.and_then(|s| serde_json::from_str(&s).ok()),
                updates_enabled: row.try_get::<i64, _>(11).unwrap_or(1) != 0,
            });
        }
        Ok(out)
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

/// Translates the DNF `tags` filter plus the scalar filter fields into
/// `WHERE` clauses, the way `_feeds.py`'s `feed_filter` does via
/// `feed_tags_filter` (`_tags.py`).
fn apply_feed_filter(query: &mut Query, filter: &FeedFilter) {
    if let Some(url) = &filter.url {
        query.bind("url", url.clone());
        query.where_("url = :url");
    }
    if !filter.tags.is_empty() {
        query.with_("__feed_tags", "SELECT key FROM feed_tags WHERE feed = feeds.url");
        let mut clauses = Vec::new();
        for (ci, clause) in filter.tags.iter().enumerate() {
            let mut atoms = Vec::new();
            for (ai, atom) in clause.iter().enumerate() {
                match atom {
                    TagAtom::Bool(any) => {
                        let op = if *any { "EXISTS" } else { "NOT EXISTS" };
                        atoms.push(format!("{op} (SELECT * FROM __feed_tags)"));
                    }
                    TagAtom::Key { negated, name } => {
                        let param = format!("__tag_{ci}_{ai}");
                        query.bind(&param, name.clone());
                        let op = if *negated { "NOT IN" } else { "IN" };
                        atoms.push(format!(":{param} {op} (SELECT key FROM __feed_tags)"));
                    }
                }
            }
            clauses.push(format!("({})", atoms.join(" AND ")));
        }
        query.where_(format!("({})", clauses.join(" OR ")));
    }
    if let Some(broken) = filter.broken {
        query.where_(format!("last_exception IS {} NULL", if broken { "NOT" } else { "" }));
    }
    if let Some(enabled) = filter.updates_enabled {
        query.where_(format!("{} updates_enabled", if enabled { "" } else { "NOT" }));
    }
    if let Some(new) = filter.new {
        query.where_(format!("last_updated IS {} NULL", if new { "" } else { "NOT" }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineConfig;

    async fn open_mem() -> Storage {
        Storage::open(":memory:", EngineConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn add_feed_then_duplicate_fails_with_exists() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        let err = storage.add_feed("http://a", Utc::now()).await.unwrap_err();
        assert!(matches!(err, ReaderError::Feed(FeedError::Exists(_))));
    }

    #[tokio::test]
    async fn delete_missing_feed_raises_not_found() {
        let storage = open_mem().await;
        let err = storage.delete_feed("http://missing").await.unwrap_err();
        assert!(matches!(err, ReaderError::Feed(FeedError::NotFound(_))));
    }

    #[tokio::test]
    async fn set_feed_stale_round_trips() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.set_feed_stale("http://a", true).await.unwrap();
        let f = storage.get_feed_for_update("http://a").await.unwrap();
        assert!(f.stale);
    }

    #[tokio::test]
    async fn a_full_feed_write_clears_the_stale_flag() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.set_feed_stale("http://a", true).await.unwrap();

        let intent = FeedUpdateIntent {
            url: "http://a".into(),
            last_updated: Some(Utc::now()),
            feed: Some(crate::types::FeedData {
                url: "http://a".into(),
                updated: None,
                title: Some("Feed A".into()),
                link: None,
                author: None,
                subtitle: None,
                version: None,
            }),
            http_etag: None,
            http_last_modified: None,
            last_exception: None,
        };
        storage.update_feed(&intent).await.unwrap();

        let f = storage.get_feed_for_update("http://a").await.unwrap();
        assert!(!f.stale);
    }

    #[tokio::test]
    async fn get_feeds_starting_after_resumes_the_page() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_feed("http://b", Utc::now()).await.unwrap();
        storage.add_feed("http://c", Utc::now()).await.unwrap();

        let first = storage
            .get_feeds(&FeedFilter::default(), FeedSort::Added, Some(2), None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].url.as_ref(), "http://a");
        assert_eq!(first[1].url.as_ref(), "http://b");

        let rest = storage
            .get_feeds(
                &FeedFilter::default(),
                FeedSort::Added,
                None,
                Some(first[1].url.as_ref()),
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].url.as_ref(), "http://c");
    }

    #[tokio::test]
    async fn get_feeds_starting_after_unknown_url_raises_not_found() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        let err = storage
            .get_feeds(&FeedFilter::default(), FeedSort::Added, None, Some("http://missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Feed(FeedError::NotFound(_))));
    }

    #[tokio::test]
    async fn change_feed_url_to_itself_is_accepted() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.change_feed_url("http://a", "http://a").await.unwrap();
        let feed = storage.get_feed("http://a").await.unwrap();
        assert_eq!(feed.url.as_ref(), "http://a");
    }

    #[tokio::test]
    async fn change_feed_url_to_an_existing_url_fails_with_exists() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.add_feed("http://b", Utc::now()).await.unwrap();
        let err = storage.change_feed_url("http://a", "http://b").await.unwrap_err();
        assert!(matches!(err, ReaderError::Feed(FeedError::Exists(_))));
    }

    #[tokio::test]
    async fn change_feed_url_to_unused_url_renames_and_resets_state() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        storage.set_feed_stale("http://a", true).await.unwrap();
        storage.change_feed_url("http://a", "http://new").await.unwrap();

        assert!(storage.get_feed("http://a").await.is_err());
        let f = storage.get_feed_for_update("http://new").await.unwrap();
        assert!(!f.stale);
    }
}
