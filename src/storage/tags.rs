//! Generic key/value tags attached to the global scope, a feed, or an
//! entry.
//!
//! Grounded on `_storage/_tags.py`'s `TagsMixin`: one mixin dispatching on
//! resource arity (0/1/2 ids) to the matching table, rather than three
//! near-identical copies.

use sqlx::Row;

use crate::error::{EntryError, FeedError, ReaderError, StorageError};
use crate::types::{JsonValue, ResourceId};

use super::Storage;

/// Resolves table name, id columns, and their bound values for a resource.
fn resource_table(resource: &ResourceId) -> (&'static str, Vec<(&'static str, String)>) {
    match resource {
        ResourceId::Global => ("global_tags", vec![]),
        ResourceId::Feed(url) => ("feed_tags", vec![("feed", url.to_string())]),
        ResourceId::Entry(feed_url, id) => {
            ("entry_tags", vec![("feed", feed_url.to_string()), ("id", id.to_string())])
        }
    }
}

fn not_found(resource: &ResourceId) -> ReaderError {
    match resource {
        ResourceId::Global => ReaderError::Storage(StorageError::Other("no such resource".into())),
        ResourceId::Feed(url) => ReaderError::Feed(FeedError::NotFound(url.to_string())),
        ResourceId::Entry(feed_url, id) => {
            ReaderError::Entry(EntryError::NotFound(feed_url.to_string(), id.to_string()))
        }
    }
}

impl Storage {
    /// Lists `(key, value)` pairs for `resource`, optionally restricted to
    /// a single `key`.
    pub async fn get_tags(
        &self,
        resource: &ResourceId,
        key: Option<&str>,
    ) -> Result<Vec<(String, JsonValue)>, ReaderError> {
        let (table, ids) = resource_table(resource);
        let mut sql = format!("SELECT key, value FROM {table}");
        let mut conds: Vec<String> = ids.iter().map(|(col, _)| format!("{col} = ?")).collect();
        if key.is_some() {
            conds.push("key = ?".to_string());
        }
        if !conds.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conds.join(" AND "));
        }
        sql.push_str(" ORDER BY key;");

        let mut q = sqlx::query(&sql);
        for (_, v) in &ids {
            q = q.bind(v.clone());
        }
        if let Some(k) = key {
            q = q.bind(k);
        }

        let rows = q
            .fetch_all(self.pool())
            .await
            .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let k: String = row.try_get(0).unwrap_or_default();
            let v: String = row.try_get(1).unwrap_or_else(|_| "null".to_string());
            out.push((k, serde_json::from_str(&v).unwrap_or(JsonValue::Null)));
        }
        Ok(out)
    }

    /// Upserts one `(key, value)` pair on `resource`. `value` defaults to
    /// JSON `null` when omitted, matching the column default.
    pub async fn set_tag(
        &self,
        resource: &ResourceId,
        key: &str,
        value: Option<&JsonValue>,
    ) -> Result<(), ReaderError> {
        self.require_resource_exists(resource).await?;
        let (table, ids) = resource_table(resource);
        let value_json = value.map(|v| v.to_string()).unwrap_or_else(|| "null".to_string());

        let cols: Vec<&str> = ids.iter().map(|(c, _)| *c).chain(["key", "value"]).collect();
        let placeholders = vec!["?"; cols.len()].join(", ");
        let conflict_cols = ids.iter().map(|(c, _)| *c).chain(["key"]).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders}) \
             ON CONFLICT ({conflict_cols}) DO UPDATE SET value = excluded.value;",
            cols.join(", "),
        );

        let mut q = sqlx::query(&sql);
        for (_, v) in &ids {
            q = q.bind(v.clone());
        }
        q = q.bind(key).bind(value_json);
        q.execute(self.pool()).await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        Ok(())
    }

    pub async fn delete_tag(&self, resource: &ResourceId, key: &str) -> Result<(), ReaderError> {
        let (table, ids) = resource_table(resource);
        let mut conds: Vec<String> = ids.iter().map(|(col, _)| format!("{col} = ?")).collect();
        conds.push("key = ?".to_string());
        let sql = format!("DELETE FROM {table} WHERE {};", conds.join(" AND "));

        let mut q = sqlx::query(&sql);
        for (_, v) in &ids {
            q = q.bind(v.clone());
        }
        q = q.bind(key);
        let result = q.execute(self.pool()).await.map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::TagNotFound {
                resource: format!("{resource:?}"),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    async fn require_resource_exists(&self, resource: &ResourceId) -> Result<(), ReaderError> {
        match resource {
            ResourceId::Global => Ok(()),
            ResourceId::Feed(url) => {
                let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE url = ?;")
                    .bind(url.as_ref())
                    .fetch_optional(self.pool())
                    .await
                    .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
                row.map(|_| ()).ok_or_else(|| not_found(resource))
            }
            ResourceId::Entry(feed_url, id) => {
                let row: Option<(i64,)> =
                    sqlx::query_as("SELECT 1 FROM entries WHERE feed = ? AND id = ?;")
                        .bind(feed_url.as_ref())
                        .bind(id.as_ref())
                        .fetch_optional(self.pool())
                        .await
                        .map_err(|e| ReaderError::Storage(StorageError::Sqlx(e)))?;
                row.map(|_| ()).ok_or_else(|| not_found(resource))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineConfig;
    use chrono::Utc;
    use serde_json::json;

    async fn open_mem() -> Storage {
        Storage::open(":memory:", EngineConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn set_and_get_global_tag() {
        let storage = open_mem().await;
        storage.set_tag(&ResourceId::Global, "theme", Some(&json!("dark"))).await.unwrap();
        let tags = storage.get_tags(&ResourceId::Global, None).await.unwrap();
        assert_eq!(tags, vec![("theme".to_string(), json!("dark"))]);
    }

    #[tokio::test]
    async fn set_tag_on_missing_feed_fails() {
        let storage = open_mem().await;
        let err = storage
            .set_tag(&ResourceId::Feed("http://a".into()), "k", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Feed(FeedError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_missing_tag_raises_tag_not_found() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        let err = storage
            .delete_tag(&ResourceId::Feed("http://a".into()), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::TagNotFound { .. }));
    }

    #[tokio::test]
    async fn set_tag_upserts_value() {
        let storage = open_mem().await;
        storage.add_feed("http://a", Utc::now()).await.unwrap();
        let r = ResourceId::Feed("http://a".into());
        storage.set_tag(&r, "k", Some(&json!(1))).await.unwrap();
        storage.set_tag(&r, "k", Some(&json!(2))).await.unwrap();
        let tags = storage.get_tags(&r, None).await.unwrap();
        assert_eq!(tags, vec![("k".to_string(), json!(2))]);
    }
}
