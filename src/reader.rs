//! Public facade: owns storage, search, the parser, and the hook registry,
//! and validates caller-supplied arguments before delegating.
//!
//! Grounded on `core.py`/`reader.py`'s `Reader` class: one object per open
//! database, argument validation (`limit`, `sort`, `starting_after`) lives
//! here rather than in the storage layer, and the reserved-name scheme
//! (`make_reader_reserved_name`/`make_plugin_reserved_name`) is exposed for
//! plugins to namespace their own tags.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::db::EngineConfig;
use crate::error::ReaderError;
use crate::hooks::Hooks;
use crate::parser::Parser;
use crate::storage::Storage;
use crate::types::{
    AddedBy, Cadence, Entry, EntryCounts, EntryData, EntryFilter, EntrySearchResult,
    EntrySearchSort, EntrySort, EntryUpdateStatus, Feed, FeedCounts, FeedFilter, FeedSort,
    JsonValue, ResourceId, TriState, UpdateOutcome, UpdateResult,
};

/// `(reader_prefix, plugin_prefix, separator)` used to namespace tag keys
/// reserved for the engine itself or for plugins, matching `core.py`'s
/// `make_reader_reserved_name`/`make_plugin_reserved_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedNameScheme {
    pub reader_prefix: String,
    pub plugin_prefix: String,
    pub separator: String,
}

impl Default for ReservedNameScheme {
    fn default() -> Self {
        ReservedNameScheme {
            reader_prefix: ".reader.".to_string(),
            plugin_prefix: ".plugin.".to_string(),
            separator: ".".to_string(),
        }
    }
}

impl ReservedNameScheme {
    pub fn make_reader_reserved_name(&self, key: &str) -> String {
        format!("{}{key}", self.reader_prefix)
    }

    /// `key = None` names the plugin itself (e.g. an enabled-plugins list
    /// entry); `Some(key)` names one of its own tag keys.
    pub fn make_plugin_reserved_name(&self, plugin: &str, key: Option<&str>) -> String {
        match key {
            Some(key) => format!("{}{plugin}{}{key}", self.plugin_prefix, self.separator),
            None => format!("{}{plugin}", self.plugin_prefix),
        }
    }
}

fn validate_limit(limit: Option<i64>) -> Result<(), ReaderError> {
    match limit {
        Some(limit) if limit <= 0 => {
            Err(ReaderError::InvalidArgument(format!("limit must be positive, got {limit}")))
        }
        _ => Ok(()),
    }
}

/// Rejects `starting_after` combined with a sort that has no stable
/// row-value tuple to resume from. The storage layer enforces this too;
/// checking again here means the error is raised before any query runs,
/// matching the facade's "validate, then delegate" contract.
fn validate_entry_pagination(sort: EntrySort, starting_after: Option<(&str, &str)>) -> Result<(), ReaderError> {
    if starting_after.is_some() && sort == EntrySort::Random {
        return Err(ReaderError::InvalidArgument(
            "starting_after is not supported with sort = random".to_string(),
        ));
    }
    Ok(())
}

fn parse_cadence_tag(tags: &[(String, JsonValue)]) -> Option<Cadence> {
    let (_, value) = tags.first()?;
    let interval_minutes = value.get("interval")?.as_i64()?;
    let jitter = value.get("jitter").and_then(|j| j.as_f64()).unwrap_or(0.0);
    Some(Cadence { interval_minutes, jitter })
}

/// Owns one [`Storage`], one parser, and a hook registry; every public
/// method validates its arguments before touching storage.
pub struct Reader {
    storage: Storage,
    parser: Arc<dyn Parser + Sync>,
    hooks: RwLock<Hooks>,
    names: ReservedNameScheme,
}

impl Reader {
    pub async fn open(path: &str, config: EngineConfig, parser: Arc<dyn Parser + Sync>) -> Result<Self, ReaderError> {
        let search_enabled_by_default = config.search_enabled_by_default;
        let storage = Storage::open(path, config).await?;
        if search_enabled_by_default {
            crate::search::enable(&storage).await?;
        }
        Ok(Reader {
            storage,
            parser,
            hooks: RwLock::new(Hooks::new()),
            names: ReservedNameScheme::default(),
        })
    }

    pub fn reserved_names(&self) -> &ReservedNameScheme {
        &self.names
    }

    // -- feeds ------------------------------------------------------------

    pub async fn add_feed(&self, url: &str) -> Result<(), ReaderError> {
        self.storage.add_feed(url, Utc::now()).await
    }

    pub async fn delete_feed(&self, url: &str) -> Result<(), ReaderError> {
        self.storage.delete_feed(url).await
    }

    pub async fn change_feed_url(&self, old: &str, new: &str) -> Result<(), ReaderError> {
        self.storage.change_feed_url(old, new).await
    }

    pub async fn set_feed_user_title(&self, url: &str, title: Option<&str>) -> Result<(), ReaderError> {
        self.storage.set_feed_user_title(url, title).await
    }

    pub async fn set_feed_updates_enabled(&self, url: &str, enabled: bool) -> Result<(), ReaderError> {
        self.storage.set_feed_updates_enabled(url, enabled).await
    }

    pub async fn set_feed_stale(&self, url: &str, stale: bool) -> Result<(), ReaderError> {
        self.storage.set_feed_stale(url, stale).await
    }

    pub async fn get_feed(&self, url: &str) -> Result<Feed, ReaderError> {
        self.storage.get_feed(url).await
    }

    pub async fn get_feeds(
        &self,
        filter: &FeedFilter,
        sort: FeedSort,
        limit: Option<i64>,
        starting_after: Option<&str>,
    ) -> Result<Vec<Feed>, ReaderError> {
        validate_limit(limit)?;
        self.storage.get_feeds(filter, sort, limit, starting_after).await
    }

    pub async fn get_feed_counts(&self, filter: &FeedFilter) -> Result<FeedCounts, ReaderError> {
        self.storage.get_feed_counts(filter).await
    }

    // -- entries ------------------------------------------------------------

    pub async fn add_entry(&self, entry: &EntryData) -> Result<(), ReaderError> {
        self.storage.add_entry(entry, Utc::now()).await
    }

    pub async fn delete_entries(
        &self,
        entries: &[(String, String)],
        expected_origin: Option<AddedBy>,
    ) -> Result<(), ReaderError> {
        self.storage.delete_entries(entries, expected_origin).await
    }

    pub async fn set_entry_read(
        &self,
        feed_url: &str,
        id: &str,
        read: bool,
        modified: Option<DateTime<Utc>>,
    ) -> Result<(), ReaderError> {
        self.storage.set_entry_read(feed_url, id, read, modified).await
    }

    pub async fn set_entry_important(
        &self,
        feed_url: &str,
        id: &str,
        important: TriState,
        modified: Option<DateTime<Utc>>,
    ) -> Result<(), ReaderError> {
        self.storage.set_entry_important(feed_url, id, important, modified).await
    }

    pub async fn get_entry(&self, feed_url: &str, id: &str) -> Result<Entry, ReaderError> {
        self.storage.get_entry(feed_url, id).await
    }

    pub async fn get_entries(
        &self,
        filter: &EntryFilter,
        sort: EntrySort,
        limit: Option<i64>,
        starting_after: Option<(&str, &str)>,
    ) -> Result<Vec<Entry>, ReaderError> {
        validate_limit(limit)?;
        validate_entry_pagination(sort, starting_after)?;
        self.storage.get_entries(filter, sort, limit, starting_after).await
    }

    pub async fn get_entry_counts(&self, filter: &EntryFilter, now: DateTime<Utc>) -> Result<EntryCounts, ReaderError> {
        self.storage.get_entry_counts(filter, now).await
    }

    // -- tags ------------------------------------------------------------

    pub async fn get_tags(&self, resource: &ResourceId, key: Option<&str>) -> Result<Vec<(String, JsonValue)>, ReaderError> {
        self.storage.get_tags(resource, key).await
    }

    pub async fn set_tag(&self, resource: &ResourceId, key: &str, value: Option<&JsonValue>) -> Result<(), ReaderError> {
        self.storage.set_tag(resource, key, value).await
    }

    pub async fn delete_tag(&self, resource: &ResourceId, key: &str) -> Result<(), ReaderError> {
        self.storage.delete_tag(resource, key).await
    }

    // -- search ------------------------------------------------------------

    pub async fn enable_search(&self) -> Result<(), ReaderError> {
        crate::search::enable(&self.storage).await
    }

    pub async fn disable_search(&self) -> Result<(), ReaderError> {
        crate::search::disable(&self.storage).await
    }

    pub async fn is_search_enabled(&self) -> Result<bool, ReaderError> {
        crate::search::is_enabled(self.storage.pool()).await
    }

    pub async fn update_search(&self) -> Result<(), ReaderError> {
        crate::search::update(&self.storage).await
    }

    pub async fn search_entries(
        &self,
        query: &str,
        filter: &EntryFilter,
        sort: EntrySearchSort,
        limit: Option<i64>,
    ) -> Result<Vec<EntrySearchResult>, ReaderError> {
        validate_limit(limit)?;
        crate::search::search_entries(&self.storage, query, filter, sort, limit).await
    }

    // -- update ------------------------------------------------------------

    /// Resolves the cadence to use: the `.reader.update` tag on the feed (if
    /// `url` is given and the tag is set), falling back to the same tag on
    /// the global scope, falling back to the engine's configured default.
    /// Due-ness filtering (whether a feed's next scheduled update has
    /// actually arrived) is left entirely to the caller — this crate has no
    /// built-in scheduler, matching the source's external-scheduling model.
    async fn resolve_cadence(&self, url: Option<&str>) -> Result<Cadence, ReaderError> {
        let key = self.names.make_reader_reserved_name("update");
        let default = Cadence {
            interval_minutes: self.storage.db.config.default_interval_minutes,
            jitter: self.storage.db.config.default_jitter,
        };

        let global_tags = self.storage.get_tags(&ResourceId::Global, Some(&key)).await?;
        let mut cadence = parse_cadence_tag(&global_tags).unwrap_or(default);

        if let Some(url) = url {
            let feed_tags = self.storage.get_tags(&ResourceId::Feed(url.into()), Some(&key)).await?;
            if let Some(override_cadence) = parse_cadence_tag(&feed_tags) {
                cadence = override_cadence;
            }
        }
        Ok(cadence)
    }

    pub async fn update_feed(&self, url: &str) -> Result<UpdateOutcome, ReaderError> {
        let cadence = self.resolve_cadence(Some(url)).await?;
        let hooks = self.hooks.read().unwrap().clone();
        let now = Utc::now();
        crate::update::update_feed(&self.storage, self.parser.as_ref(), &hooks, url, cadence, now).await
    }

    pub async fn update_feeds(&self, filter: &FeedFilter) -> Result<Vec<UpdateResult>, ReaderError> {
        let cadence = self.resolve_cadence(None).await?;
        let hooks = self.hooks.read().unwrap().clone();
        let now = Utc::now();
        crate::update::update_feeds(&self.storage, self.parser.as_ref(), &hooks, filter, cadence, now).await
    }

    // -- hooks ------------------------------------------------------------

    pub fn on_before_feeds_update(&self, f: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().unwrap().on_before_feeds_update(f);
    }

    pub fn on_before_feed_update(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.write().unwrap().on_before_feed_update(f);
    }

    pub fn on_after_feed_update(&self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.write().unwrap().on_after_feed_update(f);
    }

    pub fn on_after_entry_update(&self, f: impl Fn(&Entry, EntryUpdateStatus) + Send + Sync + 'static) {
        self.hooks.write().unwrap().on_after_entry_update(f);
    }

    pub fn on_after_feeds_update(&self, f: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().unwrap().on_after_feeds_update(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decide::ParseOutcome;
    use crate::parser::ScriptedParser;
    use crate::types::{Content, FeedData};
    use serde_json::json;

    async fn open_reader() -> (Reader, Arc<ScriptedParser>) {
        let parser = Arc::new(ScriptedParser::new());
        let reader = Reader::open(":memory:", EngineConfig::default(), parser.clone())
            .await
            .unwrap();
        (reader, parser)
    }

    #[test]
    fn default_reserved_name_scheme_matches_dotted_convention() {
        let names = ReservedNameScheme::default();
        assert_eq!(names.make_reader_reserved_name("update"), ".reader.update");
        assert_eq!(names.make_plugin_reserved_name("dedupe", Some("once")), ".plugin.dedupe.once");
        assert_eq!(names.make_plugin_reserved_name("dedupe", None), ".plugin.dedupe");
    }

    #[tokio::test]
    async fn get_feeds_rejects_non_positive_limit() {
        let (reader, _parser) = open_reader().await;
        let err = reader
            .get_feeds(&FeedFilter::default(), FeedSort::Added, Some(0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn get_entries_rejects_starting_after_with_random_sort() {
        let (reader, _parser) = open_reader().await;
        let err = reader
            .get_entries(&EntryFilter::default(), EntrySort::Random, None, Some(("u", "e")))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn update_feed_uses_global_cadence_tag_override() {
        let (reader, parser) = open_reader().await;
        reader.add_feed("http://a").await.unwrap();
        reader
            .set_tag(&ResourceId::Global, ".reader.update", Some(&json!({"interval": 15, "jitter": 0.0})))
            .await
            .unwrap();

        parser.script(
            "http://a",
            ParseOutcome::Parsed {
                feed: FeedData {
                    url: "http://a".into(),
                    updated: None,
                    title: Some("Feed A".into()),
                    link: None,
                    author: None,
                    subtitle: None,
                    version: None,
                },
                entries: vec![EntryData {
                    feed_url: "http://a".into(),
                    id: "e1".into(),
                    title: Some("Entry 1".into()),
                    link: None,
                    updated: None,
                    author: None,
                    published: None,
                    summary: None,
                    content: vec![Content { value: Some("hi".into()), mime_type: None, language: None }],
                    enclosures: vec![],
                }],
                http_etag: None,
                http_last_modified: None,
                retry_after: None,
            },
        );

        let outcome = reader.update_feed("http://a").await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::Updated(_)));
        let entry = reader.get_entry("http://a", "e1").await.unwrap();
        assert_eq!(entry.title.as_deref(), Some("Entry 1"));
    }

    #[tokio::test]
    async fn hooks_registered_through_the_facade_run_during_update() {
        let (reader, parser) = open_reader().await;
        reader.add_feed("http://a").await.unwrap();
        parser.script(
            "http://a",
            ParseOutcome::NotModified { http_etag: None, http_last_modified: None },
        );

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        reader.on_before_feed_update(move |url| seen2.lock().unwrap().push(url.to_string()));

        reader.update_feed("http://a").await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["http://a".to_string()]);
    }

    #[tokio::test]
    async fn search_round_trips_through_the_facade() {
        let (reader, _parser) = open_reader().await;
        reader.add_feed("http://a").await.unwrap();
        reader.enable_search().await.unwrap();
        reader
            .add_entry(&EntryData {
                feed_url: "http://a".into(),
                id: "e1".into(),
                title: Some("hello reader".into()),
                link: None,
                updated: None,
                author: None,
                published: None,
                summary: None,
                content: vec![],
                enclosures: vec![],
            })
            .await
            .unwrap();
        reader.update_search().await.unwrap();

        let results = reader
            .search_entries("hello", &EntryFilter::default(), EntrySearchSort::Relevant, None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
