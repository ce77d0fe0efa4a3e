//! Data model: the public record types, sorts, filters and update intents.
//!
//! Field names and grouping follow `_types.py`/`types.py`/`_feeds.py`
//! row factories; `Arc<str>` is used for frequently-cloned strings
//! (urls, ids) the way the teacher's `storage/types.rs` uses it for
//! `Feed`/`Article` titles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A syndication resource identified by a URL; contains entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub url: Arc<str>,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
    pub user_title: Option<String>,
    pub added: DateTime<Utc>,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_exception: Option<ExceptionInfo>,
    pub updates_enabled: bool,
}

/// Content value attached to an entry (feed-provided body).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub value: Option<String>,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type")]
    pub mime_type: Option<String>,
    pub length: Option<i64>,
}

/// Tri-state importance: unset / true / false.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    Unset,
    True,
    False,
}

impl TriState {
    pub fn to_db(self) -> Option<i64> {
        match self {
            TriState::Unset => None,
            TriState::True => Some(1),
            TriState::False => Some(0),
        }
    }

    pub fn from_db(v: Option<i64>) -> Self {
        match v {
            None => TriState::Unset,
            Some(0) => TriState::False,
            Some(_) => TriState::True,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddedBy {
    Feed,
    User,
}

impl AddedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            AddedBy::Feed => "feed",
            AddedBy::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "user" => AddedBy::User,
            _ => AddedBy::Feed,
        }
    }
}

/// An item in a feed, uniquely identified by `(feed_url, entry_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub feed_url: Arc<str>,
    pub id: Arc<str>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
    pub read: bool,
    pub read_modified: Option<DateTime<Utc>>,
    pub important: TriState,
    pub important_modified: Option<DateTime<Utc>>,
    pub first_updated: DateTime<Utc>,
    pub first_updated_epoch: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub feed_order: i64,
    pub recent_sort: DateTime<Utc>,
    pub original_feed: Option<Arc<str>>,
    pub added_by: AddedBy,
    pub sequence: Option<[u8; 16]>,
}

/// A `(key, JSON value)` pair attached to a resource.
pub type JsonValue = serde_json::Value;

/// Identifies the resource a tag/change is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceId {
    Global,
    Feed(Arc<str>),
    Entry(Arc<str>, Arc<str>),
}

/// Serialized snapshot of an exception, stored as JSON on the feed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub message: String,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub traceback: Option<String>,
}

/// One row of the append-only change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub sequence: [u8; 16],
    pub feed_url: Arc<str>,
    pub id: Arc<str>,
    pub key: String,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Insert = 1,
    Delete = 2,
}

impl Action {
    pub fn from_db(v: i64) -> Self {
        if v == Action::Delete as i64 {
            Action::Delete
        } else {
            Action::Insert
        }
    }
}

// ---------------------------------------------------------------------
// Update-pipeline plumbing types
// ---------------------------------------------------------------------

/// Snapshot of a stored feed as seen by the decider, before a new parse.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForUpdate {
    pub url: Arc<str>,
    pub updated: Option<DateTime<Utc>>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub last_exception: bool,
    pub data_hash: Option<Vec<u8>>,
}

/// Snapshot of a stored entry as seen by the decider.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryForUpdate {
    pub updated: Option<DateTime<Utc>>,
    pub published: Option<DateTime<Utc>>,
    pub data_hash: Option<Vec<u8>>,
    pub data_hash_changed: i64,
    pub recent_sort: DateTime<Utc>,
}

/// Freshly retrieved & parsed feed-level data (parser output).
#[derive(Debug, Clone, PartialEq)]
pub struct FeedData {
    pub url: Arc<str>,
    pub updated: Option<DateTime<Utc>>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
}

/// Freshly retrieved & parsed entry-level data.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryData {
    pub feed_url: Arc<str>,
    pub id: Arc<str>,
    pub title: Option<String>,
    pub link: Option<String>,
    pub updated: Option<DateTime<Utc>>,
    pub author: Option<String>,
    pub published: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub content: Vec<Content>,
    pub enclosures: Vec<Enclosure>,
}

/// What the decider decided to write for a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdateIntent {
    pub url: Arc<str>,
    pub last_updated: Option<DateTime<Utc>>,
    pub feed: Option<FeedData>,
    pub http_etag: Option<String>,
    pub http_last_modified: Option<String>,
    pub last_exception: Option<ExceptionInfo>,
}

/// What the decider decided to write for one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryUpdateIntent {
    pub entry: EntryData,
    pub last_updated: DateTime<Utc>,
    pub first_updated: DateTime<Utc>,
    pub first_updated_epoch: DateTime<Utc>,
    pub recent_sort: DateTime<Utc>,
    pub feed_order: i64,
    pub data_hash: Option<Vec<u8>>,
    pub data_hash_changed: i64,
    pub added_by: AddedBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryUpdateStatus {
    New,
    Modified,
}

/// Outcome of updating a single feed.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatedFeed {
    pub new: u64,
    pub modified: u64,
    pub unmodified: u64,
}

/// Per-feed result of an `update_feeds` batch.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateResult {
    pub url: Arc<str>,
    pub value: UpdateOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated(UpdatedFeed),
    NotModified,
    Error(String),
}

// ---------------------------------------------------------------------
// Sorts & filters
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSort {
    Title,
    Added,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySort {
    Recent,
    Random,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySearchSort {
    Relevant,
    Recent,
    Random,
}

/// DNF tag filter atom: `true`/`false` mean "has any tag" / "has no tag";
/// `Key` matches (optionally negated) a specific tag name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagAtom {
    Bool(bool),
    Key { negated: bool, name: String },
}

/// Disjunctive-normal-form tag filter: `Vec<Vec<TagAtom>>`, OR of ANDs.
pub type TagFilter = Vec<Vec<TagAtom>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedFilter {
    pub url: Option<String>,
    pub tags: TagFilter,
    pub broken: Option<bool>,
    pub updates_enabled: Option<bool>,
    pub new: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub feed_url: Option<String>,
    pub entry_id: Option<String>,
    pub read: Option<bool>,
    pub important: Option<FilterTriState>,
    pub tags: TagFilter,
}

/// Filter-friendly tri-state: distinct from [`TriState`] because a filter
/// needs to express "don't care" in addition to the three DB states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTriState {
    True,
    False,
    Unset,
}

/// Update cadence: minutes between retrievals, plus jitter fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cadence {
    pub interval_minutes: i64,
    pub jitter: f64,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence {
            interval_minutes: 60,
            jitter: 0.0,
        }
    }
}

/// Entry counts as returned by `get_entry_counts`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntryCounts {
    pub total: i64,
    pub read: i64,
    pub important: i64,
    pub unimportant: i64,
    pub with_enclosures: i64,
    pub averages: (f64, f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedCounts {
    pub total: i64,
    pub broken: i64,
    pub updates_enabled: i64,
}

// ---------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------

/// A string with zero or more non-overlapping highlighted byte ranges,
/// recovered from FTS5 `snippet()` output wrapped in marker sentinels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HighlightedString {
    pub value: String,
    pub highlights: Vec<std::ops::Range<usize>>,
}

impl HighlightedString {
    /// Parses `text`, which has highlighted runs delimited by `before`/
    /// `after` markers, into a plain value plus the byte ranges those runs
    /// occupy in it.
    pub fn extract(text: &str, before: &str, after: &str) -> Self {
        let mut value = String::with_capacity(text.len());
        let mut highlights = Vec::new();
        let mut start: Option<usize> = None;
        let mut rest = text;

        loop {
            let before_pos = rest.find(before);
            let after_pos = rest.find(after);
            match (before_pos, after_pos) {
                (Some(b), Some(a)) if b < a => {
                    value.push_str(&rest[..b]);
                    start = Some(value.len());
                    rest = &rest[b + before.len()..];
                }
                (_, Some(a)) => {
                    value.push_str(&rest[..a]);
                    if let Some(s) = start.take() {
                        highlights.push(s..value.len());
                    }
                    rest = &rest[a + after.len()..];
                }
                (Some(b), None) => {
                    value.push_str(&rest[..b]);
                    start = Some(value.len());
                    rest = &rest[b + before.len()..];
                }
                (None, None) => {
                    value.push_str(rest);
                    break;
                }
            }
        }

        HighlightedString { value, highlights }
    }

    /// Inverse of [`HighlightedString::extract`]: re-wraps each highlighted
    /// range in `before`/`after` markers, recovering the original marked-up
    /// text.
    pub fn apply(&self, before: &str, after: &str) -> String {
        let mut out = String::with_capacity(self.value.len() + self.highlights.len() * (before.len() + after.len()));
        let mut pos = 0;
        for range in &self.highlights {
            out.push_str(&self.value[pos..range.start]);
            out.push_str(before);
            out.push_str(&self.value[range.start..range.end]);
            out.push_str(after);
            pos = range.end;
        }
        out.push_str(&self.value[pos..]);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_then_apply_round_trips_a_single_highlight() {
        let input = "a >>hello<< world";
        let h = HighlightedString::extract(input, ">>", "<<");
        assert_eq!(h.value, "a hello world");
        assert_eq!(h.apply(">>", "<<"), input);
    }

    #[test]
    fn extract_then_apply_round_trips_multiple_highlights() {
        let input = ">>foo<< bar >>baz<<";
        let h = HighlightedString::extract(input, ">>", "<<");
        assert_eq!(h.apply(">>", "<<"), input);
    }

    #[test]
    fn extract_with_no_markers_round_trips_unchanged() {
        let input = "plain text, no markers";
        let h = HighlightedString::extract(input, ">>", "<<");
        assert!(h.highlights.is_empty());
        assert_eq!(h.apply(">>", "<<"), input);
    }
}

/// One search hit: the entry it came from plus highlighted metadata/content
/// fields keyed by a dotted path (`.title`, `.summary`, `.content[0].value`,
/// `.feed.title`).
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySearchResult {
    pub feed_url: Arc<str>,
    pub id: Arc<str>,
    pub metadata: Vec<(String, HighlightedString)>,
    pub content: Vec<(String, HighlightedString)>,
}
