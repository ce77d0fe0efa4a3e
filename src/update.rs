//! Update pipeline: retrieves and parses feeds, decides what changed, writes
//! it, runs hooks, and aggregates per-feed results.
//!
//! Grounded on `_update.py`'s `Pipeline.update()`/`update_feed()`, with the
//! bounded-concurrency retrieval stage adapted from the teacher's
//! `feed/fetcher.rs::refresh_all` (`stream::iter(...).buffer_unordered(N)`).

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};

use crate::decide::{self, Decision};
use crate::error::{FeedError, ReaderError, UpdateError};
use crate::hooks::Hooks;
use crate::parser::Parser;
use crate::storage::Storage;
use crate::types::{
    Cadence, EntryForUpdate, EntryUpdateStatus, FeedFilter, UpdateOutcome, UpdateResult,
    UpdatedFeed,
};

const HOOK_ERROR_LIMIT: usize = 5;
const FETCH_CONCURRENCY: usize = 10;

/// Updates every feed matching `filter`.
///
/// Retrieval runs at most [`FETCH_CONCURRENCY`] feeds at a time; `global_now`
/// is the single timestamp shared across the whole batch (used to group
/// newly-imported entries together), while `now` is sampled per feed so a
/// slow batch doesn't backdate later feeds. A feed whose retrieval or write
/// fails with an expected update error is recorded as [`UpdateOutcome::Error`]
/// and the batch continues; a feed deleted mid-batch is dropped from the
/// results with a warning. Anything else propagates, since it indicates a
/// programmer/storage error rather than an expected per-feed failure.
pub async fn update_feeds(
    storage: &Storage,
    parser: &(dyn Parser + Sync),
    hooks: &Hooks,
    filter: &FeedFilter,
    cadence: Cadence,
    global_now: DateTime<Utc>,
) -> Result<Vec<UpdateResult>, ReaderError> {
    let feeds = storage.get_feeds_for_update(filter).await?;

    hooks.run_before_feeds_update(HOOK_ERROR_LIMIT)?;

    let outcomes = stream::iter(feeds.into_iter())
        .map(|feed| async move {
            let url = feed.url.clone();
            let now = Utc::now();
            let outcome = update_one_feed(storage, parser, hooks, feed, cadence, global_now, now).await;
            (url, outcome)
        })
        .buffer_unordered(FETCH_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut results = Vec::with_capacity(outcomes.len());
    for (url, outcome) in outcomes {
        match outcome {
            Ok(value) => results.push(UpdateResult { url, value }),
            Err(ReaderError::Feed(FeedError::NotFound(_)))
            | Err(ReaderError::Update(UpdateError::Feed(FeedError::NotFound(_)))) => {
                tracing::warn!(url = %url, "feed disappeared mid-update, dropping from batch");
            }
            Err(err) => return Err(err),
        }
    }

    hooks.run_after_feeds_update(HOOK_ERROR_LIMIT)?;

    Ok(results)
}

/// Convenience wrapper for updating a single feed by URL.
pub async fn update_feed(
    storage: &Storage,
    parser: &(dyn Parser + Sync),
    hooks: &Hooks,
    url: &str,
    cadence: Cadence,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome, ReaderError> {
    let feed = storage.get_feed_for_update(url).await?;
    update_one_feed(storage, parser, hooks, feed, cadence, now, now).await
}

async fn update_one_feed(
    storage: &Storage,
    parser: &(dyn Parser + Sync),
    hooks: &Hooks,
    feed: crate::types::FeedForUpdate,
    cadence: Cadence,
    global_now: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<UpdateOutcome, ReaderError> {
    let feed = match parser.process_feed_for_update(&feed) {
        Ok(feed) => feed,
        Err(ReaderError::Parse { url, message }) => {
            return write_parse_error(storage, &url, message).await;
        }
        Err(err) => return Err(err),
    };

    hooks.run_before_feed_update(&feed.url);

    let outcome = parser.retrieve_and_parse(&feed);

    let existing_ids: Vec<(String, String)> = match &outcome {
        decide::ParseOutcome::Parsed { entries, .. } => entries
            .iter()
            .map(|e| (e.feed_url.to_string(), e.id.to_string()))
            .collect(),
        _ => Vec::new(),
    };
    let existing_entries: Vec<Option<EntryForUpdate>> = if existing_ids.is_empty() {
        Vec::new()
    } else {
        storage.get_entries_for_update(&existing_ids).await?
    };
    let previously_seen: std::collections::HashSet<(String, String)> = existing_ids
        .iter()
        .zip(existing_entries.iter())
        .filter(|(_, e)| e.is_some())
        .map(|(id, _)| id.clone())
        .collect();

    let was_server_not_modified = matches!(outcome, decide::ParseOutcome::NotModified { .. });

    let (outcome, existing_entries, parsed_count) = match outcome {
        decide::ParseOutcome::Parsed { feed: fd, entries, http_etag, http_last_modified, retry_after } => {
            let pairs: Vec<_> = entries.into_iter().zip(existing_entries).collect();
            let pairs = parser.process_entry_pairs(&feed.url, pairs);
            let (entries, existing): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();
            let parsed_count = entries.len();
            (
                decide::ParseOutcome::Parsed { feed: fd, entries, http_etag, http_last_modified, retry_after },
                existing,
                parsed_count,
            )
        }
        other => (other, existing_entries, 0),
    };

    let Decision { feed_intent, entry_intents } =
        decide::process_feed_for_update(&feed, outcome, &existing_entries, cadence, global_now, now);

    let had_error = feed_intent.last_exception.is_some();
    let new_count = entry_intents
        .iter()
        .filter(|i| !previously_seen.contains(&(i.entry.feed_url.to_string(), i.entry.id.to_string())))
        .count() as u64;
    let modified_count = entry_intents.len() as u64 - new_count;
    let unmodified_count = parsed_count as u64 - new_count - modified_count;

    if !entry_intents.is_empty() {
        storage.add_or_update_entries(&entry_intents).await?;
    }
    storage.update_feed(&feed_intent).await?;

    if had_error {
        return Ok(UpdateOutcome::Error(
            feed_intent
                .last_exception
                .map(|e| e.message)
                .unwrap_or_default(),
        ));
    }
    if was_server_not_modified {
        return Ok(UpdateOutcome::NotModified);
    }

    let mut updated_entries = Vec::with_capacity(entry_intents.len());
    for intent in &entry_intents {
        let status = if previously_seen.contains(&(intent.entry.feed_url.to_string(), intent.entry.id.to_string())) {
            EntryUpdateStatus::Modified
        } else {
            EntryUpdateStatus::New
        };
        let entry = storage
            .get_entry(intent.entry.feed_url.as_ref(), intent.entry.id.as_ref())
            .await?;
        updated_entries.push((entry, status));
    }

    hooks.run_after_update(&feed.url, &updated_entries, HOOK_ERROR_LIMIT)?;

    Ok(UpdateOutcome::Updated(UpdatedFeed {
        new: new_count,
        modified: modified_count,
        unmodified: unmodified_count,
    }))
}

async fn write_parse_error(storage: &Storage, url: &str, message: String) -> Result<UpdateOutcome, ReaderError> {
    let feed = storage.get_feed_for_update(url).await?;
    let intent = crate::types::FeedUpdateIntent {
        url: feed.url.clone(),
        last_updated: None,
        feed: None,
        http_etag: None,
        http_last_modified: None,
        last_exception: Some(crate::types::ExceptionInfo {
            message: message.clone(),
            type_name: None,
            traceback: None,
        }),
    };
    storage.update_feed(&intent).await?;
    Ok(UpdateOutcome::Error(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::EngineConfig;
    use crate::parser::ScriptedParser;
    use crate::types::{Content, EntryData, FeedData};
    use chrono::TimeZone;

    async fn open_mem() -> Storage {
        Storage::open(":memory:", EngineConfig::default()).await.unwrap()
    }

    fn t(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn update_feeds_writes_new_entries_and_marks_them_new() {
        let storage = open_mem().await;
        storage.add_feed("http://a", t(2020, 1, 1)).await.unwrap();

        let parser = ScriptedParser::new();
        parser.script(
            "http://a",
            decide::ParseOutcome::Parsed {
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
                    updated: Some(t(2020, 1, 2)),
                    author: None,
                    published: Some(t(2020, 1, 2)),
                    summary: None,
                    content: vec![Content { value: Some("hi".into()), mime_type: None, language: None }],
                    enclosures: vec![],
                }],
                http_etag: None,
                http_last_modified: None,
                retry_after: None,
            },
        );

        let hooks = Hooks::new();
        let results = update_feeds(
            &storage,
            &parser,
            &hooks,
            &FeedFilter::default(),
            Cadence::default(),
            t(2020, 1, 3),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        match &results[0].value {
            UpdateOutcome::Updated(u) => assert_eq!(u.new, 1),
            other => panic!("expected Updated, got {other:?}"),
        }

        let entry = storage.get_entry("http://a", "e1").await.unwrap();
        assert_eq!(entry.title.as_deref(), Some("Entry 1"));
    }

    #[tokio::test]
    async fn update_feeds_records_parse_error_without_aborting_batch() {
        let storage = open_mem().await;
        storage.add_feed("http://broken", t(2020, 1, 1)).await.unwrap();
        let parser = ScriptedParser::new();
        parser.script("http://broken", decide::ParseOutcome::Error("boom".into()));

        let hooks = Hooks::new();
        let results = update_feeds(
            &storage,
            &parser,
            &hooks,
            &FeedFilter::default(),
            Cadence::default(),
            t(2020, 1, 3),
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0].value, UpdateOutcome::Error(m) if m == "boom"));

        let feed = storage.get_feed("http://broken").await.unwrap();
        assert!(feed.last_exception.is_some());
    }
}
