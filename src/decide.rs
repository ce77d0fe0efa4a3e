//! The decider: a pure function reconciling stored state with a fresh
//! parse result. No I/O — everything here is `FeedForUpdate`/parse-result
//! in, intents out.
//!
//! Grounded on `_update.py`'s `Decider`, `UpdateReasons`,
//! `next_update_after`.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc, Weekday};

use crate::hash::{entry_hashable, feed_hashable, get_hash};
use crate::types::{
    Cadence, EntryData, EntryForUpdate, EntryUpdateIntent, FeedData, FeedForUpdate,
    FeedUpdateIntent,
};

/// After this many consecutive hash-only updates, further rewrites of that
/// entry are suppressed (prevents runaway rewrites of entries that embed
/// the current time in their content).
pub const HASH_CHANGED_LIMIT: i64 = 24;

/// Monday, 1970-01-05 00:00:00 UTC — the fixed epoch weekly intervals are
/// anchored to, so they land on a consistent weekday.
fn update_after_start() -> DateTime<Utc> {
    let dt = Utc.with_ymd_and_hms(1970, 1, 5, 0, 0, 0).unwrap();
    debug_assert_eq!(dt.weekday(), Weekday::Mon);
    dt
}

/// Parse outcome for one feed: either fresh data, or a parse failure
/// message (the parser contract's `ParseError`, already stringified since
/// the decider is intentionally error-type-agnostic).
pub enum ParseOutcome {
    Parsed {
        feed: FeedData,
        entries: Vec<EntryData>,
        http_etag: Option<String>,
        http_last_modified: Option<String>,
        retry_after: Option<RetryAfter>,
    },
    NotModified {
        http_etag: Option<String>,
        http_last_modified: Option<String>,
    },
    Error(String),
}

#[derive(Debug, Clone, Copy)]
pub enum RetryAfter {
    At(DateTime<Utc>),
}

/// Computes the next `interval`-minute boundary strictly after `now`,
/// anchored to [`update_after_start`], with up to `jitter * interval`
/// added, floored to the minute.
pub fn next_update_after(now: DateTime<Utc>, interval_minutes: i64, jitter: f64) -> DateTime<Utc> {
    let interval_s = (interval_minutes * 60) as f64;
    let now_s = (now - update_after_start()).num_milliseconds() as f64 / 1000.0;
    let jitter_amount: f64 = if jitter > 0.0 {
        rand::random::<f64>() * jitter
    } else {
        0.0
    };
    let rv_s = ((now_s / interval_s).floor() + 1.0 + jitter_amount) * interval_s;
    let rv_s_floored = (rv_s / 60.0).floor() * 60.0;
    update_after_start() + Duration::milliseconds((rv_s_floored * 1000.0) as i64)
}

/// Applies a server-provided `Retry-After` on top of the baseline
/// schedule: the boundary is computed from `retry_at`, never earlier than
/// it would otherwise be.
pub fn next_update_after_with_retry(
    now: DateTime<Utc>,
    interval_minutes: i64,
    jitter: f64,
    retry_after: Option<RetryAfter>,
) -> DateTime<Utc> {
    match retry_after {
        Some(RetryAfter::At(retry_at)) if retry_at > now => {
            next_update_after(retry_at, interval_minutes, jitter)
        }
        _ => next_update_after(now, interval_minutes, jitter),
    }
}

/// Result of deciding one feed's update: the feed intent plus zero or more
/// entry intents.
pub struct Decision {
    pub feed_intent: FeedUpdateIntent,
    pub entry_intents: Vec<EntryUpdateIntent>,
}

/// Decides what to write for one feed, given its stored state, the parse
/// outcome, existing entries keyed the way the caller already fetched them
/// (same order as `outcome`'s entries), the cadence, and the two clocks:
/// `global_now` (shared across the whole `update_feeds` batch, used to
/// group newly-imported entries) and `now` (this feed's processing time).
pub fn process_feed_for_update(
    old: &FeedForUpdate,
    outcome: ParseOutcome,
    existing_entries: &[Option<EntryForUpdate>],
    cadence: Cadence,
    global_now: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Decision {
    match outcome {
        ParseOutcome::Error(message) => Decision {
            feed_intent: FeedUpdateIntent {
                url: old.url.clone(),
                last_updated: None,
                feed: None,
                http_etag: None,
                http_last_modified: None,
                last_exception: Some(crate::types::ExceptionInfo {
                    message,
                    type_name: None,
                    traceback: None,
                }),
            },
            entry_intents: Vec::new(),
        },
        ParseOutcome::NotModified { .. } => Decision {
            feed_intent: FeedUpdateIntent {
                url: old.url.clone(),
                last_updated: Some(now),
                feed: None,
                http_etag: None,
                http_last_modified: None,
                last_exception: None,
            },
            entry_intents: Vec::new(),
        },
        ParseOutcome::Parsed {
            feed,
            entries,
            http_etag,
            http_last_modified,
            ..
        } => {
            let entry_intents = decide_entries(old, &entries, existing_entries, global_now, now);

            let new_hash = get_hash(&feed_hashable(&feed));
            let hash_changed = old.data_hash.as_deref() != Some(new_hash.as_slice());
            let never_updated = old.last_updated.is_none();
            let should_update_feed =
                old.stale || never_updated || !entry_intents.is_empty() || hash_changed;

            let feed_intent = if should_update_feed {
                FeedUpdateIntent {
                    url: old.url.clone(),
                    last_updated: Some(now),
                    feed: Some(feed),
                    http_etag,
                    http_last_modified,
                    last_exception: None,
                }
            } else {
                FeedUpdateIntent {
                    url: old.url.clone(),
                    last_updated: Some(now),
                    feed: None,
                    http_etag: None,
                    http_last_modified: None,
                    last_exception: None,
                }
            };

            let _ = cadence; // scheduling happens in the pipeline, see next_update_after*
            Decision { feed_intent, entry_intents }
        }
    }
}

fn decide_entries(
    old_feed: &FeedForUpdate,
    entries: &[EntryData],
    existing: &[Option<EntryForUpdate>],
    global_now: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Vec<EntryUpdateIntent> {
    let n = entries.len();
    let mut out = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let existing_entry = existing.get(i).and_then(|e| e.as_ref());

        let should_update = should_update_entry(old_feed.stale, existing_entry, entry);
        if !should_update {
            continue;
        }

        let (first_updated, first_updated_epoch, recent_sort) = match existing_entry {
            None => {
                let recent_sort = if old_feed.last_updated.is_none() {
                    entry.published.or(entry.updated).unwrap_or(global_now)
                } else {
                    global_now
                };
                (now, global_now, recent_sort)
            }
            Some(e) => (now, global_now, e.recent_sort),
        };

        let new_hash = get_hash(&entry_hashable(entry));
        let data_hash_changed = match existing_entry {
            Some(e) if e.data_hash.as_deref() == Some(new_hash.as_slice()) => e.data_hash_changed,
            Some(e) => (e.data_hash_changed + 1).min(HASH_CHANGED_LIMIT + 1),
            None => 0,
        };

        out.push(EntryUpdateIntent {
            entry: entry.clone(),
            last_updated: now,
            first_updated,
            first_updated_epoch,
            recent_sort,
            feed_order: (n - i) as i64,
            data_hash: Some(new_hash),
            data_hash_changed,
            added_by: crate::types::AddedBy::Feed,
        });
    }

    out
}

fn should_update_entry(
    feed_stale: bool,
    existing: Option<&EntryForUpdate>,
    new: &EntryData,
) -> bool {
    let Some(existing) = existing else {
        return true;
    };
    if feed_stale {
        return true;
    }
    if existing.updated != new.updated {
        return true;
    }

    let new_hash = get_hash(&entry_hashable(new));
    let hash_changed = existing.data_hash.as_deref() != Some(new_hash.as_slice());
    if !hash_changed {
        return false;
    }
    existing.data_hash_changed < HASH_CHANGED_LIMIT
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
    }

    #[test]
    fn retry_after_scheduling_matches_seed_scenario_6() {
        let global_now = t(2010, 1, 1, 12, 34);
        let retry_at = global_now + Duration::hours(2);
        let next = next_update_after_with_retry(
            global_now,
            60,
            0.0,
            Some(RetryAfter::At(retry_at)),
        );
        assert_eq!(next, t(2010, 1, 1, 15, 0));
    }

    #[test]
    fn baseline_schedule_without_retry_after_is_next_hour_boundary() {
        let global_now = t(2010, 1, 1, 12, 34);
        let next = next_update_after(global_now, 60, 0.0);
        assert_eq!(next, t(2010, 1, 1, 13, 0));
    }

    #[test]
    fn hash_changed_limit_suppresses_after_24_consecutive_updates() {
        let mut existing = EntryForUpdate {
            updated: Some(t(2020, 1, 1, 0, 0)),
            published: None,
            data_hash: Some(vec![1, 2, 3]),
            data_hash_changed: HASH_CHANGED_LIMIT,
            recent_sort: t(2020, 1, 1, 0, 0),
        };
        let new = EntryData {
            feed_url: "u".into(),
            id: "e".into(),
            title: Some("different".into()),
            link: None,
            updated: existing.updated,
            author: None,
            published: None,
            summary: None,
            content: vec![],
            enclosures: vec![],
        };
        assert!(!should_update_entry(false, Some(&existing), &new));

        existing.data_hash_changed = HASH_CHANGED_LIMIT - 1;
        assert!(should_update_entry(false, Some(&existing), &new));
    }

    #[test]
    fn stale_feed_forces_entry_update_regardless_of_hash() {
        let existing = EntryForUpdate {
            updated: Some(t(2020, 1, 1, 0, 0)),
            published: None,
            data_hash: Some(get_hash(&entry_hashable(&EntryData {
                feed_url: "u".into(),
                id: "e".into(),
                title: Some("t".into()),
                link: None,
                updated: Some(t(2020, 1, 1, 0, 0)),
                author: None,
                published: None,
                summary: None,
                content: vec![],
                enclosures: vec![],
            }))),
            data_hash_changed: 0,
            recent_sort: t(2020, 1, 1, 0, 0),
        };
        let new = EntryData {
            feed_url: "u".into(),
            id: "e".into(),
            title: Some("t".into()),
            link: None,
            updated: Some(t(2020, 1, 1, 0, 0)),
            author: None,
            published: None,
            summary: None,
            content: vec![],
            enclosures: vec![],
        };
        assert!(should_update_entry(true, Some(&existing), &new));
    }

    #[test]
    fn decide_entries_preserves_recent_sort_of_an_existing_entry() {
        let old_feed = FeedForUpdate {
            url: "u".into(),
            updated: None,
            http_etag: None,
            http_last_modified: None,
            stale: false,
            last_updated: Some(t(2020, 1, 1, 0, 0)),
            last_exception: false,
            data_hash: None,
        };
        let original_recent_sort = t(2020, 1, 1, 0, 0);
        let existing = EntryForUpdate {
            updated: Some(t(2020, 1, 1, 0, 0)),
            published: None,
            data_hash: Some(vec![1, 2, 3]),
            data_hash_changed: 0,
            recent_sort: original_recent_sort,
        };
        let new = EntryData {
            feed_url: "u".into(),
            id: "e".into(),
            title: Some("changed title".into()),
            link: None,
            updated: Some(t(2020, 1, 2, 0, 0)),
            author: None,
            published: None,
            summary: None,
            content: vec![],
            enclosures: vec![],
        };

        let global_now = t(2020, 1, 3, 0, 0);
        let intents = decide_entries(&old_feed, &[new], &[Some(existing)], global_now, global_now);

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].recent_sort, original_recent_sort);
    }
}
