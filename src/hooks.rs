//! Ordered, error-isolated hook registry.
//!
//! Grounded on `_update.py`'s `hooks.run(...)`/`hooks.group(...)` usage: a
//! named event fires every registered callback in registration order;
//! failures are collected rather than aborting the remaining callbacks, and
//! a `group` caps how many distinct failures it will report before giving
//! up (matching the `limit=5` call site in `Pipeline.update_feed`).

use std::sync::Arc;

use crate::error::{ReaderError, UpdateError};
use crate::types::{Entry, EntryUpdateStatus};

type BeforeFeedUpdate = Arc<dyn Fn(&str) + Send + Sync>;
type AfterFeedUpdate = Arc<dyn Fn(&str) + Send + Sync>;
type AfterEntryUpdate = Arc<dyn Fn(&Entry, EntryUpdateStatus) + Send + Sync>;
type BatchUpdate = Arc<dyn Fn() + Send + Sync>;

/// The engine's hook groups. Each `Vec` runs in registration order; a
/// plugin/caller appends to whichever groups it cares about.
#[derive(Clone, Default)]
pub struct Hooks {
    before_feeds_update: Vec<BatchUpdate>,
    before_feed_update: Vec<BeforeFeedUpdate>,
    after_feed_update: Vec<AfterFeedUpdate>,
    after_entry_update: Vec<AfterEntryUpdate>,
    after_feeds_update: Vec<BatchUpdate>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_feeds_update(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.before_feeds_update.push(Arc::new(f));
    }

    pub fn on_before_feed_update(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.before_feed_update.push(Arc::new(f));
    }

    pub fn on_after_feed_update(&mut self, f: impl Fn(&str) + Send + Sync + 'static) {
        self.after_feed_update.push(Arc::new(f));
    }

    pub fn on_after_entry_update(&mut self, f: impl Fn(&Entry, EntryUpdateStatus) + Send + Sync + 'static) {
        self.after_entry_update.push(Arc::new(f));
    }

    pub fn on_after_feeds_update(&mut self, f: impl Fn() + Send + Sync + 'static) {
        self.after_feeds_update.push(Arc::new(f));
    }

    /// Runs every `before_feeds_update` hook once for the whole batch,
    /// error-isolated like [`Self::run_after_update`] since it runs before
    /// any per-feed writes but after the batch has already been decided on.
    pub fn run_before_feeds_update(&self, limit: usize) -> Result<(), ReaderError> {
        run_batch_group(&self.before_feeds_update, "before_feeds_update", limit)
    }

    /// Runs every `after_feeds_update` hook once for the whole batch.
    pub fn run_after_feeds_update(&self, limit: usize) -> Result<(), ReaderError> {
        run_batch_group(&self.after_feeds_update, "after_feeds_update", limit)
    }

    /// Runs every `before_feed_update` hook; the first failure aborts the
    /// feed (the source treats this phase as not error-isolated, since it
    /// runs before any writes).
    pub fn run_before_feed_update(&self, url: &str) {
        for hook in &self.before_feed_update {
            hook(url);
        }
    }

    /// Runs every `after_entry_update` hook for every updated entry, then
    /// every `after_feed_update` hook, collecting failures instead of
    /// aborting. Panicking hooks are caught via `catch_unwind` so one
    /// misbehaving plugin can't take down the whole batch.
    pub fn run_after_update(
        &self,
        url: &str,
        entries: &[(Entry, EntryUpdateStatus)],
        limit: usize,
    ) -> Result<(), ReaderError> {
        let mut errors = 0usize;

        for (entry, status) in entries {
            for hook in &self.after_entry_update {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(entry, *status))).is_err() {
                    errors += 1;
                    if errors >= limit {
                        return Err(ReaderError::Update(UpdateError::Hooks {
                            phase: "after_entry_update",
                            count: errors,
                        }));
                    }
                }
            }
        }

        for hook in &self.after_feed_update {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(url))).is_err() {
                errors += 1;
                if errors >= limit {
                    return Err(ReaderError::Update(UpdateError::Hooks {
                        phase: "after_feed_update",
                        count: errors,
                    }));
                }
            }
        }

        Ok(())
    }
}

fn run_batch_group(hooks: &[BatchUpdate], phase: &'static str, limit: usize) -> Result<(), ReaderError> {
    let mut errors = 0usize;
    for hook in hooks {
        if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())).is_err() {
            errors += 1;
            if errors >= limit {
                return Err(ReaderError::Update(UpdateError::Hooks { phase, count: errors }));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn before_feed_update_runs_in_registration_order() {
        let mut hooks = Hooks::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        hooks.on_before_feed_update(move |_| o1.lock().unwrap().push(1));
        let o2 = order.clone();
        hooks.on_before_feed_update(move |_| o2.lock().unwrap().push(2));
        hooks.run_before_feed_update("u");
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn after_update_counts_entry_hooks_and_feed_hook() {
        let mut hooks = Hooks::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        hooks.on_after_entry_update(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let entry = crate::types::Entry {
            feed_url: "u".into(),
            id: "e".into(),
            title: None,
            link: None,
            updated: None,
            author: None,
            published: None,
            summary: None,
            content: vec![],
            enclosures: vec![],
            read: false,
            read_modified: None,
            important: crate::types::TriState::Unset,
            important_modified: None,
            first_updated: chrono::Utc::now(),
            first_updated_epoch: chrono::Utc::now(),
            last_updated: chrono::Utc::now(),
            feed_order: 0,
            recent_sort: chrono::Utc::now(),
            original_feed: None,
            added_by: crate::types::AddedBy::Feed,
            sequence: None,
        };
        hooks
            .run_after_update("u", &[(entry, EntryUpdateStatus::New)], 5)
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
