//! Flat, chainable error taxonomy for the engine.
//!
//! Mirrors the distilled exception hierarchy: a single [`ReaderError`] enum
//! with narrower domain errors converting into it via `From`. Driver
//! exceptions are classified at the storage boundary by matching SQL error
//! message substrings, the same way the teacher's `DatabaseError::from_sqlx`
//! classifies `sqlx::Error`.

use thiserror::Error;

/// Top-level error returned by every public engine operation.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Entry(#[from] EntryError),

    #[error("no such tag: {key:?} on {resource:?}")]
    TagNotFound { resource: String, key: String },

    #[error("error parsing feed {url}: {message}")]
    Parse { url: String, message: String },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Search(#[from] SearchError),

    #[error("change tracking is not enabled")]
    ChangeTrackingNotEnabled,

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error("invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("no such feed: {0:?}")]
    NotFound(String),
    #[error("feed exists: {0:?}")]
    Exists(String),
}

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("no such entry: ({0:?}, {1:?})")]
    NotFound(String, String),
    #[error("entry exists: ({0:?}, {1:?})")]
    Exists(String, String),
    #[error("entry ({0:?}, {1:?}) must be added by {2:?}, got {3:?}")]
    WrongOrigin(String, String, String, String),
}

/// Wraps unexpected SQL/driver failures that don't match a recognised
/// error-message fragment.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Other(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("schema version error: {0}")]
    SchemaVersion(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("database requirement error: {0}")]
    Requirement(String),
    #[error("application id error: {0}")]
    ApplicationId(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search operation not supported with search disabled")]
    NotEnabled,
    #[error("invalid search query: {0}")]
    InvalidQuery(String),
    #[error("search error: {0}")]
    Other(String),
}

/// Base for expected per-feed update failures; these never abort a batch.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("hooks raised {count} error(s) during {phase}")]
    Hooks { phase: &'static str, count: usize },
}

pub type Result<T> = std::result::Result<T, ReaderError>;

/// Classifies an `sqlx::Error` the way the storage layer is required to:
/// recognised substrings become domain-specific errors, everything else
/// becomes a generic [`StorageError`].
pub fn classify_sqlx_error(err: sqlx::Error, not_found: impl FnOnce() -> ReaderError) -> ReaderError {
    let msg = err.to_string().to_lowercase();

    if msg.contains("unique constraint failed: feeds.url") {
        // Caller must supply the offending URL; this generic path is only
        // reached when the caller didn't already special-case it.
        return ReaderError::Storage(StorageError::Other(err.to_string()));
    }
    if msg.contains("foreign key constraint failed") {
        return not_found();
    }
    if msg.contains("no such table") {
        return ReaderError::ChangeTrackingNotEnabled;
    }
    if msg.contains("fts5: syntax error near")
        || msg.contains("unknown special query")
        || msg.contains("no such column")
        || msg.contains("no such cursor")
        || msg.contains("unterminated string")
    {
        return ReaderError::Search(SearchError::InvalidQuery(err.to_string()));
    }

    ReaderError::Storage(StorageError::Sqlx(err))
}
