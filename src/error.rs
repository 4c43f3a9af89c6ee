//! Error types for store access and sync runs

use std::fmt;
use std::io;

use thiserror::Error;

use crate::sync::SyncReport;

/// Failures raised by a document store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mongodb: {0}")]
    Mongo(#[from] mongodb::error::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("sqlite migration: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("bson conversion: {0}")]
    Bson(#[from] mongodb::bson::ser::Error),
    #[error("stored document is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("invalid name `{0}`")]
    InvalidName(String),
    #[error("unsupported store url `{0}`")]
    UnsupportedUrl(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Which batch a bulk write belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Update,
    Insert,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update => f.write_str("update"),
            Self::Insert => f.write_str("insert"),
        }
    }
}

/// Errors that end (or, for [`SyncError::MissingIdentity`], skip part of) a sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The store is unreachable; nothing was mutated.
    #[error("storage unreachable: {0}")]
    Connection(#[source] StoreError),

    /// The input stream is malformed. Batches flushed before this point stay committed.
    #[error("malformed input{}: {message}", .offset.map(|o| format!(" at byte {o}")).unwrap_or_default())]
    Parse {
        offset: Option<u64>,
        message: String,
    },

    /// A single record carries no usable identity; it is skipped.
    #[error("record has no identity: {0}")]
    MissingIdentity(String),

    /// A bulk write failed; earlier batches stay committed.
    #[error("bulk {kind} of {size} operations failed: {source}")]
    BulkWrite {
        kind: WriteKind,
        size: usize,
        #[source]
        source: StoreError,
    },

    /// Index management failed while indexes were configured as strict.
    #[error("index rebuild failed: {0}")]
    Index(#[source] StoreError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("input unreadable: {0}")]
    Io(#[from] io::Error),
}

impl SyncError {
    pub fn parse(offset: u64, message: impl Into<String>) -> Self {
        Self::Parse {
            offset: Some(offset),
            message: message.into(),
        }
    }
}

/// A failed run: the error plus everything the run achieved before it.
#[derive(Debug, Error)]
#[error("{entity} sync failed ({report}): {error}")]
pub struct SyncFailure {
    pub entity: String,
    pub report: SyncReport,
    #[source]
    pub error: SyncError,
}

/// Errors of a pipeline run as a whole.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Another pipeline run holds the coordinator; nothing was started.
    #[error("a pipeline run is already in progress")]
    Busy,

    #[error("price markup failed: {0}")]
    Markup(#[source] SyncError),

    #[error(transparent)]
    Sync(#[from] SyncFailure),
}
