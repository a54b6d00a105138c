use std::path::PathBuf;

use archiver_core::{ArchiveId, ArchiveState, LinkId, TransitionError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error("archive {0} not found")]
    NotFound(ArchiveId),

    #[error("link {0} already has an archive")]
    AlreadyExists(LinkId),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The row moved on between the read and the conditional update.
    #[error("archive {archive_id} is no longer {expected}")]
    Conflict {
        archive_id: ArchiveId,
        expected: ArchiveState,
    },
}
