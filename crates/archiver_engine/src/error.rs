use archiver_core::{ArchiveState, LinkId};

use crate::config::ConfigError;
use crate::store::StoreError;

/// Errors returned by the [`Archiver`](crate::Archiver) API.
///
/// Pipeline failures never surface here; they are recorded on the archive.
#[derive(Debug, thiserror::Error)]
pub enum ArchiverError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no archive for link {0}")]
    NotFound(LinkId),

    #[error("archive for link {link_id} is {state}, expected {expected}")]
    InvalidState {
        link_id: LinkId,
        state: ArchiveState,
        expected: ArchiveState,
    },

    #[error("archive for link {0} already has a running job")]
    JobRunning(LinkId),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),
}
