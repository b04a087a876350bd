use thiserror::Error;

use crate::wait::Interrupted;

/// Failure reported by a [`BlockStorage`](crate::backend::BlockStorage) implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("timeout, snapshot {snapshot_id} is still not ready: {source}")]
    NotReady {
        snapshot_id: String,
        #[source]
        source: Interrupted,
    },

    #[error("invalid next page url {url}: {source}")]
    InvalidPageUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("request cancelled")]
    Cancelled,
}

impl SnapshotError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::Backend(e) if e.is_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SnapshotError::NotReady { .. })
    }
}

/// Error returned by `wait_ready`: the polling error together with the status
/// string obtained from the final best-effort lookup.
#[derive(Debug, Error)]
#[error("{source} (last observed status: {status})")]
pub struct WaitReadyError {
    pub status: String,
    #[source]
    pub source: SnapshotError,
}
