// Error types shared across the cache subsystem

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use zip::result::ZipError;

/// Failure to unpack one artifact. Fatal for that artifact only.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("IO error while extracting {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not a valid archive: {source}")]
    NotAnArchive {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
    #[error("ZIP error while extracting {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: ZipError,
    },
}

impl ExtractionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn zip(path: impl Into<PathBuf>, source: ZipError) -> Self {
        let path = path.into();
        match source {
            ZipError::Io(source) => Self::Io { path, source },
            ZipError::InvalidArchive(_) => Self::NotAnArchive { path, source },
            source => Self::Zip { path, source },
        }
    }

    /// Non-archive input is expected in package folders and is reported softly.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::NotAnArchive { .. })
    }
}

/// Marker carried in worker error messages for non-archive input.
pub const NOT_AN_ARCHIVE: &str = "is not a valid archive";

/// Failure to read or write one of the persisted JSON snapshots.
#[derive(Debug, Error)]
pub enum CacheIoError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Failures talking to an out-of-process worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker: {reason}")]
    SpawnFailed { reason: String },

    #[error("worker process crashed: {reason}")]
    Crashed { reason: String },

    #[error("worker protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("worker reported an error: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Cache(#[from] CacheIoError),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
