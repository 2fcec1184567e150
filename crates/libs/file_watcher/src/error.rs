use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("path must be a directory: {0}")]
    NotDirectory(PathBuf),
    #[error("filesystem notification error: {0}")]
    Notify(#[from] notify::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("event channel closed")]
    EventsClosed,
}

/// Error surfaced by [`crate::UploadServer::upload`] implementations so the
/// debouncer can decide whether the failure deserves an alert.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The file's extension or MIME type is not recognized. Permanent for
    /// this file and deliberately not alertable.
    #[error("unknown media type: {0}")]
    UnknownMediaType(String),
    /// The surrounding task tree is shutting down; not a failure.
    #[error("upload cancelled")]
    Cancelled,
    #[error("{0}")]
    Failed(String),
}
