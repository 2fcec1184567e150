#![allow(clippy::missing_errors_doc)]

//! Watches a folder tree for freshly produced media files, debounces
//! per-file event bursts, and hands quiet files to an upload server. The
//! upload history is checkpointed to a CSV per watch folder so restarts do
//! not re-upload.

mod debounce;
mod error;
mod history;
mod metrics;
mod watch;

pub use debounce::UploadServer;
pub use error::{UploadError, WatchError};
pub use history::{FileHistory, TaskResult};
pub use watch::FileWatch;
