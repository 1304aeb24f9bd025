//! Error types and the process-wide error log

use parking_lot::Mutex;
use std::path::PathBuf;
use thiserror::Error;
use tracing::warn;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by [`FileWatcher`](crate::FileWatcher) and its backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The path does not exist or is not a directory.
    #[error("directory not found: {0}")]
    FileNotFound(PathBuf),

    /// The directory is already covered by a watch of this instance.
    #[error("directory already watched: {0}")]
    FileRepeated(PathBuf),

    /// A symlink target resolves outside the watched tree.
    #[error("symlink target out of scope: {0}")]
    FileOutOfScope(PathBuf),

    /// The directory exists but cannot be read.
    #[error("directory not readable: {0}")]
    FileNotReadable(PathBuf),

    /// The directory lives on a remote filesystem the native backend
    /// cannot observe. Use a generic (polling) watcher for it.
    #[error("directory on a remote filesystem: {0}")]
    FileRemote(PathBuf),

    /// The kernel watch interface failed for a live watch.
    #[error("watcher failed: {0}")]
    WatcherFailed(String),

    /// Anything else.
    #[error("{0}")]
    Unspecified(String),
}

impl Error {
    /// Stable negative code for this error kind. `0` is reserved for
    /// "no error".
    pub fn code(&self) -> i64 {
        match self {
            Error::FileNotFound(_) => -1,
            Error::FileRepeated(_) => -2,
            Error::FileOutOfScope(_) => -3,
            Error::FileNotReadable(_) => -4,
            Error::FileRemote(_) => -5,
            Error::WatcherFailed(_) => -6,
            Error::Unspecified(_) => -7,
        }
    }
}

static LAST_ERROR: Mutex<Option<Error>> = Mutex::new(None);

/// Records `err` in the process-wide error slot and returns it.
///
/// Every error that crosses the public API boundary passes through here,
/// so `last_error_*` always reflects the most recent failure even for
/// callers that discard the returned `Result`.
pub(crate) fn log_error(err: Error) -> Error {
    warn!(code = err.code(), "{err}");
    *LAST_ERROR.lock() = Some(err.clone());
    err
}

/// Message of the most recently recorded error, or an empty string.
pub fn last_error_message() -> String {
    LAST_ERROR
        .lock()
        .as_ref()
        .map(|err| err.to_string())
        .unwrap_or_default()
}

/// Code of the most recently recorded error, or `0` if none was recorded
/// since the last [`clear_last_error`].
pub fn last_error_code() -> i64 {
    LAST_ERROR.lock().as_ref().map(Error::code).unwrap_or(0)
}

/// Resets the process-wide error slot.
pub fn clear_last_error() {
    *LAST_ERROR.lock() = None;
}
