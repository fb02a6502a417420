//! Error types for the file watcher.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur while watching files.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Remove was called for a path that was never added.
    #[error("can't remove non-existent watch: {}", .0.display())]
    NonExistentWatch(PathBuf),

    /// The backend dropped events because the consumer fell behind.
    #[error("event queue overflow")]
    EventOverflow,

    /// A recursive watch was requested on something that is not a directory.
    #[error("{:?}: not a directory", .0)]
    NotDirectory(PathBuf),

    /// The backend cannot honor recursive watches.
    #[error("recursion not supported")]
    RecursionUnsupported,

    /// Registering another directory would exceed the watch capacity.
    #[error("too many watches: limit of {limit} reached")]
    TooManyWatches { limit: u64 },

    /// A watcher was created outside a Tokio runtime.
    #[error("watcher must be created inside a Tokio runtime")]
    NoRuntime,

    /// The watcher has been closed.
    #[error("watcher is closed")]
    Closed,

    /// Runtime error reported by a backend.
    #[error("backend error: {0}")]
    Backend(String),

    /// Notify error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Directory traversal error.
    #[error("walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatcherError {
    /// Whether this error was caused by the caller rather than the backend.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NonExistentWatch(_)
                | Self::NotDirectory(_)
                | Self::RecursionUnsupported
                | Self::NoRuntime
        )
    }
}
