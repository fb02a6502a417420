//! File events delivered to the caller.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::op::Op;

/// A single file system notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Path to the file or directory.
    ///
    /// Paths are relative to the input: after `add("dir")` a file created in
    /// it is reported as `dir/file`, after `add("/path/to/dir")` as
    /// `/path/to/dir/file`.
    pub path: PathBuf,

    /// Operations that triggered the event.
    pub op: Op,
}

impl Event {
    /// Create a new event.
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        Self {
            path: path.into(),
            op,
        }
    }

    /// Reports whether this event has every bit of `op`.
    pub fn has(&self, op: Op) -> bool {
        self.op.has(op)
    }

    /// Path to the affected file or directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for Event {
    /// Formats as `"path": CREATE|WRITE`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.path, self.op)
    }
}
