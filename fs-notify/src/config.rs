//! Configuration for the file watcher.

use serde::{Deserialize, Serialize};

/// Configuration for a [`Watcher`](crate::Watcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Capacity of the caller-visible event stream.
    pub event_capacity: usize,

    /// Capacity of the caller-visible error stream.
    pub error_capacity: usize,

    /// Capacity of the queue between the backend and the normalizer.
    ///
    /// When this fills up, raw notifications are dropped and a single
    /// overflow error is reported.
    pub raw_capacity: usize,

    /// Hard cap on registered directories (None = bounded only by the
    /// descriptor limit).
    pub max_watches: Option<u64>,

    /// Descriptors kept free for the rest of the process.
    pub reserved_descriptors: u64,

    /// Drop an event identical to the one delivered just before it.
    pub coalesce_duplicates: bool,

    /// Register directories created inside a recursive watch.
    pub follow_new_directories: bool,
}

impl WatcherConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self {
            event_capacity: 1000,
            error_capacity: 64,
            raw_capacity: 4096,
            max_watches: None,
            reserved_descriptors: 64,
            coalesce_duplicates: true,
            follow_new_directories: true,
        }
    }

    /// Set the event stream capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Set the raw queue capacity.
    pub fn with_raw_capacity(mut self, capacity: usize) -> Self {
        self.raw_capacity = capacity.max(1);
        self
    }

    /// Set the maximum number of registered directories.
    pub fn with_max_watches(mut self, max: u64) -> Self {
        self.max_watches = Some(max);
        self
    }

    /// Set the number of descriptors kept free.
    pub fn with_reserved_descriptors(mut self, reserved: u64) -> Self {
        self.reserved_descriptors = reserved;
        self
    }

    /// Deliver duplicate events as-is.
    pub fn keep_duplicates(mut self) -> Self {
        self.coalesce_duplicates = false;
        self
    }

    /// Do not register directories created inside recursive watches.
    pub fn ignore_new_directories(mut self) -> Self {
        self.follow_new_directories = false;
        self
    }

    /// Number of directories that may be registered, given the process
    /// descriptor limit (0 = unknown).
    pub fn watch_capacity(&self, descriptor_limit: u64) -> Option<u64> {
        let from_limit = if descriptor_limit == 0 {
            None
        } else {
            Some(descriptor_limit.saturating_sub(self.reserved_descriptors))
        };

        match (self.max_watches, from_limit) {
            (Some(max), Some(limit)) => Some(max.min(limit)),
            (max, limit) => max.or(limit),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self::new()
    }
}
