//! In-memory backend driven by the caller.
//!
//! Nothing is read from the OS: notifications are injected through a
//! [`ManualHandle`]. Useful for tests and for embedding event producers that
//! live outside this crate.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{Backend, RawSink};
use crate::error::{Result, WatcherError};
use crate::op::Op;

#[derive(Debug, Default)]
struct ManualState {
    registered: Vec<PathBuf>,
    fail_on: HashSet<PathBuf>,
    closed: bool,
}

/// Shared handle to inject notifications and inspect registrations.
#[derive(Debug, Clone)]
pub struct ManualHandle {
    sink: RawSink,
    state: Arc<Mutex<ManualState>>,
}

impl ManualHandle {
    fn state(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inject a change notification.
    pub fn emit(&self, path: impl Into<PathBuf>, op: Op) -> bool {
        self.sink.change(path, op)
    }

    /// Inject a change notification from raw operation bits.
    pub fn emit_raw(&self, path: impl Into<PathBuf>, bits: u32) -> bool {
        self.sink.change(path, Op::from(bits))
    }

    /// Simulate the OS dropping notifications.
    pub fn overflow(&self) -> bool {
        self.sink.overflow()
    }

    /// Inject a backend runtime error.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.sink.error(message)
    }

    /// Directories currently registered, in registration order.
    pub fn registered(&self) -> Vec<PathBuf> {
        self.state().registered.clone()
    }

    /// Make registration of `dir` fail.
    pub fn fail_on(&self, dir: impl Into<PathBuf>) {
        self.state().fail_on.insert(dir.into());
    }

    /// Whether [`Backend::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// A backend whose notifications come from a [`ManualHandle`].
#[derive(Debug)]
pub struct ManualBackend {
    handle: ManualHandle,
    recursion: bool,
}

impl ManualBackend {
    /// Create a backend pushing into `sink`.
    pub fn new(sink: RawSink) -> Self {
        Self {
            handle: ManualHandle {
                sink,
                state: Arc::new(Mutex::new(ManualState::default())),
            },
            recursion: true,
        }
    }

    /// Refuse recursive watch requests.
    pub fn without_recursion(mut self) -> Self {
        self.recursion = false;
        self
    }

    /// Handle for injecting notifications.
    pub fn handle(&self) -> ManualHandle {
        self.handle.clone()
    }
}

impl Backend for ManualBackend {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        let mut state = self.handle.state();
        if state.closed {
            return Err(WatcherError::Closed);
        }
        if state.fail_on.contains(dir) {
            return Err(WatcherError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("registration refused for {}", dir.display()),
            )));
        }
        if !state.registered.iter().any(|d| d == dir) {
            state.registered.push(dir.to_path_buf());
        }
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) -> Result<()> {
        let mut state = self.handle.state();
        let before = state.registered.len();
        state.registered.retain(|d| d != dir);
        if state.registered.len() == before {
            return Err(WatcherError::NonExistentWatch(dir.to_path_buf()));
        }
        Ok(())
    }

    fn supports_recursion(&self) -> bool {
        self.recursion
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.handle.state();
        state.registered.clear();
        state.closed = true;
        Ok(())
    }
}
