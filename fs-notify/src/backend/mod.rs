//! Backends produce raw notifications for registered directories.
//!
//! ```text
//!   Backend ──► RawSink ══ bounded queue ══► RawSource ──► normalizer
//!                  │                             ▲
//!                  └──── overflow flag ──────────┘
//! ```
//!
//! A backend only registers single directories; recursion is emulated above
//! it. It pushes `(path, op)` tuples into a [`RawSink`] from whatever thread
//! it runs on. The sink never blocks: when the queue is full the notification
//! is dropped and an overflow flag is raised, which the [`RawSource`] turns
//! into a single [`RawNotification::Overflow`] once the queue is drained.

pub mod manual;
pub mod recommended;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

use crate::error::Result;
use crate::op::Op;

pub use manual::{ManualBackend, ManualHandle};
pub use recommended::NotifyBackend;

/// A platform-specific source of raw change notifications.
pub trait Backend: Send + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Start receiving notifications for a single directory (or file).
    fn watch_dir(&mut self, dir: &Path) -> Result<()>;

    /// Stop receiving notifications for a directory.
    fn unwatch_dir(&mut self, dir: &Path) -> Result<()>;

    /// Whether recursive requests may be emulated on top of this backend.
    fn supports_recursion(&self) -> bool {
        true
    }

    /// Release every OS resource held by the backend.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A notification as produced by a backend, before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawNotification {
    /// Something happened to `path`.
    Change { path: PathBuf, op: Op },

    /// The backend or the OS dropped notifications.
    Overflow,

    /// The backend hit a runtime error.
    Error(String),
}

/// Create a raw notification queue.
pub fn raw_channel(capacity: usize) -> (RawSink, RawSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let overflowed = Arc::new(AtomicBool::new(false));

    let sink = RawSink {
        tx,
        overflowed: Arc::clone(&overflowed),
        dropped: Arc::new(AtomicU64::new(0)),
    };
    let source = RawSource { rx, overflowed };
    (sink, source)
}

/// Producer half of the raw queue.
#[derive(Debug, Clone)]
pub struct RawSink {
    tx: mpsc::Sender<RawNotification>,
    overflowed: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl RawSink {
    /// Queue a notification without blocking. Returns false if it was
    /// dropped.
    pub fn send(&self, notification: RawNotification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                self.overflowed.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a change notification.
    pub fn change(&self, path: impl Into<PathBuf>, op: Op) -> bool {
        self.send(RawNotification::Change {
            path: path.into(),
            op,
        })
    }

    /// Report that notifications were lost upstream of this sink.
    ///
    /// On a full queue the overflow flag is raised instead.
    pub fn overflow(&self) -> bool {
        self.send(RawNotification::Overflow)
    }

    /// Report a backend runtime error.
    pub fn error(&self, message: impl Into<String>) -> bool {
        self.send(RawNotification::Error(message.into()))
    }

    /// Number of notifications dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Whether the consumer side is gone.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the raw queue.
#[derive(Debug)]
pub struct RawSource {
    rx: mpsc::Receiver<RawNotification>,
    overflowed: Arc<AtomicBool>,
}

impl RawSource {
    /// Wait for the next notification. Returns `None` once every sink is
    /// dropped and the queue is empty.
    pub async fn read_raw(&mut self) -> Option<RawNotification> {
        if let Some(notification) = self.try_read_raw() {
            return Some(notification);
        }
        self.rx.recv().await
    }

    /// Take the next notification if one is ready.
    ///
    /// Queued notifications come first; a pending overflow is reported once
    /// the queue is empty, since the dropped notifications were newer than
    /// everything that was queued.
    pub fn try_read_raw(&mut self) -> Option<RawNotification> {
        match self.rx.try_recv() {
            Ok(notification) => Some(notification),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => self
                .overflowed
                .swap(false, Ordering::AcqRel)
                .then_some(RawNotification::Overflow),
        }
    }
}
