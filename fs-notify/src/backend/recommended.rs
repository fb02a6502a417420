//! Backend built on the platform's recommended `notify` watcher.
//!
//! Every registration is non-recursive; recursion is emulated by the registry
//! so all platforms behave the same.

use std::path::{Path, PathBuf};

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use tracing::{debug, error, warn};

use crate::backend::{Backend, RawSink};
use crate::error::{Result, WatcherError};
use crate::op::Op;

/// Backend using [`notify::RecommendedWatcher`].
pub struct NotifyBackend {
    watcher: Option<RecommendedWatcher>,
}

impl NotifyBackend {
    /// Create a backend that forwards notifications into `sink`.
    pub fn new(sink: RawSink) -> Result<Self> {
        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => forward(&sink, &event),
                Err(e) => {
                    error!("Watch error: {e}");
                    sink.error(e.to_string());
                }
            },
        )?;

        Ok(Self {
            watcher: Some(watcher),
        })
    }
}

impl Backend for NotifyBackend {
    fn name(&self) -> &'static str {
        "notify"
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatcherError::Closed);
        };
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) -> Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Err(WatcherError::Closed);
        };
        watcher.unwatch(dir)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the watcher stops its event thread.
        self.watcher = None;
        Ok(())
    }
}

fn forward(sink: &RawSink, event: &notify::Event) {
    if event.need_rescan() {
        warn!("Backend requested rescan; events were dropped");
        sink.overflow();
    }

    for (path, op) in translate(event) {
        if !sink.change(path, op) && !sink.is_closed() {
            debug!("Raw queue full, dropped {op} notification");
        }
    }
}

/// Map a `notify` event onto `(path, op)` pairs.
///
/// Access events carry no change and are dropped. A rename reported with both
/// paths becomes RENAME for the old path and CREATE for the new one.
pub fn translate(event: &notify::Event) -> Vec<(PathBuf, Op)> {
    let op = match event.kind {
        EventKind::Create(_) => Op::CREATE,
        EventKind::Remove(_) => Op::REMOVE,
        EventKind::Modify(ModifyKind::Metadata(_)) => Op::CHMOD,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Op::CREATE,
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.iter();
            return paths
                .next()
                .map(|from| (from.clone(), Op::RENAME))
                .into_iter()
                .chain(paths.next().map(|to| (to.clone(), Op::CREATE)))
                .collect();
        }
        EventKind::Modify(ModifyKind::Name(_)) => Op::RENAME,
        EventKind::Modify(_) => Op::WRITE,
        EventKind::Access(_) | EventKind::Any | EventKind::Other => return Vec::new(),
    };

    event.paths.iter().map(|path| (path.clone(), op)).collect()
}
