//! The public watcher and its normalization task.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{Backend, NotifyBackend, RawNotification, RawSink, RawSource, raw_channel};
use crate::config::WatcherConfig;
use crate::error::{Result, WatcherError};
use crate::event::Event;
use crate::op::Op;
use crate::recursive::{find_dirs, recursive_path};
use crate::registry::{ScannedWatch, WatchRegistry};
use crate::rlimit;

struct State {
    registry: WatchRegistry,
    backend: Box<dyn Backend>,
}

struct Shared {
    state: Mutex<State>,
    config: WatcherConfig,
    supports_recursion: bool,
    closed: AtomicBool,
}

impl Shared {
    fn capacity(&self) -> Option<u64> {
        self.config.watch_capacity(rlimit::effective_limit())
    }
}

/// Watches files and directories and delivers normalized events.
///
/// Must be created inside a Tokio runtime: a background task moves raw
/// backend notifications onto the event and error streams.
pub struct Watcher {
    shared: Arc<Shared>,
    events: Mutex<mpsc::Receiver<Event>>,
    errors: Mutex<mpsc::Receiver<WatcherError>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watcher {
    /// Create a watcher using the platform's recommended backend.
    pub fn new(config: WatcherConfig) -> Result<Self> {
        Self::with_backend(config, NotifyBackend::new)
    }

    /// Create a watcher whose backend is built by `make_backend` from the
    /// sink it must push raw notifications into.
    pub fn with_backend<B, F>(config: WatcherConfig, make_backend: F) -> Result<Self>
    where
        B: Backend,
        F: FnOnce(RawSink) -> Result<B>,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| WatcherError::NoRuntime)?;

        // Must complete before the first registration.
        let limit = rlimit::raise_and_cache();
        debug!("Descriptor limit: {limit}");

        let (sink, source) = raw_channel(config.raw_capacity);
        let backend = make_backend(sink)?;
        let backend_name = backend.name();
        let supports_recursion = backend.supports_recursion();

        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(config.error_capacity.max(1));

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                registry: WatchRegistry::new(),
                backend: Box::new(backend),
            }),
            config,
            supports_recursion,
            closed: AtomicBool::new(false),
        });

        let cancel = CancellationToken::new();
        let normalizer = Normalizer {
            shared: Arc::clone(&shared),
            source,
            event_tx,
            error_tx,
            cancel: cancel.clone(),
            overflow_reported: false,
        };
        let task = runtime.spawn(normalizer.run());

        info!("File watcher started ({backend_name} backend)");

        Ok(Self {
            shared,
            events: Mutex::new(event_rx),
            errors: Mutex::new(error_rx),
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Watch `path`. A trailing `...` segment (`dir/...`) watches the whole
    /// subtree.
    pub async fn add(&self, path: impl AsRef<Path>) -> Result<()> {
        let (base, recursive) = recursive_path(path.as_ref());
        self.watch(base, recursive).await
    }

    /// Watch `path`, and every directory below it if `recursive` is set.
    ///
    /// Fails without side effects: either every directory is registered or
    /// none is.
    pub async fn watch(&self, path: impl AsRef<Path>, recursive: bool) -> Result<()> {
        self.ensure_open()?;
        let path = non_empty(path.as_ref());
        if recursive && !self.shared.supports_recursion {
            return Err(WatcherError::RecursionUnsupported);
        }

        // Walk the tree before taking the lock.
        let scanned = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || ScannedWatch::scan(&path, recursive))
                .await
                .map_err(io::Error::from)??
        };

        let mut state = self.shared.state.lock().await;
        self.ensure_open()?;

        let capacity = self.shared.capacity();
        let State { registry, backend } = &mut *state;
        registry.insert(scanned, backend.as_mut(), capacity)?;

        info!(
            "Watching {}{} ({} directories registered)",
            path.display(),
            if recursive { " recursively" } else { "" },
            registry.registered_count()
        );
        Ok(())
    }

    /// Stop watching `path`. Accepts the same `...` suffix as [`Watcher::add`].
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<()> {
        self.ensure_open()?;
        let (base, _) = recursive_path(path.as_ref());
        let path = non_empty(&base);

        let mut state = self.shared.state.lock().await;
        self.ensure_open()?;

        let State { registry, backend } = &mut *state;
        registry.remove(&path, backend.as_mut())?;

        info!("Removed watch: {}", path.display());
        Ok(())
    }

    /// Paths currently watched, as they were passed to [`Watcher::add`].
    pub async fn watch_list(&self) -> Vec<PathBuf> {
        self.shared.state.lock().await.registry.watch_list()
    }

    /// Wait for the next event. Returns `None` once the watcher is closed.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }

    /// Wait for the next runtime error. Returns `None` once the watcher is
    /// closed.
    pub async fn next_error(&self) -> Option<WatcherError> {
        self.errors.lock().await.recv().await
    }

    /// The event stream.
    pub fn events(&self) -> &Mutex<mpsc::Receiver<Event>> {
        &self.events
    }

    /// The error stream (overflows and backend failures).
    pub fn errors(&self) -> &Mutex<mpsc::Receiver<WatcherError>> {
        &self.errors
    }

    /// Whether [`Watcher::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Stop the background task, release every watch, and discard events
    /// that were not yet received. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("Normalizer task failed: {e}");
            }
        }

        let result = {
            let mut state = self.shared.state.lock().await;
            let State { registry, backend } = &mut *state;
            registry.close(backend.as_mut());
            backend.close()
        };

        discard(&mut *self.events.lock().await);
        discard(&mut *self.errors.lock().await);

        info!("File watcher closed");
        result
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(WatcherError::Closed);
        }
        Ok(())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn non_empty(path: &Path) -> PathBuf {
    if path.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        path.to_path_buf()
    }
}

/// Directories to register for a newly created path. Symlinks, files and
/// paths that vanished again yield nothing.
fn scan_new_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    match fs::symlink_metadata(dir) {
        Ok(meta) if meta.is_dir() => find_dirs(dir),
        _ => Ok(Vec::new()),
    }
}

fn discard<T>(rx: &mut mpsc::Receiver<T>) {
    rx.close();
    while rx.try_recv().is_ok() {}
}

/// Moves raw notifications onto the caller-visible streams.
struct Normalizer {
    shared: Arc<Shared>,
    source: RawSource,
    event_tx: mpsc::Sender<Event>,
    error_tx: mpsc::Sender<WatcherError>,
    cancel: CancellationToken,

    /// Set after an overflow is reported, cleared by the next event.
    overflow_reported: bool,
}

impl Normalizer {
    async fn run(mut self) {
        loop {
            let first = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                raw = self.source.read_raw() => match raw {
                    Some(raw) => raw,
                    None => break,
                },
            };

            // Duplicates are only coalesced within one burst.
            let mut last: Option<Event> = None;
            let mut next = Some(first);
            while let Some(raw) = next {
                if !self.handle(raw, &mut last).await {
                    debug!("Normalizer cancelled");
                    return;
                }
                next = self.source.try_read_raw();
            }
        }
        debug!("Normalizer stopped");
    }

    /// Returns false once the watcher is shutting down.
    async fn handle(&mut self, raw: RawNotification, last: &mut Option<Event>) -> bool {
        match raw {
            RawNotification::Overflow => {
                if self.overflow_reported {
                    return true;
                }
                warn!("Event queue overflow, some events were lost");
                self.overflow_reported = true;
                self.report(WatcherError::EventOverflow).await
            }
            RawNotification::Error(message) => self.report(WatcherError::Backend(message)).await,
            RawNotification::Change { path, op } => {
                if op.is_empty() {
                    return true;
                }

                let (event, error) = self.normalize(&path, op).await;
                if let Some(error) = error {
                    if !self.report(error).await {
                        return false;
                    }
                }

                if self.shared.config.coalesce_duplicates && last.as_ref() == Some(&event) {
                    debug!("Dropping duplicate {event}");
                    return true;
                }
                *last = Some(event.clone());
                self.overflow_reported = false;
                self.deliver(event).await
            }
        }
    }

    /// Rewrites the path for the caller and keeps recursive watches in sync
    /// with directories created or removed below them.
    async fn normalize(&self, path: &Path, op: Op) -> (Event, Option<WatcherError>) {
        let mut error = None;

        if op.has(Op::CREATE) && self.shared.config.follow_new_directories {
            let dir = {
                let state = self.shared.state.lock().await;
                let dir = state.registry.watched_path(path);
                state.registry.in_recursive_watch(&dir).then_some(dir)
            };
            if let Some(dir) = dir {
                if let Err(e) = self.follow(dir).await {
                    warn!("Failed to watch new directory {}: {e}", path.display());
                    error = Some(e);
                }
            }
        }

        let mut state = self.shared.state.lock().await;
        let State { registry, backend } = &mut *state;
        if (op.has(Op::REMOVE) || op.has(Op::RENAME)) && registry.is_registered(path) {
            registry.forget_dir(path, backend.as_mut());
        }

        (Event::new(registry.display_path(path), op), error)
    }

    /// Registers a directory created inside a recursive watch, and everything
    /// below it.
    async fn follow(&self, dir: PathBuf) -> Result<()> {
        let found = tokio::task::spawn_blocking(move || scan_new_directory(&dir))
            .await
            .map_err(io::Error::from)??;
        let Some(first) = found.first() else {
            return Ok(());
        };

        let capacity = self.shared.capacity();
        let mut state = self.shared.state.lock().await;
        let State { registry, backend } = &mut *state;
        let added = registry.add_subdirectories(&found, backend.as_mut(), capacity)?;
        if added > 0 {
            debug!("Registered {added} new directories under {}", first.display());
        }
        Ok(())
    }

    async fn deliver(&self, event: Event) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.event_tx.send(event) => res.is_ok(),
        }
    }

    async fn report(&self, error: WatcherError) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.error_tx.send(error) => res.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ManualBackend, ManualHandle};
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn manual(config: WatcherConfig) -> (Watcher, ManualHandle) {
        let mut handle = None;
        let watcher = Watcher::with_backend(config, |sink| {
            let backend = ManualBackend::new(sink);
            handle = Some(backend.handle());
            Ok(backend)
        })
        .unwrap();
        (watcher, handle.unwrap())
    }

    async fn next_event(watcher: &Watcher) -> Event {
        tokio::time::timeout(TIMEOUT, watcher.next_event())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_event_delivered_with_caller_path() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, handle) = manual(WatcherConfig::default());

        watcher.add(temp_dir.path()).await.unwrap();
        handle.emit(temp_dir.path().join("x"), Op::WRITE);

        let event = next_event(&watcher).await;
        assert_eq!(event.path, temp_dir.path().join("x"));
        assert!(event.has(Op::WRITE));
    }

    #[tokio::test]
    async fn test_relative_watch_reports_relative_paths() {
        let (watcher, handle) = manual(WatcherConfig::default());
        let src = std::env::current_dir().unwrap().join("src");

        watcher.add("src").await.unwrap();
        handle.emit(src.join("lib.rs"), Op::CHMOD);

        let event = next_event(&watcher).await;
        assert_eq!(event.path, PathBuf::from("src/lib.rs"));
        assert_eq!(event.to_string(), r#""src/lib.rs": CHMOD"#);
    }

    #[tokio::test]
    async fn test_duplicates_coalesced_within_burst() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, handle) = manual(WatcherConfig::default());
        watcher.add(temp_dir.path()).await.unwrap();

        let x = temp_dir.path().join("x");
        // Hold the registry so the normalizer sees the whole burst at once.
        {
            let _guard = watcher.shared.state.lock().await;
            handle.emit(&x, Op::WRITE);
            handle.emit(&x, Op::WRITE);
            handle.emit(&x, Op::WRITE);
            handle.emit(&x, Op::REMOVE);
        }

        assert_eq!(next_event(&watcher).await, Event::new(&x, Op::WRITE));
        assert_eq!(next_event(&watcher).await, Event::new(&x, Op::REMOVE));
        watcher.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicates_kept_when_configured() {
        let temp_dir = TempDir::new().unwrap();
        let (watcher, handle) = manual(WatcherConfig::default().keep_duplicates());
        watcher.add(temp_dir.path()).await.unwrap();

        let x = temp_dir.path().join("x");
        handle.emit(&x, Op::WRITE);
        handle.emit(&x, Op::WRITE);

        assert_eq!(next_event(&watcher).await, Event::new(&x, Op::WRITE));
        assert_eq!(next_event(&watcher).await, Event::new(&x, Op::WRITE));
    }

    #[tokio::test]
    async fn test_backend_error_on_error_stream() {
        let (watcher, handle) = manual(WatcherConfig::default());
        handle.error("device gone");

        let error = tokio::time::timeout(TIMEOUT, watcher.next_error())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, WatcherError::Backend(m) if m == "device gone"));
    }

    #[tokio::test]
    async fn test_new_directory_in_recursive_watch_is_registered() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let (watcher, handle) = manual(WatcherConfig::default());

        watcher.add(root.join("...")).await.unwrap();
        fs::create_dir_all(root.join("new/inner")).unwrap();
        handle.emit(root.join("new"), Op::CREATE);

        let event = next_event(&watcher).await;
        assert_eq!(event.path, root.join("new"));
        assert_eq!(
            handle.registered(),
            vec![root.clone(), root.join("new"), root.join("new/inner")]
        );

        fs::remove_dir_all(root.join("new")).unwrap();
        handle.emit(root.join("new"), Op::REMOVE);
        next_event(&watcher).await;
        assert_eq!(handle.registered(), vec![root]);
    }

    #[tokio::test]
    async fn test_new_directory_over_capacity_reports_error() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let (watcher, handle) = manual(WatcherConfig::default().with_max_watches(1));

        watcher.add(root.join("...")).await.unwrap();
        fs::create_dir(root.join("new")).unwrap();
        handle.emit(root.join("new"), Op::CREATE);

        let error = tokio::time::timeout(TIMEOUT, watcher.next_error())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(error, WatcherError::TooManyWatches { limit: 1 }));
        // The event itself is still delivered.
        assert_eq!(next_event(&watcher).await.path, root.join("new"));
        assert_eq!(handle.registered(), vec![root]);
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = Watcher::with_backend(WatcherConfig::default(), |sink| {
            Ok(ManualBackend::new(sink))
        });
        assert!(matches!(result, Err(WatcherError::NoRuntime)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_recursive_add_does_not_hold_registry_during_walk() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        for i in 0..20 {
            fs::create_dir_all(root.join(format!("d{i}/inner"))).unwrap();
        }
        let (watcher, handle) = manual(WatcherConfig::default());
        watcher.add(&root).await.unwrap();
        let watcher = std::sync::Arc::new(watcher);

        // Events keep flowing while a recursive add walks its tree.
        let adder = {
            let watcher = std::sync::Arc::clone(&watcher);
            let sub = root.join("d0/...");
            tokio::spawn(async move { watcher.add(sub).await })
        };
        handle.emit(root.join("x"), Op::WRITE);
        assert_eq!(next_event(&watcher).await.path, root.join("x"));

        adder.await.unwrap().unwrap();
        assert!(handle.registered().contains(&root.join("d0/inner")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_directory_through_symlinked_parent() {
        let temp_dir = TempDir::new().unwrap();
        let real = temp_dir.path().join("real");
        fs::create_dir_all(real.join("a")).unwrap();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let a = link.join("a");

        let (watcher, handle) = manual(WatcherConfig::default());
        watcher.add(a.join("...")).await.unwrap();

        // Backends may report the symlink-resolved location.
        fs::create_dir(real.join("a/new")).unwrap();
        let resolved = fs::canonicalize(real.join("a")).unwrap();
        handle.emit(resolved.join("new"), Op::CREATE);

        let event = next_event(&watcher).await;
        assert_eq!(event.path, a.join("new"));
        assert_eq!(handle.registered(), vec![a.clone(), a.join("new")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_new_symlink_in_recursive_watch_is_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().to_path_buf();
        let outside = TempDir::new().unwrap();
        let (watcher, handle) = manual(WatcherConfig::default());

        watcher.add(root.join("...")).await.unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();
        handle.emit(root.join("link"), Op::CREATE);

        assert_eq!(next_event(&watcher).await.path, root.join("link"));
        assert_eq!(handle.registered(), vec![root]);
    }

    #[tokio::test]
    async fn test_empty_base_watches_current_directory() {
        let (watcher, handle) = manual(WatcherConfig::default());
        watcher.watch("", false).await.unwrap();

        assert_eq!(watcher.watch_list().await, vec![PathBuf::from(".")]);
        assert_eq!(
            handle.registered(),
            vec![std::env::current_dir().unwrap()]
        );
    }
}
