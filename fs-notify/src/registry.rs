//! Bookkeeping of watched paths and their backend registrations.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{Result, WatcherError};
use crate::recursive::find_dirs;

/// A watch request resolved against the file system, ready to register.
///
/// Scanning does blocking I/O and needs no registry state, so it can run
/// before the registry is locked.
#[derive(Debug, Clone)]
pub struct ScannedWatch {
    path: PathBuf,
    recursive: bool,

    /// Lexically absolute root.
    root: PathBuf,

    /// The root with symlinks resolved, when that differs from `root`.
    resolved: Option<PathBuf>,

    dirs: Vec<PathBuf>,
}

impl ScannedWatch {
    /// Collect the directories `path` needs registered: `path` alone, or
    /// `path` and every directory below it when `recursive` is set.
    pub fn scan(path: &Path, recursive: bool) -> Result<Self> {
        let root = absolute(path)?;
        let dirs = if recursive {
            find_dirs(path)?
        } else {
            fs::metadata(&root)?;
            vec![root.clone()]
        };
        let resolved = fs::canonicalize(&root).ok().filter(|r| *r != root);

        Ok(Self {
            path: path.to_path_buf(),
            recursive,
            root,
            resolved,
            dirs,
        })
    }

    /// Directories that will be registered, root first.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }
}

/// A path added by the caller.
#[derive(Debug, Clone)]
struct WatchEntry {
    /// The path exactly as the caller passed it (without `...`).
    display: PathBuf,

    recursive: bool,

    /// Where backends that resolve symlinks report this root.
    resolved: Option<PathBuf>,

    /// Absolute directories registered for this watch, root first.
    dirs: Vec<PathBuf>,
}

/// Maps watched paths to the directories registered with a backend.
///
/// Directories are reference counted, so overlapping watches share a single
/// backend registration. Every mutation is all or nothing: if a registration
/// fails partway through, the directories registered by that call are
/// unregistered again before the error is returned.
///
/// Paths are kept in the lexical form the caller used. Paths reported by a
/// backend are mapped back onto that form first, since some backends report
/// symlink-resolved paths.
#[derive(Debug, Default)]
pub struct WatchRegistry {
    /// Keyed by absolute root.
    watches: HashMap<PathBuf, WatchEntry>,

    /// Registered directory -> number of watches using it.
    dirs: HashMap<PathBuf, usize>,
}

impl WatchRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `path`, expanding it to every directory below it when
    /// `recursive` is set.
    ///
    /// `capacity` bounds the number of distinct registered directories.
    /// Adding a path that is already watched replaces the old watch.
    pub fn add(
        &mut self,
        path: &Path,
        recursive: bool,
        backend: &mut dyn Backend,
        capacity: Option<u64>,
    ) -> Result<()> {
        if recursive && !backend.supports_recursion() {
            return Err(WatcherError::RecursionUnsupported);
        }
        let scanned = ScannedWatch::scan(path, recursive)?;
        self.insert(scanned, backend, capacity)
    }

    /// Register a watch scanned with [`ScannedWatch::scan`]. Same rules as
    /// [`WatchRegistry::add`].
    pub fn insert(
        &mut self,
        scanned: ScannedWatch,
        backend: &mut dyn Backend,
        capacity: Option<u64>,
    ) -> Result<()> {
        if scanned.recursive && !backend.supports_recursion() {
            return Err(WatcherError::RecursionUnsupported);
        }

        self.acquire(&scanned.dirs, backend, capacity)?;

        let entry = WatchEntry {
            display: scanned.path,
            recursive: scanned.recursive,
            resolved: scanned.resolved,
            dirs: scanned.dirs,
        };
        if let Some(old) = self.watches.insert(scanned.root, entry) {
            self.release(&old.dirs, backend);
        }
        Ok(())
    }

    /// Stop watching `path`.
    pub fn remove(&mut self, path: &Path, backend: &mut dyn Backend) -> Result<()> {
        let root = absolute(path)?;
        let Some(entry) = self.watches.remove(&root) else {
            return Err(WatcherError::NonExistentWatch(path.to_path_buf()));
        };
        self.release(&entry.dirs, backend);
        Ok(())
    }

    /// Release every registration. Safe to call more than once.
    pub fn close(&mut self, backend: &mut dyn Backend) {
        for (dir, _) in self.dirs.drain() {
            if let Err(e) = backend.unwatch_dir(&dir) {
                debug!("Failed to unwatch {} on close: {e}", dir.display());
            }
        }
        self.watches.clear();
    }

    /// Paths currently watched, as the caller passed them.
    pub fn watch_list(&self) -> Vec<PathBuf> {
        let mut list: Vec<PathBuf> = self.watches.values().map(|w| w.display.clone()).collect();
        list.sort();
        list
    }

    /// Number of distinct directories registered with the backend.
    pub fn registered_count(&self) -> usize {
        self.dirs.len()
    }

    /// Whether `dir` is registered with the backend.
    pub fn is_registered(&self, dir: &Path) -> bool {
        self.dirs.contains_key(&self.watched_path(dir))
    }

    /// Whether `path` lies strictly inside a recursive watch.
    pub fn in_recursive_watch(&self, path: &Path) -> bool {
        let path = self.watched_path(path);
        self.recursive_roots(&path).next().is_some()
    }

    /// Map a path reported by a backend onto the lexical root it is watched
    /// through. The most specific root wins; on a tie the path is kept as
    /// reported. Paths outside every root are returned unchanged.
    pub fn watched_path(&self, path: &Path) -> PathBuf {
        let mut best: Option<(usize, bool, PathBuf)> = None;
        let mut consider = |depth: usize, as_reported: bool, mapped: PathBuf| {
            let better = match &best {
                Some((d, r, _)) => (depth, as_reported) > (*d, *r),
                None => true,
            };
            if better {
                best = Some((depth, as_reported, mapped));
            }
        };

        for (root, w) in &self.watches {
            if path.starts_with(root) {
                consider(root.components().count(), true, path.to_path_buf());
            }
            let Some(resolved) = &w.resolved else {
                continue;
            };
            if let Ok(rel) = path.strip_prefix(resolved) {
                let mapped = if rel.as_os_str().is_empty() {
                    root.clone()
                } else {
                    root.join(rel)
                };
                consider(resolved.components().count(), false, mapped);
            }
        }

        best.map_or_else(|| path.to_path_buf(), |(_, _, mapped)| mapped)
    }

    /// Register directories created inside recursive watches. `found` is the
    /// new directory followed by everything below it, as [`find_dirs`]
    /// returns them for a path from [`WatchRegistry::watched_path`].
    ///
    /// Either every containing watch gets the new directories or none does.
    /// Returns the number of registrations added across watches.
    pub fn add_subdirectories(
        &mut self,
        found: &[PathBuf],
        backend: &mut dyn Backend,
        capacity: Option<u64>,
    ) -> Result<usize> {
        let Some(dir) = found.first() else {
            return Ok(0);
        };

        let plan: Vec<(PathBuf, Vec<PathBuf>)> = self
            .recursive_roots(dir)
            .map(|(root, w)| {
                let new_dirs: Vec<PathBuf> = found
                    .iter()
                    .filter(|d| !w.dirs.contains(d))
                    .cloned()
                    .collect();
                (root.clone(), new_dirs)
            })
            .filter(|(_, new_dirs)| !new_dirs.is_empty())
            .collect();

        for (i, (_, new_dirs)) in plan.iter().enumerate() {
            if let Err(e) = self.acquire(new_dirs, backend, capacity) {
                for (_, done) in &plan[..i] {
                    self.release(done, backend);
                }
                return Err(e);
            }
        }

        let mut added = 0;
        for (root, new_dirs) in plan {
            added += new_dirs.len();
            if let Some(w) = self.watches.get_mut(&root) {
                w.dirs.extend(new_dirs);
            }
        }
        Ok(added)
    }

    /// Drop a registered directory, and every directory below it, that no
    /// longer exists at its path.
    pub fn forget_dir(&mut self, dir: &Path, backend: &mut dyn Backend) {
        let dir = self.watched_path(dir);
        let gone: Vec<PathBuf> = self
            .dirs
            .keys()
            .filter(|d| d.starts_with(&dir))
            .cloned()
            .collect();

        for d in &gone {
            self.dirs.remove(d);
            // The OS usually dropped the watch already.
            if let Err(e) = backend.unwatch_dir(d) {
                debug!("Unwatch of vanished {} failed: {e}", d.display());
            }
        }
        for w in self.watches.values_mut() {
            w.dirs.retain(|d| !gone.contains(d));
        }
    }

    /// Rewrite a backend path onto the watch root the caller used, picking
    /// the most specific root. Paths outside every root are returned as-is.
    pub fn display_path(&self, path: &Path) -> PathBuf {
        let path = self.watched_path(path);
        let best = self
            .watches
            .iter()
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count());

        let Some((root, w)) = best else {
            return path;
        };
        match path.strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => w.display.clone(),
            Ok(rel) => w.display.join(rel),
            Err(_) => path.clone(),
        }
    }

    /// Recursive watches strictly containing `path`.
    fn recursive_roots<'a>(
        &'a self,
        path: &'a Path,
    ) -> impl Iterator<Item = (&'a PathBuf, &'a WatchEntry)> + 'a {
        self.watches
            .iter()
            .filter(move |(root, w)| w.recursive && path != root.as_path() && path.starts_with(root))
    }

    fn acquire(
        &mut self,
        dirs: &[PathBuf],
        backend: &mut dyn Backend,
        capacity: Option<u64>,
    ) -> Result<()> {
        for (i, dir) in dirs.iter().enumerate() {
            if let Err(e) = self.acquire_one(dir, backend, capacity) {
                if i > 0 {
                    warn!(
                        "Registration of {} failed, rolling back {i} directories",
                        dir.display()
                    );
                }
                self.release(&dirs[..i], backend);
                return Err(e);
            }
        }
        Ok(())
    }

    fn acquire_one(
        &mut self,
        dir: &Path,
        backend: &mut dyn Backend,
        capacity: Option<u64>,
    ) -> Result<()> {
        if let Some(refs) = self.dirs.get_mut(dir) {
            *refs += 1;
            return Ok(());
        }

        if let Some(limit) = capacity {
            if self.dirs.len() as u64 >= limit {
                return Err(WatcherError::TooManyWatches { limit });
            }
        }

        backend.watch_dir(dir)?;
        debug!("Registered {} with {} backend", dir.display(), backend.name());
        self.dirs.insert(dir.to_path_buf(), 1);
        Ok(())
    }

    fn release(&mut self, dirs: &[PathBuf], backend: &mut dyn Backend) {
        for dir in dirs {
            let Some(refs) = self.dirs.get_mut(dir) else {
                continue;
            };
            *refs -= 1;
            if *refs > 0 {
                continue;
            }
            self.dirs.remove(dir);
            if let Err(e) = backend.unwatch_dir(dir) {
                debug!("Failed to unwatch {}: {e}", dir.display());
            }
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    Ok(path.absolutize()?.into_owned())
}
