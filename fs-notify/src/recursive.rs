//! Recursive watch emulation.
//!
//! Backends that only watch single directories get recursion by enumerating
//! every directory of a subtree up front and registering each one. A request
//! is marked recursive by ending it with a `...` path segment, e.g.
//! `src/...`.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use path_absolutize::Absolutize;
use walkdir::WalkDir;

use crate::error::{Result, WatcherError};

/// Trailing path segment that marks a recursive watch request.
pub const RECURSIVE_MARKER: &str = "...";

/// Splits a watch request into its base path and whether it is recursive.
///
/// `"a/..."` becomes `("a", true)`, anything else is returned unchanged with
/// `false`. A bare `"..."` has an empty base path.
pub fn recursive_path(path: &Path) -> (PathBuf, bool) {
    if path.file_name() == Some(OsStr::new(RECURSIVE_MARKER)) {
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        return (base, true);
    }
    (path.to_path_buf(), false)
}

/// Finds every directory under `root`, including `root` itself as the first
/// entry.
///
/// The walk is pre-order, sorted by file name, and does not follow symlinks,
/// not even when `root` itself is one.
/// Returned paths are absolute. Any error during traversal fails the whole
/// call.
pub fn find_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    find_dirs_with(root, |_| Ok(()))
}

/// Like [`find_dirs`], calling `visit` for each entry before it is recorded.
/// An error from `visit` aborts the walk.
pub fn find_dirs_with<F>(root: &Path, mut visit: F) -> Result<Vec<PathBuf>>
where
    F: FnMut(&Path) -> io::Result<()>,
{
    let abs_root = root.absolutize()?.into_owned();
    let mut dirs = Vec::with_capacity(8);

    for entry in WalkDir::new(&abs_root)
        .follow_links(false)
        .follow_root_links(false)
        .sort_by_file_name()
    {
        let entry = entry?;
        let is_dir = entry.file_type().is_dir();

        if entry.depth() == 0 && !is_dir {
            return Err(WatcherError::NotDirectory(root.to_path_buf()));
        }

        visit(entry.path())?;

        if is_dir {
            dirs.push(entry.into_path());
        }
    }

    Ok(dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("b/d")).unwrap();
        fs::create_dir_all(root.join("a/c")).unwrap();
        fs::write(root.join("a/file.txt"), b"x").unwrap();
        fs::write(root.join("top.txt"), b"y").unwrap();
        temp_dir
    }

    #[test]
    fn test_recursive_path() {
        assert_eq!(
            recursive_path(Path::new("a/...")),
            (PathBuf::from("a"), true)
        );
        assert_eq!(
            recursive_path(Path::new("/abs/dir/...")),
            (PathBuf::from("/abs/dir"), true)
        );
        assert_eq!(recursive_path(Path::new("...")), (PathBuf::new(), true));
        assert_eq!(recursive_path(Path::new("a")), (PathBuf::from("a"), false));
        assert_eq!(
            recursive_path(Path::new("a/....")),
            (PathBuf::from("a/...."), false)
        );
        assert_eq!(
            recursive_path(Path::new("a/..")),
            (PathBuf::from("a/.."), false)
        );
        assert_eq!(
            recursive_path(Path::new("a.../b")),
            (PathBuf::from("a.../b"), false)
        );
    }

    #[test]
    fn test_recursive_path_reconstructs_input() {
        for input in ["a/...", "...", "/...", "/x/y/...", "a", "a/b", "/", ""] {
            let (base, recursive) = recursive_path(Path::new(input));
            let rebuilt = if recursive {
                base.join(RECURSIVE_MARKER)
            } else {
                base
            };
            assert_eq!(rebuilt, PathBuf::from(input), "input {input:?}");
        }
    }

    #[test]
    fn test_find_dirs_lists_every_directory_root_first() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();

        let dirs = find_dirs(root).unwrap();
        assert_eq!(
            dirs,
            vec![
                root.to_path_buf(),
                root.join("a"),
                root.join("a/c"),
                root.join("b"),
                root.join("b/d"),
            ]
        );
    }

    #[test]
    fn test_find_dirs_single_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dirs = find_dirs(temp_dir.path()).unwrap();
        assert_eq!(dirs, vec![temp_dir.path().to_path_buf()]);
    }

    #[test]
    fn test_find_dirs_returns_absolute_paths() {
        let dirs = find_dirs(Path::new(".")).unwrap();
        assert!(!dirs.is_empty());
        assert!(dirs.iter().all(|d| d.is_absolute()));
    }

    #[test]
    fn test_find_dirs_on_file() {
        let temp_dir = sample_tree();
        let file = temp_dir.path().join("top.txt");

        let err = find_dirs(&file).unwrap_err();
        assert!(matches!(err, WatcherError::NotDirectory(p) if p == file));
    }

    #[test]
    fn test_find_dirs_missing_root() {
        let temp_dir = TempDir::new().unwrap();
        let result = find_dirs(&temp_dir.path().join("missing"));
        assert!(matches!(result, Err(WatcherError::Walk(_))));
    }

    #[test]
    fn test_find_dirs_is_all_or_nothing() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();
        let failing = root.join("b");

        let mut visited = 0;
        let result = find_dirs_with(root, |path| {
            visited += 1;
            if path == failing {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "injected failure",
                ));
            }
            Ok(())
        });

        assert!(matches!(result, Err(WatcherError::Io(_))));
        assert!(visited > 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_dirs_does_not_follow_symlinks() {
        let temp_dir = sample_tree();
        let root = temp_dir.path();
        std::os::unix::fs::symlink(root, root.join("a/loop")).unwrap();

        let dirs = find_dirs(root).unwrap();
        assert_eq!(dirs.len(), 5);
        assert!(!dirs.contains(&root.join("a/loop")));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_dirs_on_symlinked_root() {
        let temp_dir = sample_tree();
        let link = temp_dir.path().join("link");
        std::os::unix::fs::symlink(temp_dir.path().join("a"), &link).unwrap();

        // The root is not resolved: a link to a directory is not a directory.
        let err = find_dirs(&link).unwrap_err();
        assert!(matches!(err, WatcherError::NotDirectory(p) if p == link));

        // Going through the link as a parent is fine.
        let dirs = find_dirs(&link.join("c")).unwrap();
        assert_eq!(dirs, vec![link.join("c")]);
    }
}
