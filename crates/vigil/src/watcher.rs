//! The watcher orchestrator
//!
//! `FileWatcher` owns one backend, hands out watch ids and validates
//! roots before they reach it. Everything heavier (worker threads,
//! kernel handles, event derivation, the watch registry itself) lives
//! in the backend.

use crate::backend::{Backend, PlatformBackend};
use crate::error::{self, Error, Result};
use crate::event::{WatchId, WatchListener};
use crate::fsutil;
use crate::options::WatcherOption;
use crate::watch::WatchInfo;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cross-platform filesystem watcher.
///
/// Listeners receive [`Event`](crate::Event)s on a background worker
/// thread. Watches can be added and removed from any thread, including
/// from inside a listener callback.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vigil::{Event, FileWatcher};
///
/// let watcher = FileWatcher::new()?;
/// let id = watcher.add_watch(
///     "/tmp/some-dir",
///     Arc::new(|event: &Event| {
///         println!("{} {}", event.action, event.filename.display());
///     }),
///     false,
/// )?;
/// // ... later
/// watcher.remove_watch_id(id);
/// # Ok::<(), vigil::Error>(())
/// ```
pub struct FileWatcher {
    backend: PlatformBackend,
    next_id: AtomicI64,
    follow_symlinks: AtomicBool,
    allow_out_of_scope: AtomicBool,
}

impl FileWatcher {
    /// Creates a watcher on the platform's native notification interface.
    ///
    /// If the native interface cannot be brought up the watcher degrades
    /// to the generic (polling) backend instead of failing.
    pub fn new() -> Result<Self> {
        let backend = match PlatformBackend::native() {
            Ok(backend) => backend,
            Err(err) => {
                warn!("native watcher unavailable ({err}), falling back to polling");
                PlatformBackend::Poll(crate::backend::poll::PollWatcher::with_default_interval())
            }
        };
        Ok(Self::with_backend(backend))
    }

    /// Creates a watcher that always uses the generic (polling) backend.
    ///
    /// This is the right choice for directories on network shares or
    /// FUSE mounts, which native interfaces cannot observe.
    pub fn new_generic() -> Result<Self> {
        Ok(Self::with_backend(PlatformBackend::Poll(
            crate::backend::poll::PollWatcher::with_default_interval(),
        )))
    }

    /// Generic watcher with a custom rescan interval.
    ///
    /// The interval has a floor of 100 ms.
    pub fn new_generic_with_interval(interval: Duration) -> Result<Self> {
        Ok(Self::with_backend(PlatformBackend::Poll(
            crate::backend::poll::PollWatcher::new(interval),
        )))
    }

    fn with_backend(backend: PlatformBackend) -> Self {
        Self {
            backend,
            next_id: AtomicI64::new(1),
            follow_symlinks: AtomicBool::new(false),
            allow_out_of_scope: AtomicBool::new(false),
        }
    }

    /// Adds a watch on `directory` and returns its id.
    ///
    /// The listener is shared with the backend worker and kept alive for
    /// the lifetime of the watch. With `recursive`, all current and
    /// future subdirectories are covered too.
    pub fn add_watch(
        &self,
        directory: impl AsRef<Path>,
        listener: Arc<dyn WatchListener>,
        recursive: bool,
    ) -> Result<WatchId> {
        self.add_watch_with_options(directory, listener, recursive, Vec::new())
    }

    /// [`add_watch`](Self::add_watch) with backend-specific options.
    pub fn add_watch_with_options(
        &self,
        directory: impl AsRef<Path>,
        listener: Arc<dyn WatchListener>,
        recursive: bool,
        options: Vec<WatcherOption>,
    ) -> Result<WatchId> {
        let directory = directory.as_ref();
        self.try_add_watch(directory, listener, recursive, options)
            .map_err(error::log_error)
    }

    fn try_add_watch(
        &self,
        directory: &Path,
        listener: Arc<dyn WatchListener>,
        recursive: bool,
        options: Vec<WatcherOption>,
    ) -> Result<WatchId> {
        if directory.as_os_str().is_empty() {
            return Err(Error::FileNotFound(PathBuf::new()));
        }
        let root = fsutil::canonicalize_root(directory)
            .map_err(|_| Error::FileNotFound(directory.to_path_buf()))?;

        // The root itself may be a symlink; what matters is that it
        // resolves to a directory.
        if !std::fs::metadata(&root).map(|meta| meta.is_dir()).unwrap_or(false) {
            return Err(Error::FileNotFound(root));
        }
        if let Err(err) = std::fs::read_dir(&root) {
            return Err(match err.kind() {
                std::io::ErrorKind::PermissionDenied => Error::FileNotReadable(root),
                _ => Error::FileNotFound(root),
            });
        }
        if self.backend.list_roots().contains(&root) {
            return Err(Error::FileRepeated(root));
        }
        if !self.backend.is_polling() && fsutil::is_remote(&root) {
            return Err(Error::FileRemote(root));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = WatchInfo::new(
            id,
            root.clone(),
            listener,
            recursive,
            self.follow_symlinks.load(Ordering::Relaxed),
            self.allow_out_of_scope.load(Ordering::Relaxed),
            options,
        );
        self.backend.add(info)?;
        debug!(id, root = %root.display(), recursive, "watch added");

        // The worker comes up with the first watch.
        if let Err(err) = self.watch() {
            self.backend.remove(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Starts event delivery. Idempotent, and invoked automatically by
    /// the first successful [`add_watch`](Self::add_watch).
    pub fn watch(&self) -> Result<()> {
        self.backend.start().map_err(error::log_error)
    }

    /// Removes a watch by id. Unknown ids are ignored.
    ///
    /// Returns after any in-flight callback for the backend has finished,
    /// so the listener is not invoked for this watch once this returns.
    pub fn remove_watch_id(&self, id: WatchId) {
        self.backend.remove(id);
    }

    /// Removes a watch by its directory. The path is normalized the same
    /// way `add_watch` normalizes it; the oldest match wins. Unknown
    /// paths are ignored.
    pub fn remove_watch(&self, directory: impl AsRef<Path>) {
        let Ok(root) = fsutil::canonicalize_root(directory.as_ref()) else {
            return;
        };
        self.backend.remove_by_root(&root);
    }

    /// The directories currently being watched.
    pub fn directories(&self) -> Vec<PathBuf> {
        self.backend.list_roots()
    }

    /// Whether recursive watches descend into symlinked directories.
    /// Off by default. The flag is read when a watch is added.
    pub fn set_follow_symlinks(&self, follow: bool) {
        self.follow_symlinks.store(follow, Ordering::Relaxed);
    }

    pub fn follow_symlinks(&self) -> bool {
        self.follow_symlinks.load(Ordering::Relaxed)
    }

    /// Whether followed symlinks may point outside the watched root.
    /// Off by default; only meaningful with
    /// [`set_follow_symlinks`](Self::set_follow_symlinks).
    pub fn set_allow_out_of_scope_links(&self, allow: bool) {
        self.allow_out_of_scope.store(allow, Ordering::Relaxed);
    }

    pub fn allow_out_of_scope_links(&self) -> bool {
        self.allow_out_of_scope.load(Ordering::Relaxed)
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.backend.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use tempfile::TempDir;

    fn noop() -> Arc<dyn WatchListener> {
        Arc::new(|_: &Event| {})
    }

    #[test]
    fn ids_are_positive_and_monotonic() {
        let tmp_a = TempDir::new().unwrap();
        let tmp_b = TempDir::new().unwrap();
        let watcher = FileWatcher::new_generic().unwrap();

        let a = watcher.add_watch(tmp_a.path(), noop(), false).unwrap();
        let b = watcher.add_watch(tmp_b.path(), noop(), false).unwrap();
        assert!(a > 0);
        assert!(b > a);
    }

    #[test]
    fn missing_root_is_rejected() {
        let watcher = FileWatcher::new_generic().unwrap();
        let err = watcher
            .add_watch("/definitely/not/here", noop(), false)
            .unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
        assert_eq!(err.code(), -1);

        let err = watcher.add_watch("", noop(), false).unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)));
    }

    #[test]
    fn duplicate_root_is_rejected_and_first_watch_survives() {
        let tmp = TempDir::new().unwrap();
        let watcher = FileWatcher::new_generic().unwrap();

        let first = watcher.add_watch(tmp.path(), noop(), false).unwrap();
        let err = watcher.add_watch(tmp.path(), noop(), false).unwrap_err();
        assert!(matches!(err, Error::FileRepeated(_)));
        assert_eq!(err.code(), -2);
        assert_eq!(watcher.directories().len(), 1);

        watcher.remove_watch_id(first);
        assert!(watcher.directories().is_empty());
    }

    #[test]
    fn removal_is_idempotent_and_by_path_works() {
        let tmp = TempDir::new().unwrap();
        let watcher = FileWatcher::new_generic().unwrap();

        watcher.add_watch(tmp.path(), noop(), false).unwrap();
        watcher.remove_watch(tmp.path());
        assert!(watcher.directories().is_empty());

        // No-ops.
        watcher.remove_watch(tmp.path());
        watcher.remove_watch_id(42);
        watcher.remove_watch("/never/watched");
    }

    #[test]
    fn symlink_flags_round_trip() {
        let watcher = FileWatcher::new_generic().unwrap();
        assert!(!watcher.follow_symlinks());
        assert!(!watcher.allow_out_of_scope_links());
        watcher.set_follow_symlinks(true);
        watcher.set_allow_out_of_scope_links(true);
        assert!(watcher.follow_symlinks());
        assert!(watcher.allow_out_of_scope_links());
    }

    #[test]
    fn watch_is_idempotent() {
        let watcher = FileWatcher::new_generic().unwrap();
        watcher.watch().unwrap();
        watcher.watch().unwrap();
    }
}
