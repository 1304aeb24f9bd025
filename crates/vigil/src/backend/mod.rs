//! Watcher backends
//!
//! Every platform backend implements the same small surface: watches are
//! added and removed from caller threads, a worker thread turns kernel
//! signals (or rescans) into listener callbacks. The orchestrator picks
//! one backend at construction and keeps it as a tagged variant.

use crate::error::Result;
use crate::event::WatchId;
use crate::watch::WatchInfo;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub(crate) mod poll;

#[cfg(target_os = "linux")]
pub(crate) mod inotify;

#[cfg(target_os = "macos")]
pub(crate) mod fsevents;

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) mod kqueue;

#[cfg(target_os = "windows")]
pub(crate) mod windows;

/// Operations every backend supports.
///
/// `remove` is idempotent; removing an unknown id is a no-op and removal
/// of a watch that is currently delivering blocks until the in-flight
/// callback returns. `start` and `stop` are idempotent as well.
pub(crate) trait Backend: Send + Sync {
    fn add(&self, watch: Arc<WatchInfo>) -> Result<WatchId>;
    fn remove(&self, id: WatchId);
    fn remove_by_root(&self, root: &Path);
    fn list_roots(&self) -> Vec<PathBuf>;
    fn start(&self) -> Result<()>;
    fn stop(&self);
}

/// The backend selected for a watcher instance.
pub(crate) enum PlatformBackend {
    Poll(poll::PollWatcher),
    #[cfg(target_os = "linux")]
    Inotify(inotify::InotifyWatcher),
    #[cfg(target_os = "macos")]
    FsEvents(fsevents::FsEventsWatcher),
    #[cfg(any(
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    Kqueue(kqueue::KqueueWatcher),
    #[cfg(target_os = "windows")]
    Windows(windows::WinWatcher),
}

impl PlatformBackend {
    /// Constructs the native backend for the host platform.
    ///
    /// Errors here mean the kernel interface itself is unavailable; the
    /// orchestrator then degrades to the polling backend.
    pub fn native() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            Ok(Self::Inotify(inotify::InotifyWatcher::new()?))
        }
        #[cfg(target_os = "macos")]
        {
            Ok(Self::FsEvents(fsevents::FsEventsWatcher::new()))
        }
        #[cfg(any(
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        ))]
        {
            Ok(Self::Kqueue(kqueue::KqueueWatcher::new()?))
        }
        #[cfg(target_os = "windows")]
        {
            Ok(Self::Windows(windows::WinWatcher::new()?))
        }
        #[cfg(not(any(
            target_os = "linux",
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly",
            target_os = "windows"
        )))]
        {
            Ok(Self::Poll(poll::PollWatcher::with_default_interval()))
        }
    }

    /// True when this backend derives events by polling rather than from
    /// a kernel interface. Polling covers remote filesystems.
    pub fn is_polling(&self) -> bool {
        matches!(self, Self::Poll(_))
    }

    fn as_backend(&self) -> &dyn Backend {
        match self {
            Self::Poll(backend) => backend,
            #[cfg(target_os = "linux")]
            Self::Inotify(backend) => backend,
            #[cfg(target_os = "macos")]
            Self::FsEvents(backend) => backend,
            #[cfg(any(
                target_os = "freebsd",
                target_os = "netbsd",
                target_os = "openbsd",
                target_os = "dragonfly"
            ))]
            Self::Kqueue(backend) => backend,
            #[cfg(target_os = "windows")]
            Self::Windows(backend) => backend,
        }
    }
}

impl Backend for PlatformBackend {
    fn add(&self, watch: Arc<WatchInfo>) -> Result<WatchId> {
        self.as_backend().add(watch)
    }

    fn remove(&self, id: WatchId) {
        self.as_backend().remove(id)
    }

    fn remove_by_root(&self, root: &Path) {
        self.as_backend().remove_by_root(root)
    }

    fn list_roots(&self) -> Vec<PathBuf> {
        self.as_backend().list_roots()
    }

    fn start(&self) -> Result<()> {
        self.as_backend().start()
    }

    fn stop(&self) {
        self.as_backend().stop()
    }
}
