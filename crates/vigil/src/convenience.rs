//! Watch handles and fan-out built on top of [`FileWatcher`]
//!
//! Two small composites over the primitive surface: a scoped watch that
//! cleans up after itself, and a dispatcher that shares one kernel watch
//! per directory between any number of subscribers.

use crate::error::Result;
use crate::event::{Event, WatchId, WatchListener};
use crate::watcher::FileWatcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A watch that removes itself when dropped.
///
/// Owns its listener: the closure lives exactly as long as the watch.
pub struct ScopedWatch<'w> {
    watcher: &'w FileWatcher,
    id: WatchId,
}

impl<'w> ScopedWatch<'w> {
    /// Adds a watch on `directory` that is removed again on drop.
    pub fn new(
        watcher: &'w FileWatcher,
        directory: impl AsRef<Path>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
        recursive: bool,
    ) -> Result<Self> {
        let id = watcher.add_watch(directory, Arc::new(callback), recursive)?;
        Ok(Self { watcher, id })
    }

    pub fn id(&self) -> WatchId {
        self.id
    }
}

impl Drop for ScopedWatch<'_> {
    fn drop(&mut self) {
        self.watcher.remove_watch_id(self.id);
    }
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscriber {
    /// `None` subscribes to the whole directory.
    filename: Option<OsString>,
    callback: Callback,
}

/// The per-directory listener handed to the underlying watcher.
struct Fanout {
    subscribers: Mutex<HashMap<u64, Subscriber>>,
}

impl WatchListener for Fanout {
    fn on_event(&self, event: &Event) {
        let subscribers = self.subscribers.lock();
        for subscriber in subscribers.values() {
            match &subscriber.filename {
                Some(name) if event.filename.as_os_str() != name.as_os_str() => {}
                _ => (subscriber.callback)(event),
            }
        }
    }
}

struct DirWatch {
    watch_id: WatchId,
    fanout: Arc<Fanout>,
}

struct Inner {
    watcher: FileWatcher,
    dirs: Mutex<HashMap<PathBuf, DirWatch>>,
    next_subscriber: Mutex<u64>,
}

/// Routes events from one shared watch per directory to many
/// subscribers.
///
/// Subscribing to a file watches its parent directory and filters by
/// name, so a thousand per-file subscriptions in one directory still
/// cost a single kernel watch.
pub struct WatchDispatcher {
    inner: Arc<Inner>,
}

impl WatchDispatcher {
    /// Dispatcher over the platform's native watcher.
    pub fn new() -> Result<Self> {
        Ok(Self::with_watcher(FileWatcher::new()?))
    }

    /// Dispatcher over the generic (polling) watcher.
    pub fn new_generic() -> Result<Self> {
        Ok(Self::with_watcher(FileWatcher::new_generic()?))
    }

    /// Dispatcher over a generic watcher with a custom rescan interval.
    pub fn new_generic_with_interval(interval: Duration) -> Result<Self> {
        Ok(Self::with_watcher(FileWatcher::new_generic_with_interval(
            interval,
        )?))
    }

    fn with_watcher(watcher: FileWatcher) -> Self {
        Self {
            inner: Arc::new(Inner {
                watcher,
                dirs: Mutex::new(HashMap::new()),
                next_subscriber: Mutex::new(1),
            }),
        }
    }

    /// Subscribes `callback` to changes at `path`.
    ///
    /// A directory path receives every event in that directory; a file
    /// path receives only events whose name matches. The subscription is
    /// released when the returned guard is dropped, and the underlying
    /// watch goes with the last subscriber.
    pub fn subscribe(
        &self,
        path: impl AsRef<Path>,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Result<Subscription> {
        let path = path.as_ref();
        let (directory, filename) = if path.is_dir() {
            (path.to_path_buf(), None)
        } else {
            let parent = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let name = path.file_name().map(OsString::from);
            (parent, name)
        };
        // One map key per watched root, however the caller spelled it.
        let directory = crate::fsutil::canonicalize_root(&directory)
            .unwrap_or(directory);

        let mut dirs = self.inner.dirs.lock();
        if !dirs.contains_key(&directory) {
            let fanout = Arc::new(Fanout {
                subscribers: Mutex::new(HashMap::new()),
            });
            let watch_id = self.inner.watcher.add_watch(
                &directory,
                Arc::clone(&fanout) as Arc<dyn WatchListener>,
                false,
            )?;
            dirs.insert(directory.clone(), DirWatch { watch_id, fanout });
        }
        let entry = dirs.get(&directory).expect("fanout just inserted");

        let id = {
            let mut next = self.inner.next_subscriber.lock();
            let id = *next;
            *next += 1;
            id
        };
        entry.fanout.subscribers.lock().insert(
            id,
            Subscriber {
                filename,
                callback: Arc::new(callback),
            },
        );

        Ok(Subscription {
            inner: Arc::downgrade(&self.inner),
            directory,
            id,
        })
    }

    /// Number of kernel watches currently held.
    pub fn watched_directories(&self) -> usize {
        self.inner.dirs.lock().len()
    }
}

/// Guard for one dispatcher subscription.
pub struct Subscription {
    inner: Weak<Inner>,
    directory: PathBuf,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut dirs = inner.dirs.lock();
        let Some(entry) = dirs.get(&self.directory) else {
            return;
        };
        let now_empty = {
            let mut subscribers = entry.fanout.subscribers.lock();
            subscribers.remove(&self.id);
            subscribers.is_empty()
        };
        if now_empty {
            let watch_id = entry.watch_id;
            dirs.remove(&self.directory);
            drop(dirs);
            inner.watcher.remove_watch_id(watch_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Action;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn scoped_watch_removes_itself() {
        let tmp = TempDir::new().unwrap();
        let watcher = FileWatcher::new_generic().unwrap();
        {
            let scoped = ScopedWatch::new(&watcher, tmp.path(), |_| {}, false).unwrap();
            assert!(scoped.id() > 0);
            assert_eq!(watcher.directories().len(), 1);
        }
        assert!(watcher.directories().is_empty());
    }

    #[test]
    fn fanout_filters_by_filename() {
        let dir_hits = Arc::new(AtomicUsize::new(0));
        let file_hits = Arc::new(AtomicUsize::new(0));
        let fanout = Fanout {
            subscribers: Mutex::new(HashMap::new()),
        };
        let dir_hits_cb = Arc::clone(&dir_hits);
        fanout.subscribers.lock().insert(
            1,
            Subscriber {
                filename: None,
                callback: Arc::new(move |_| {
                    dir_hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );
        let file_hits_cb = Arc::clone(&file_hits);
        fanout.subscribers.lock().insert(
            2,
            Subscriber {
                filename: Some(OsString::from("target.txt")),
                callback: Arc::new(move |_| {
                    file_hits_cb.fetch_add(1, Ordering::SeqCst);
                }),
            },
        );

        let event = |name: &str| Event {
            watch_id: 1,
            directory: PathBuf::from("/d"),
            filename: PathBuf::from(name),
            action: Action::Modified,
            old_filename: None,
        };
        fanout.on_event(&event("other.txt"));
        fanout.on_event(&event("target.txt"));

        assert_eq!(dir_hits.load(Ordering::SeqCst), 2);
        assert_eq!(file_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriptions_share_one_watch_per_directory() {
        let tmp = TempDir::new().unwrap();
        let dispatcher = WatchDispatcher::new_generic().unwrap();

        let a = dispatcher.subscribe(tmp.path(), |_| {}).unwrap();
        let b = dispatcher
            .subscribe(tmp.path().join("some-file.txt"), |_| {})
            .unwrap();
        assert_eq!(dispatcher.watched_directories(), 1);
        assert_eq!(dispatcher.inner.watcher.directories().len(), 1);

        drop(a);
        assert_eq!(dispatcher.watched_directories(), 1);
        drop(b);
        assert_eq!(dispatcher.watched_directories(), 0);
        assert!(dispatcher.inner.watcher.directories().is_empty());
    }
}
