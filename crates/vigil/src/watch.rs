//! Shared per-watch bookkeeping used by every backend

use crate::event::{Action, Event, WatchId, WatchListener};
use crate::options::WatcherOption;
use parking_lot::ReentrantMutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Immutable description of a registered watch plus its liveness flag.
///
/// Backends keep their own per-watch state next to an `Arc<WatchInfo>`;
/// the orchestrator and the worker thread share the same record.
pub(crate) struct WatchInfo {
    pub id: WatchId,
    /// Canonical absolute root, symlink on the root preserved.
    pub root: PathBuf,
    pub listener: Arc<dyn WatchListener>,
    pub recursive: bool,
    pub follow_symlinks: bool,
    pub allow_out_of_scope: bool,
    pub options: Vec<WatcherOption>,
    alive: AtomicBool,
}

impl WatchInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: WatchId,
        root: PathBuf,
        listener: Arc<dyn WatchListener>,
        recursive: bool,
        follow_symlinks: bool,
        allow_out_of_scope: bool,
        options: Vec<WatcherOption>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            root,
            listener,
            recursive,
            follow_symlinks,
            allow_out_of_scope,
            options,
            alive: AtomicBool::new(true),
        })
    }

    /// Whether events for this watch may still be delivered.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Marks the watch as removed. Events observed afterwards are dropped.
    pub fn retire(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Builds an event for this watch. `filename` is relative to the root.
    pub fn event(
        &self,
        filename: impl Into<PathBuf>,
        action: Action,
        old_filename: Option<PathBuf>,
    ) -> Event {
        Event {
            watch_id: self.id,
            directory: self.root.clone(),
            filename: filename.into(),
            action,
            old_filename,
        }
    }

    /// Rebases `absolute` onto the watch root, yielding the event path.
    pub fn relative(&self, absolute: &Path) -> PathBuf {
        absolute
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| absolute.to_path_buf())
    }
}

/// Serializes listener callbacks for one backend worker.
///
/// Removal of a watch waits on this lock, so `remove` returns only after
/// an in-flight callback for that backend has finished. The lock is
/// reentrant: a listener may call back into the watcher (including
/// removing its own watch) from inside `on_event` without deadlocking.
pub(crate) struct Deliverer {
    lock: ReentrantMutex<()>,
}

impl Deliverer {
    pub fn new() -> Self {
        Self {
            lock: ReentrantMutex::new(()),
        }
    }

    /// Invokes the listener unless the watch was retired in the meantime.
    pub fn deliver(&self, watch: &WatchInfo, event: &Event) {
        let _guard = self.lock.lock();
        if watch.is_alive() {
            watch.listener.on_event(event);
        }
    }

    /// Blocks until no callback is in flight on the worker.
    pub fn wait_idle(&self) {
        drop(self.lock.lock());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn watch_with_listener(listener: Arc<dyn WatchListener>) -> Arc<WatchInfo> {
        WatchInfo::new(
            1,
            PathBuf::from("/watched"),
            listener,
            false,
            false,
            false,
            Vec::new(),
        )
    }

    #[test]
    fn retired_watches_stop_delivering() {
        let seen = Arc::new(Mutex::new(0_u32));
        let seen_in_listener = Arc::clone(&seen);
        let watch = watch_with_listener(Arc::new(move |_event: &Event| {
            *seen_in_listener.lock() += 1;
        }));
        let deliverer = Deliverer::new();

        let event = watch.event("a", Action::Add, None);
        deliverer.deliver(&watch, &event);
        assert_eq!(*seen.lock(), 1);

        watch.retire();
        deliverer.deliver(&watch, &event);
        assert_eq!(*seen.lock(), 1);
    }

    #[test]
    fn relative_rebases_onto_root() {
        let watch = watch_with_listener(Arc::new(|_: &Event| {}));
        assert_eq!(
            watch.relative(Path::new("/watched/sub/f")),
            PathBuf::from("sub/f")
        );
        assert_eq!(
            watch.relative(Path::new("/elsewhere/f")),
            PathBuf::from("/elsewhere/f")
        );
    }
}
