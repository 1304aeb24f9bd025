//! Event types delivered to watch listeners

use std::fmt;
use std::path::PathBuf;

/// Identifier for a registered watch.
///
/// Live watches always have positive ids, assigned monotonically per
/// [`FileWatcher`](crate::FileWatcher) instance and never reused.
pub type WatchId = i64;

/// The kind of filesystem mutation a listener is notified about.
///
/// A rename inside the watched tree is reported as a single `Moved` when
/// the backend can pair both halves of the rename; otherwise the halves
/// surface separately as a `Delete` of the old name and an `Add` of the
/// new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// A file or directory appeared.
    Add = 1,
    /// A file or directory disappeared.
    Delete = 2,
    /// Contents or attributes of an entry changed.
    Modified = 3,
    /// An entry was renamed and both halves were paired.
    Moved = 4,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Add => "add",
            Action::Delete => "delete",
            Action::Modified => "modified",
            Action::Moved => "moved",
        };
        f.pad(name)
    }
}

/// A single filesystem notification.
#[derive(Debug, Clone)]
pub struct Event {
    /// The watch this event belongs to.
    pub watch_id: WatchId,
    /// Root directory of the watch, in canonical absolute form.
    pub directory: PathBuf,
    /// Path of the affected entry, relative to `directory`.
    ///
    /// For non-recursive watches this is a bare file name; for recursive
    /// watches it may contain subdirectory components. An empty path means
    /// the watched root itself (only emitted when the root disappears).
    pub filename: PathBuf,
    /// What happened to the entry.
    pub action: Action,
    /// Previous name of the entry, relative to `directory`.
    ///
    /// `Some` only when `action` is [`Action::Moved`].
    pub old_filename: Option<PathBuf>,
}

/// Receives events for one or more watches.
///
/// Callbacks run on the backend worker thread, one at a time per watch.
/// A listener must not panic; errors have to be handled inside the
/// callback.
///
/// Any `Fn(&Event) + Send + Sync` closure is a listener.
pub trait WatchListener: Send + Sync {
    /// Called once per observed filesystem event.
    fn on_event(&self, event: &Event);
}

impl<F> WatchListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}
