//! Cross-platform filesystem watching
//!
//! `vigil` delivers notifications about file and directory mutations
//! (create, delete, modify, rename) to listeners, using the kernel
//! interface native to the host platform:
//!
//! - inotify on Linux
//! - FSEvents on macOS
//! - kqueue on the BSDs
//! - `ReadDirectoryChangesW` on Windows
//!
//! A portable polling backend backs all of them up and is the right tool
//! for network shares and FUSE mounts, where kernel watchers see nothing.
//!
//! # Watching a directory
//!
//! ```no_run
//! use std::sync::Arc;
//! use vigil::{Event, FileWatcher};
//!
//! let watcher = FileWatcher::new()?;
//! watcher.add_watch(
//!     "/var/log",
//!     Arc::new(|event: &Event| {
//!         println!("{}: {}", event.action, event.filename.display());
//!     }),
//!     true,
//! )?;
//! # Ok::<(), vigil::Error>(())
//! ```
//!
//! Callbacks run on a background worker owned by the watcher; adding and
//! removing watches is safe from any thread, including from inside a
//! callback.

mod backend;
mod convenience;
mod error;
mod event;
pub mod fsutil;
mod options;
mod snapshot;
mod watch;
mod watcher;

pub use convenience::{ScopedWatch, Subscription, WatchDispatcher};
pub use error::{clear_last_error, last_error_code, last_error_message, Error, Result};
pub use event::{Action, Event, WatchId, WatchListener};
pub use options::{effective_buffer_size, notify_filter, WatcherOption, DEFAULT_BUFFER_SIZE};
pub use watcher::FileWatcher;
