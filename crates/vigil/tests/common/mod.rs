//! Shared fixtures for watcher integration tests

// Not every test binary uses every helper.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vigil::{Action, Event, WatchListener};

/// Poll interval used by the generic watcher under test.
pub const FAST_POLL: Duration = Duration::from_millis(100);

/// Upper bound for an expected event to show up.
pub const EVENT_DEADLINE: Duration = Duration::from_secs(5);

/// Listener that records every event it sees.
#[derive(Default)]
pub struct Collector {
    events: Mutex<Vec<Event>>,
}

impl Collector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Blocks until `predicate` holds for the collected events or the
    /// deadline passes. Returns whether it held.
    pub fn wait_until(&self, predicate: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + EVENT_DEADLINE;
        loop {
            if predicate(&self.events.lock()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Convenience: wait for at least one event matching action + path.
    pub fn wait_for(&self, action: Action, filename: impl AsRef<Path>) -> bool {
        let filename = filename.as_ref().to_path_buf();
        self.wait_until(|events| {
            events
                .iter()
                .any(|event| event.action == action && event.filename == filename)
        })
    }

    pub fn count_of(&self, action: Action, filename: impl AsRef<Path>) -> usize {
        let filename = filename.as_ref();
        self.events
            .lock()
            .iter()
            .filter(|event| event.action == action && event.filename == filename)
            .count()
    }
}

impl WatchListener for Collector {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Lets the watcher run a couple of poll cycles with nothing happening.
pub fn settle() {
    std::thread::sleep(3 * FAST_POLL);
}
