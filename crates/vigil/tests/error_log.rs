//! The process-wide error log
//!
//! Kept in its own binary: the slot is global, so these assertions must
//! not race with other tests that provoke failures.

mod common;

use common::Collector;
use tempfile::TempDir;
use vigil::{clear_last_error, last_error_code, last_error_message, FileWatcher};

#[test]
fn add_watch_failures_populate_the_error_log() {
    clear_last_error();
    assert_eq!(last_error_code(), 0);
    assert_eq!(last_error_message(), "");

    let watcher = FileWatcher::new_generic().unwrap();

    watcher
        .add_watch("/definitely/not/present", Collector::new(), false)
        .unwrap_err();
    assert_eq!(last_error_code(), -1);
    assert!(last_error_message().contains("/definitely/not/present"));

    let tmp = TempDir::new().unwrap();
    watcher
        .add_watch(tmp.path(), Collector::new(), false)
        .unwrap();
    // A success leaves the slot alone.
    assert_eq!(last_error_code(), -1);

    watcher
        .add_watch(tmp.path(), Collector::new(), false)
        .unwrap_err();
    assert_eq!(last_error_code(), -2);

    clear_last_error();
    assert_eq!(last_error_code(), 0);
    assert_eq!(last_error_message(), "");
}
