//! End-to-end scenarios against the generic (polling) watcher
//!
//! These run on every platform with a fast rescan interval. Assertions
//! poll with a deadline instead of assuming latencies.

mod common;

use common::{settle, Collector, FAST_POLL};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use vigil::{Action, Error, FileWatcher, WatchListener};

fn watcher() -> FileWatcher {
    FileWatcher::new_generic_with_interval(FAST_POLL).unwrap()
}

#[test]
fn create_and_delete_are_reported() {
    let tmp = TempDir::new().unwrap();
    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();

    fs::write(tmp.path().join("a"), b"hi").unwrap();
    assert!(listener.wait_for(Action::Add, "a"));
    assert_eq!(listener.count_of(Action::Add, "a"), 1);

    fs::remove_file(tmp.path().join("a")).unwrap();
    assert!(listener.wait_for(Action::Delete, "a"));
    assert_eq!(listener.count_of(Action::Delete, "a"), 1);
}

#[test]
fn rename_in_place_becomes_one_moved_event() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a"), b"payload").unwrap();

    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    fs::rename(tmp.path().join("a"), tmp.path().join("b")).unwrap();
    assert!(listener.wait_until(|events| {
        events.iter().any(|event| {
            event.action == Action::Moved
                && event.filename.as_os_str() == "b"
                && event.old_filename.as_deref() == Some(std::path::Path::new("a"))
        })
    }));

    // The pairing consumed both halves.
    settle();
    assert_eq!(listener.count_of(Action::Add, "b"), 0);
    assert_eq!(listener.count_of(Action::Delete, "a"), 0);
}

#[test]
fn pairing_rejects_entries_with_distant_mtimes() {
    use filetime::{set_file_mtime, FileTime};
    use std::time::{Duration, SystemTime};

    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("a"), b"xx").unwrap();
    let old = SystemTime::now() - Duration::from_secs(3600);
    set_file_mtime(tmp.path().join("a"), FileTime::from_system_time(old)).unwrap();

    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    // Same size and kind, but an hour of mtime skew: not a rename.
    fs::remove_file(tmp.path().join("a")).unwrap();
    fs::write(tmp.path().join("b"), b"xx").unwrap();

    assert!(listener.wait_for(Action::Delete, "a"));
    assert!(listener.wait_for(Action::Add, "b"));
    assert_eq!(listener.count_of(Action::Moved, "b"), 0);
}

#[test]
fn cross_directory_move_is_delete_plus_add() {
    let tmp_a = TempDir::new().unwrap();
    let tmp_b = TempDir::new().unwrap();
    fs::write(tmp_a.path().join("a"), b"x").unwrap();

    let watcher = watcher();
    let first = Collector::new();
    let second = Collector::new();
    watcher
        .add_watch(tmp_a.path(), Arc::clone(&first) as Arc<dyn WatchListener>, false)
        .unwrap();
    watcher
        .add_watch(tmp_b.path(), Arc::clone(&second) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    fs::rename(tmp_a.path().join("a"), tmp_b.path().join("a")).unwrap();
    assert!(first.wait_for(Action::Delete, "a"));
    assert!(second.wait_for(Action::Add, "a"));
}

#[test]
fn recursive_watch_reports_new_tree_ancestor_first() {
    let tmp = TempDir::new().unwrap();
    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, true)
        .unwrap();

    fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
    fs::write(tmp.path().join("sub/deep/f"), b"x").unwrap();

    assert!(listener.wait_for(Action::Add, "sub/deep/f"));
    let adds: Vec<_> = listener
        .events()
        .into_iter()
        .filter(|event| event.action == Action::Add)
        .map(|event| event.filename)
        .collect();
    let sub = adds.iter().position(|p| p.as_os_str() == "sub").unwrap();
    let deep = adds
        .iter()
        .position(|p| p.as_os_str() == "sub/deep")
        .unwrap();
    let file = adds
        .iter()
        .position(|p| p.as_os_str() == "sub/deep/f")
        .unwrap();
    assert!(sub < deep && deep < file);
}

#[test]
fn second_watch_on_same_root_is_repeated() {
    let tmp = TempDir::new().unwrap();
    let watcher = watcher();
    let listener = Collector::new();

    let id = watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    assert!(id > 0);

    let err = watcher
        .add_watch(tmp.path(), Collector::new(), false)
        .unwrap_err();
    assert!(matches!(err, Error::FileRepeated(_)));
    assert_eq!(err.code(), -2);

    // The first watch keeps delivering.
    fs::write(tmp.path().join("still-works"), b"x").unwrap();
    assert!(listener.wait_for(Action::Add, "still-works"));
}

#[cfg(unix)]
#[test]
fn symlink_cycle_is_announced_once_and_terminates() {
    use std::time::Instant;

    let tmp = TempDir::new().unwrap();
    let watcher = watcher();
    watcher.set_follow_symlinks(true);
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, true)
        .unwrap();

    let started = Instant::now();
    std::os::unix::fs::symlink(tmp.path(), tmp.path().join("self")).unwrap();

    assert!(listener.wait_for(Action::Add, "self"));
    settle();

    // The link is one entry, not a descent.
    assert_eq!(listener.count_of(Action::Add, "self"), 1);
    assert!(listener
        .events()
        .iter()
        .all(|event| !event.filename.starts_with("self/")));
    assert!(started.elapsed().as_secs() < 5);
}

#[cfg(unix)]
#[test]
fn out_of_scope_symlink_is_not_descended() {
    let outside = TempDir::new().unwrap();
    fs::write(outside.path().join("secret"), b"x").unwrap();

    let tmp = TempDir::new().unwrap();
    let watcher = watcher();
    watcher.set_follow_symlinks(true);
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, true)
        .unwrap();

    std::os::unix::fs::symlink(outside.path(), tmp.path().join("portal")).unwrap();
    assert!(listener.wait_for(Action::Add, "portal"));
    settle();

    assert!(listener
        .events()
        .iter()
        .all(|event| !event.filename.starts_with("portal/")));
}

#[test]
fn modifications_coalesce_per_cycle() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("f"), b"v1").unwrap();

    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    // Several writes inside one poll interval surface as one change.
    fs::write(tmp.path().join("f"), b"v2-longer").unwrap();
    fs::write(tmp.path().join("f"), b"v3-even-longer").unwrap();
    assert!(listener.wait_for(Action::Modified, "f"));
}

#[test]
fn kind_change_is_delete_then_add() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("x"), b"file").unwrap();

    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(tmp.path(), Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    fs::remove_file(tmp.path().join("x")).unwrap();
    fs::create_dir(tmp.path().join("x")).unwrap();

    assert!(listener.wait_until(|events| {
        let delete = events
            .iter()
            .position(|e| e.action == Action::Delete && e.filename.as_os_str() == "x");
        let add = events
            .iter()
            .position(|e| e.action == Action::Add && e.filename.as_os_str() == "x");
        matches!((delete, add), (Some(d), Some(a)) if d < a)
    }));
}

#[test]
fn vanished_root_emits_final_delete_and_goes_quiet() {
    let parent = TempDir::new().unwrap();
    let root = parent.path().join("doomed");
    fs::create_dir(&root).unwrap();

    let watcher = watcher();
    let listener = Collector::new();
    watcher
        .add_watch(&root, Arc::clone(&listener) as Arc<dyn WatchListener>, false)
        .unwrap();
    settle();

    fs::remove_dir(&root).unwrap();
    assert!(listener.wait_until(|events| {
        events
            .iter()
            .any(|e| e.action == Action::Delete && e.filename.as_os_str().is_empty())
    }));

    // No further traffic once the root is gone.
    let count = listener.events().len();
    settle();
    assert_eq!(listener.events().len(), count);
}

#[test]
fn listener_may_remove_its_own_watch_from_the_callback() {
    use parking_lot::Mutex;

    let tmp = TempDir::new().unwrap();
    let watcher = Arc::new(watcher());

    let seen = Arc::new(Mutex::new(0_u32));
    let seen_cb = Arc::clone(&seen);
    let watcher_cb = Arc::clone(&watcher);
    let id_slot: Arc<Mutex<Option<vigil::WatchId>>> = Arc::new(Mutex::new(None));
    let id_slot_cb = Arc::clone(&id_slot);

    let id = watcher
        .add_watch(
            tmp.path(),
            Arc::new(move |_: &vigil::Event| {
                *seen_cb.lock() += 1;
                if let Some(id) = *id_slot_cb.lock() {
                    watcher_cb.remove_watch_id(id);
                }
            }),
            false,
        )
        .unwrap();
    *id_slot.lock() = Some(id);

    fs::write(tmp.path().join("one"), b"x").unwrap();
    let deadline = std::time::Instant::now() + common::EVENT_DEADLINE;
    while *seen.lock() == 0 && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert_eq!(*seen.lock(), 1);
    assert!(watcher.directories().is_empty());

    // Removed from its own callback; later changes stay silent.
    fs::write(tmp.path().join("two"), b"x").unwrap();
    settle();
    assert_eq!(*seen.lock(), 1);
}
