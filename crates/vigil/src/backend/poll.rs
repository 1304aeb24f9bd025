//! Generic polling backend
//!
//! Derives every event by periodically rescanning watched directories and
//! diffing against the previous snapshot. Slower than the kernel backends
//! but works on any filesystem, including network mounts and FUSE where
//! kernel watchers are blind.

use crate::backend::Backend;
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::fsutil::{self, EntryKind};
use crate::snapshot::{self, Change, Snapshot};
use crate::watch::{Deliverer, WatchInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time between rescan cycles.
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Rescan cycles never run closer together than this.
pub(crate) const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often the worker re-checks the stop flag while sleeping.
const STOP_CHECK_SLICE: Duration = Duration::from_millis(50);

pub(crate) struct PollWatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    interval: Duration,
    running: AtomicBool,
    deliverer: Deliverer,
    watches: Mutex<BTreeMap<WatchId, PollWatch>>,
}

/// One registered root with the directory nodes tracked under it.
///
/// Nodes are keyed by their path relative to the root; parent/child
/// relations fall out of the keys, so teardown never chases pointers.
struct PollWatch {
    info: Arc<WatchInfo>,
    nodes: HashMap<PathBuf, DirNode>,
}

struct DirNode {
    snapshot: Snapshot,
}

impl PollWatcher {
    pub fn new(interval: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                interval: interval.max(MIN_POLL_INTERVAL),
                running: AtomicBool::new(false),
                deliverer: Deliverer::new(),
                watches: Mutex::new(BTreeMap::new()),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_default_interval() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl Backend for PollWatcher {
    fn add(&self, info: Arc<WatchInfo>) -> Result<WatchId> {
        let mut watches = self.shared.watches.lock();
        for existing in watches.values() {
            if info.root.starts_with(&existing.info.root) {
                return Err(Error::FileRepeated(info.root.clone()));
            }
        }

        let mut watch = PollWatch {
            info: Arc::clone(&info),
            nodes: HashMap::new(),
        };
        let mut discarded = Vec::new();
        if !scan_watch(&mut watch, false, &mut discarded) {
            return Err(Error::FileNotFound(info.root.clone()));
        }
        watches.insert(info.id, watch);
        Ok(info.id)
    }

    fn remove(&self, id: WatchId) {
        let info = self.shared.watches.lock().remove(&id).map(|w| w.info);
        if let Some(info) = info {
            info.retire();
            self.shared.deliverer.wait_idle();
        }
    }

    fn remove_by_root(&self, root: &Path) {
        let id = self
            .shared
            .watches
            .lock()
            .values()
            .find(|watch| watch.info.root == root)
            .map(|watch| watch.info.id);
        if let Some(id) = id {
            self.remove(id);
        }
    }

    fn list_roots(&self) -> Vec<PathBuf> {
        self.shared
            .watches
            .lock()
            .values()
            .map(|watch| watch.info.root.clone())
            .collect()
    }

    fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("vigil-poll".into())
            .spawn(move || run(shared))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Unspecified(format!(
                    "failed to spawn polling worker: {err}"
                )))
            }
        }
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>) {
    debug!(interval = ?shared.interval, "polling worker started");
    while shared.running.load(Ordering::Acquire) {
        let deadline = Instant::now() + shared.interval;
        loop {
            if !shared.running.load(Ordering::Acquire) {
                debug!("polling worker stopped");
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_CHECK_SLICE));
        }
        poll_cycle(&shared);
    }
    debug!("polling worker stopped");
}

fn poll_cycle(shared: &Shared) {
    let mut batches: Vec<(Arc<WatchInfo>, Vec<Event>)> = Vec::new();
    let mut dead: Vec<Arc<WatchInfo>> = Vec::new();

    {
        let mut watches = shared.watches.lock();
        let mut lost = Vec::new();
        for (id, watch) in watches.iter_mut() {
            let mut events = Vec::new();
            if !scan_watch(watch, true, &mut events) {
                lost.push(*id);
                dead.push(Arc::clone(&watch.info));
            }
            if !events.is_empty() {
                batches.push((Arc::clone(&watch.info), events));
            }
        }
        for id in lost {
            watches.remove(&id);
        }
    }

    for (info, events) in &batches {
        for event in events {
            shared.deliverer.deliver(info, event);
        }
    }
    // The final synthetic delete above must still reach the listener, so
    // lost watches are retired only after delivery.
    for info in dead {
        info.retire();
    }
}

/// Rescans one watch. Returns `false` when the root is gone and the watch
/// must be dropped; its synthetic delete is then already in `out`.
fn scan_watch(watch: &mut PollWatch, emit: bool, out: &mut Vec<Event>) -> bool {
    let root = watch.info.root.clone();
    let resolved = match fs::canonicalize(&root) {
        Ok(resolved) if fs::metadata(&resolved).map(|m| m.is_dir()).unwrap_or(false) => resolved,
        _ => {
            if emit {
                out.push(watch.info.event("", Action::Delete, None));
                error::log_error(Error::WatcherFailed(format!(
                    "watch root disappeared: {}",
                    root.display()
                )));
            }
            return false;
        }
    };

    let mut ancestors = Vec::new();
    scan_dir(
        &watch.info,
        &mut watch.nodes,
        PathBuf::new(),
        root,
        resolved.clone(),
        &resolved,
        &mut ancestors,
        emit,
        out,
    );
    true
}

/// Depth-first rescan of one tracked directory.
///
/// `rel` is the directory's path relative to the watch root, `abs` its
/// lexical absolute path (symlinks unresolved, so event paths stay under
/// the root the caller asked for) and `resolved` its resolved form used
/// for the cycle guard.
#[allow(clippy::too_many_arguments)]
fn scan_dir(
    info: &Arc<WatchInfo>,
    nodes: &mut HashMap<PathBuf, DirNode>,
    rel: PathBuf,
    abs: PathBuf,
    resolved: PathBuf,
    root_resolved: &Path,
    ancestors: &mut Vec<PathBuf>,
    emit: bool,
    out: &mut Vec<Event>,
) {
    let new_snapshot = match snapshot::capture(&abs, info.follow_symlinks) {
        Ok(snapshot) => snapshot,
        // Vanished or unreadable mid-scan; the parent diff picks it up.
        Err(_) => return,
    };

    if emit {
        let old_snapshot = nodes
            .get(&rel)
            .map(|node| node.snapshot.clone())
            .unwrap_or_default();
        for change in snapshot::diff(&old_snapshot, &new_snapshot) {
            match change {
                Change::Added(name) => {
                    out.push(info.event(rel.join(&name), Action::Add, None));
                }
                Change::Deleted(name) => {
                    let child_rel = rel.join(&name);
                    drop_subtree(info, nodes, &child_rel, out);
                    out.push(info.event(child_rel, Action::Delete, None));
                }
                Change::Modified(name) => {
                    out.push(info.event(rel.join(&name), Action::Modified, None));
                }
                Change::Renamed { from, to } => {
                    let from_rel = rel.join(&from);
                    let to_rel = rel.join(&to);
                    rekey_subtree(nodes, &from_rel, &to_rel);
                    out.push(info.event(to_rel, Action::Moved, Some(from_rel)));
                }
            }
        }
    }

    nodes.insert(
        rel.clone(),
        DirNode {
            snapshot: new_snapshot.clone(),
        },
    );

    if !info.recursive {
        return;
    }

    ancestors.push(resolved);
    for (name, meta) in &new_snapshot {
        if meta.kind != EntryKind::Directory {
            continue;
        }
        let child_abs = abs.join(name);
        let is_symlink = matches!(
            fs::symlink_metadata(&child_abs),
            Ok(meta) if meta.file_type().is_symlink()
        );
        let Some(child_resolved) = fsutil::descend_target(
            &child_abs,
            root_resolved,
            ancestors,
            is_symlink,
            info.follow_symlinks,
            info.allow_out_of_scope,
        ) else {
            continue;
        };
        scan_dir(
            info,
            nodes,
            rel.join(name),
            child_abs,
            child_resolved,
            root_resolved,
            ancestors,
            emit,
            out,
        );
    }
    ancestors.pop();
}

/// Releases every tracked node under `dir_rel`, emitting deletes for the
/// entries of deeper directories first. The delete for `dir_rel` itself
/// is the caller's, so it lands after its contents.
fn drop_subtree(
    info: &Arc<WatchInfo>,
    nodes: &mut HashMap<PathBuf, DirNode>,
    dir_rel: &Path,
    out: &mut Vec<Event>,
) {
    let mut subtree: Vec<PathBuf> = nodes
        .keys()
        .filter(|key| key.starts_with(dir_rel))
        .cloned()
        .collect();
    subtree.sort_by_key(|key| std::cmp::Reverse(key.components().count()));

    for dir in subtree {
        if let Some(node) = nodes.remove(&dir) {
            for name in node.snapshot.keys() {
                out.push(info.event(dir.join(name), Action::Delete, None));
            }
        }
    }
}

/// Rebases tracked nodes after a directory rename so its subtree keeps
/// its snapshots instead of being re-announced.
fn rekey_subtree(nodes: &mut HashMap<PathBuf, DirNode>, from: &Path, to: &Path) {
    let moved: Vec<PathBuf> = nodes
        .keys()
        .filter(|key| key.starts_with(from))
        .cloned()
        .collect();
    for key in moved {
        if let Some(node) = nodes.remove(&key) {
            let suffix = key.strip_prefix(from).expect("subtree key").to_path_buf();
            nodes.insert(to.join(suffix), node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn dummy_info(root: &Path, recursive: bool) -> Arc<WatchInfo> {
        WatchInfo::new(
            1,
            root.to_path_buf(),
            Arc::new(|_: &Event| {}),
            recursive,
            false,
            false,
            Vec::new(),
        )
    }

    #[test]
    fn initial_scan_is_silent_and_tracks_subdirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        fs::write(tmp.path().join("a/f"), b"x").unwrap();

        let mut watch = PollWatch {
            info: dummy_info(tmp.path(), true),
            nodes: HashMap::new(),
        };
        let mut events = Vec::new();
        assert!(scan_watch(&mut watch, false, &mut events));
        assert!(events.is_empty());
        assert!(watch.nodes.contains_key(Path::new("")));
        assert!(watch.nodes.contains_key(Path::new("a")));
        assert!(watch.nodes.contains_key(Path::new("a/b")));
    }

    #[test]
    fn new_entries_surface_ancestor_first() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut watch = PollWatch {
            info: dummy_info(tmp.path(), true),
            nodes: HashMap::new(),
        };
        let mut events = Vec::new();
        scan_watch(&mut watch, false, &mut events);

        fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
        fs::write(tmp.path().join("sub/deep/f"), b"x").unwrap();

        let mut events = Vec::new();
        assert!(scan_watch(&mut watch, true, &mut events));
        let adds: Vec<_> = events
            .iter()
            .filter(|event| event.action == Action::Add)
            .map(|event| event.filename.clone())
            .collect();
        assert_eq!(
            adds,
            vec![
                PathBuf::from("sub"),
                PathBuf::from("sub/deep"),
                PathBuf::from("sub/deep/f"),
            ]
        );
    }

    #[test]
    fn removed_tree_deletes_bottom_up() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub/deep")).unwrap();
        fs::write(tmp.path().join("sub/deep/f"), b"x").unwrap();

        let mut watch = PollWatch {
            info: dummy_info(tmp.path(), true),
            nodes: HashMap::new(),
        };
        let mut events = Vec::new();
        scan_watch(&mut watch, false, &mut events);

        fs::remove_dir_all(tmp.path().join("sub")).unwrap();

        let mut events = Vec::new();
        assert!(scan_watch(&mut watch, true, &mut events));
        let deletes: Vec<_> = events
            .iter()
            .filter(|event| event.action == Action::Delete)
            .map(|event| event.filename.clone())
            .collect();
        assert_eq!(
            deletes,
            vec![
                PathBuf::from("sub/deep/f"),
                PathBuf::from("sub/deep"),
                PathBuf::from("sub"),
            ]
        );
        assert!(!watch.nodes.contains_key(Path::new("sub")));
        assert!(!watch.nodes.contains_key(Path::new("sub/deep")));
    }

    #[test]
    fn renamed_directory_keeps_its_tracked_subtree() {
        let mut nodes = HashMap::new();
        nodes.insert(
            PathBuf::from("old"),
            DirNode {
                snapshot: Snapshot::new(),
            },
        );
        let mut inner = Snapshot::new();
        inner.insert(
            OsString::from("f"),
            crate::snapshot::EntryMeta {
                kind: EntryKind::File,
                mtime: std::time::SystemTime::UNIX_EPOCH,
                size: 0,
            },
        );
        nodes.insert(PathBuf::from("old/deep"), DirNode { snapshot: inner });

        rekey_subtree(&mut nodes, Path::new("old"), Path::new("new"));
        assert!(nodes.contains_key(Path::new("new")));
        assert!(nodes.contains_key(Path::new("new/deep")));
        assert!(!nodes.contains_key(Path::new("old")));
    }

    #[test]
    fn nested_roots_are_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("inner")).unwrap();
        let watcher = PollWatcher::new(Duration::from_millis(100));

        let outer = dummy_info(tmp.path(), false);
        watcher.add(outer).unwrap();

        let inner = WatchInfo::new(
            2,
            tmp.path().join("inner"),
            Arc::new(|_: &Event| {}),
            false,
            false,
            false,
            Vec::new(),
        );
        assert!(matches!(
            watcher.add(inner),
            Err(Error::FileRepeated(_))
        ));
    }

    #[test]
    fn interval_has_a_floor() {
        let watcher = PollWatcher::new(Duration::from_millis(1));
        assert_eq!(watcher.shared.interval, MIN_POLL_INTERVAL);
    }
}
