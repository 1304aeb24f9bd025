//! BSD backend on top of kqueue
//!
//! kqueue has no directory-entry granularity: we hold one descriptor per
//! watched entry and re-enumerate a directory whenever its vnode signals
//! a change, diffing against an in-memory snapshot to recover which entry
//! appeared or left. File descriptors report their own writes directly.

use crate::backend::Backend;
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::fsutil::{self, EntryKind};
use crate::snapshot::{self, Change, Snapshot};
use crate::watch::{Deliverer, WatchInfo};
use libc::timespec;
use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error};

/// kevent wait slice before the stop flag is re-checked.
const WAIT_SLICE: timespec = timespec {
    tv_sec: 0,
    tv_nsec: 250_000_000,
};

const EVENT_BATCH: usize = 64;

pub(crate) struct KqueueWatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queue: Kqueue,
    running: AtomicBool,
    deliverer: Deliverer,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    watches: BTreeMap<WatchId, Arc<WatchInfo>>,
    entries: HashMap<RawFd, KqEntry>,
    by_path: HashMap<PathBuf, RawFd>,
}

/// One watched vnode. Dropping the `File` closes the descriptor, which
/// also removes its knote from the queue.
struct KqEntry {
    watch: WatchId,
    path: PathBuf,
    is_dir: bool,
    snapshot: Option<Snapshot>,
    file: File,
}

impl KqueueWatcher {
    pub fn new() -> Result<Self> {
        let queue = Kqueue::new()
            .map_err(|err| Error::Unspecified(format!("kqueue unavailable: {err}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                queue,
                running: AtomicBool::new(false),
                deliverer: Deliverer::new(),
                state: Mutex::new(State::default()),
            }),
            worker: Mutex::new(None),
        })
    }
}

impl Backend for KqueueWatcher {
    fn add(&self, info: Arc<WatchInfo>) -> Result<WatchId> {
        let mut state = self.shared.state.lock();
        if let Err(err) = register_tree(&self.shared, &mut state, &info) {
            release_entries(&mut state, info.id);
            return Err(err);
        }
        state.watches.insert(info.id, Arc::clone(&info));
        Ok(info.id)
    }

    fn remove(&self, id: WatchId) {
        let info = {
            let mut state = self.shared.state.lock();
            let info = state.watches.remove(&id);
            if info.is_some() {
                release_entries(&mut state, id);
            }
            info
        };
        if let Some(info) = info {
            info.retire();
            self.shared.deliverer.wait_idle();
        }
    }

    fn remove_by_root(&self, root: &Path) {
        let id = self
            .shared
            .state
            .lock()
            .watches
            .values()
            .find(|info| info.root == root)
            .map(|info| info.id);
        if let Some(id) = id {
            self.remove(id);
        }
    }

    fn list_roots(&self) -> Vec<PathBuf> {
        self.shared
            .state
            .lock()
            .watches
            .values()
            .map(|info| info.root.clone())
            .collect()
    }

    fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("vigil-kqueue".into())
            .spawn(move || run(shared))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Unspecified(format!(
                    "failed to spawn kqueue worker: {err}"
                )))
            }
        }
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock();
        state.entries.clear();
        state.by_path.clear();
        state.watches.clear();
    }
}

impl Drop for KqueueWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn vnode_flags() -> FilterFlag {
    FilterFlag::NOTE_WRITE
        | FilterFlag::NOTE_EXTEND
        | FilterFlag::NOTE_ATTRIB
        | FilterFlag::NOTE_DELETE
        | FilterFlag::NOTE_RENAME
}

/// Registers `path` with the queue and records the entry.
fn register_entry(
    shared: &Shared,
    state: &mut State,
    info: &Arc<WatchInfo>,
    path: PathBuf,
    is_dir: bool,
) -> Result<RawFd> {
    if let Some(fd) = state.by_path.get(&path) {
        return Ok(*fd);
    }
    let file = File::open(&path).map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => Error::FileNotFound(path.clone()),
        std::io::ErrorKind::PermissionDenied => Error::FileNotReadable(path.clone()),
        _ => Error::Unspecified(format!("open {}: {err}", path.display())),
    })?;
    let fd = file.as_raw_fd();

    let changes = [KEvent::new(
        fd as usize,
        EventFilter::EVFILT_VNODE,
        EventFlag::EV_ADD | EventFlag::EV_CLEAR,
        vnode_flags(),
        0,
        0,
    )];
    let mut scratch: [KEvent; 0] = [];
    let immediate = timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    shared
        .queue
        .kevent(&changes, &mut scratch, Some(immediate))
        .map_err(|err| Error::WatcherFailed(format!("kevent {}: {err}", path.display())))?;

    let snapshot = if is_dir {
        Some(snapshot::capture(&path, info.follow_symlinks).unwrap_or_default())
    } else {
        None
    };
    state.entries.insert(
        fd,
        KqEntry {
            watch: info.id,
            path: path.clone(),
            is_dir,
            snapshot,
            file,
        },
    );
    state.by_path.insert(path, fd);
    Ok(fd)
}

/// Registers a watch root and, when recursive, every entry below it.
fn register_tree(shared: &Shared, state: &mut State, info: &Arc<WatchInfo>) -> Result<()> {
    let root_resolved = fs::canonicalize(&info.root)
        .map_err(|_| Error::FileNotFound(info.root.clone()))?;
    let mut ancestors = Vec::new();
    register_dir_recursive(
        shared,
        state,
        info,
        info.root.clone(),
        root_resolved.clone(),
        &root_resolved,
        &mut ancestors,
        false,
        &mut Vec::new(),
    )
}

#[allow(clippy::too_many_arguments)]
fn register_dir_recursive(
    shared: &Shared,
    state: &mut State,
    info: &Arc<WatchInfo>,
    abs: PathBuf,
    resolved: PathBuf,
    root_resolved: &Path,
    ancestors: &mut Vec<PathBuf>,
    announce: bool,
    out: &mut Vec<(Arc<WatchInfo>, Event)>,
) -> Result<()> {
    register_entry(shared, state, info, abs.clone(), true)?;

    ancestors.push(resolved);
    let entries = fsutil::list_directory(&abs).unwrap_or_default();
    for (name, kind) in entries {
        let child_abs = abs.join(&name);
        if announce {
            out.push((
                Arc::clone(info),
                info.event(info.relative(&child_abs), Action::Add, None),
            ));
        }
        match kind {
            EntryKind::File if info.recursive || ancestors.len() == 1 => {
                if let Err(err) =
                    register_entry(shared, state, info, child_abs.clone(), false)
                {
                    debug!("skipping file {}: {err}", child_abs.display());
                }
            }
            EntryKind::Directory | EntryKind::Symlink if info.recursive => {
                let Some(child_resolved) = fsutil::descend_target(
                    &child_abs,
                    root_resolved,
                    ancestors,
                    kind == EntryKind::Symlink,
                    info.follow_symlinks,
                    info.allow_out_of_scope,
                ) else {
                    continue;
                };
                if !fs::metadata(&child_resolved)
                    .map(|meta| meta.is_dir())
                    .unwrap_or(false)
                {
                    continue;
                }
                if let Err(err) = register_dir_recursive(
                    shared,
                    state,
                    info,
                    child_abs.clone(),
                    child_resolved,
                    root_resolved,
                    ancestors,
                    announce,
                    out,
                ) {
                    debug!("skipping subdirectory {}: {err}", child_abs.display());
                }
            }
            _ => {}
        }
    }
    ancestors.pop();
    Ok(())
}

fn release_entries(state: &mut State, id: WatchId) {
    let owned: Vec<(RawFd, PathBuf)> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.watch == id)
        .map(|(fd, entry)| (*fd, entry.path.clone()))
        .collect();
    for (fd, path) in owned {
        state.entries.remove(&fd);
        state.by_path.remove(&path);
    }
}

fn run(shared: Arc<Shared>) {
    debug!("kqueue worker started");
    let template = KEvent::new(
        0,
        EventFilter::EVFILT_VNODE,
        EventFlag::empty(),
        FilterFlag::empty(),
        0,
        0,
    );
    while shared.running.load(Ordering::Acquire) {
        let mut batch = vec![template; EVENT_BATCH];
        let received = match shared.queue.kevent(&[], &mut batch, Some(WAIT_SLICE)) {
            Ok(count) => count,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                error!("kevent wait failed: {err}");
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };
        if received == 0 {
            continue;
        }

        let mut deliveries: Vec<(Arc<WatchInfo>, Event)> = Vec::new();
        let mut lost: Vec<WatchId> = Vec::new();
        {
            let mut state = shared.state.lock();
            for event in batch.into_iter().take(received) {
                translate(&shared, &mut state, &event, &mut deliveries, &mut lost);
            }
        }
        for (info, event) in &deliveries {
            shared.deliverer.deliver(info, event);
        }
        if !lost.is_empty() {
            let mut state = shared.state.lock();
            for id in lost {
                if let Some(info) = state.watches.remove(&id) {
                    release_entries(&mut state, id);
                    info.retire();
                }
            }
        }
    }
    debug!("kqueue worker stopped");
}

fn translate(
    shared: &Shared,
    state: &mut State,
    event: &KEvent,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
    lost: &mut Vec<WatchId>,
) {
    let fd = event.ident() as RawFd;
    let flags = event.fflags();
    let Some((watch_id, path, is_dir)) = state
        .entries
        .get(&fd)
        .map(|entry| (entry.watch, entry.path.clone(), entry.is_dir))
    else {
        return;
    };
    let Some(info) = state.watches.get(&watch_id).map(Arc::clone) else {
        return;
    };

    if is_dir {
        if flags.contains(FilterFlag::NOTE_DELETE) && path == info.root {
            deliveries.push((Arc::clone(&info), info.event("", Action::Delete, None)));
            error::log_error(Error::WatcherFailed(format!(
                "watch root disappeared: {}",
                info.root.display()
            )));
            lost.push(info.id);
            return;
        }
        rescan_directory(shared, state, &info, fd, &path, deliveries);
        return;
    }

    // Plain file descriptor.
    if flags.contains(FilterFlag::NOTE_DELETE) {
        let rel = info.relative(&path);
        deliveries.push((Arc::clone(&info), info.event(rel, Action::Delete, None)));
        forget_entry(state, fd);
        if let Some(parent) = path.parent() {
            remove_from_parent_snapshot(state, parent, &path);
        }
    } else if flags.intersects(
        FilterFlag::NOTE_WRITE | FilterFlag::NOTE_EXTEND | FilterFlag::NOTE_ATTRIB,
    ) {
        let rel = info.relative(&path);
        let event = info.event(rel, Action::Modified, None);
        deliveries.push((info, event));
    }
    // NOTE_RENAME on a file is resolved by the parent directory's diff.
}

/// Re-enumerates a directory whose vnode changed and diffs it against
/// the stored snapshot.
fn rescan_directory(
    shared: &Shared,
    state: &mut State,
    info: &Arc<WatchInfo>,
    fd: RawFd,
    dir_abs: &Path,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
) {
    let new_snapshot = match snapshot::capture(dir_abs, info.follow_symlinks) {
        Ok(snapshot) => snapshot,
        // Directory gone; its own NOTE_DELETE or the parent diff covers it.
        Err(_) => return,
    };
    let old_snapshot = state
        .entries
        .get(&fd)
        .and_then(|entry| entry.snapshot.clone())
        .unwrap_or_default();

    let rel_dir = info.relative(dir_abs);
    for change in snapshot::diff(&old_snapshot, &new_snapshot) {
        match change {
            Change::Added(name) => {
                let child_abs = dir_abs.join(&name);
                let child_rel = rel_dir.join(&name);
                deliveries.push((
                    Arc::clone(info),
                    info.event(child_rel, Action::Add, None),
                ));
                register_appeared(shared, state, info, &child_abs, deliveries);
            }
            Change::Deleted(name) => {
                let child_abs = dir_abs.join(&name);
                let child_rel = rel_dir.join(&name);
                deliveries.push((
                    Arc::clone(info),
                    info.event(child_rel, Action::Delete, None),
                ));
                if let Some(child_fd) = state.by_path.get(&child_abs).copied() {
                    forget_entry(state, child_fd);
                }
            }
            Change::Renamed { from, to } => {
                let from_abs = dir_abs.join(&from);
                let to_abs = dir_abs.join(&to);
                deliveries.push((
                    Arc::clone(info),
                    info.event(
                        rel_dir.join(&to),
                        Action::Moved,
                        Some(rel_dir.join(&from)),
                    ),
                ));
                repath_entries(state, &from_abs, &to_abs);
            }
            // Retained files signal their own writes.
            Change::Modified(_) => {}
        }
    }

    if let Some(entry) = state.entries.get_mut(&fd) {
        entry.snapshot = Some(new_snapshot);
    }
}

/// Starts tracking an entry that appeared inside a watched directory.
fn register_appeared(
    shared: &Shared,
    state: &mut State,
    info: &Arc<WatchInfo>,
    child_abs: &Path,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
) {
    let kind = match fsutil::classify(child_abs) {
        fsutil::PathKind::Directory => EntryKind::Directory,
        fsutil::PathKind::File => EntryKind::File,
        fsutil::PathKind::Symlink(_) => EntryKind::Symlink,
        fsutil::PathKind::Missing => return,
    };
    match kind {
        EntryKind::File => {
            if let Err(err) = register_entry(shared, state, info, child_abs.to_path_buf(), false)
            {
                debug!("could not track {}: {err}", child_abs.display());
            }
        }
        EntryKind::Directory | EntryKind::Symlink if info.recursive => {
            let Ok(root_resolved) = fs::canonicalize(&info.root) else {
                return;
            };
            let Some(resolved) = fsutil::descend_target(
                child_abs,
                &root_resolved,
                &[root_resolved.clone()],
                kind == EntryKind::Symlink,
                info.follow_symlinks,
                info.allow_out_of_scope,
            ) else {
                return;
            };
            let mut ancestors = vec![root_resolved.clone()];
            if let Err(err) = register_dir_recursive(
                shared,
                state,
                info,
                child_abs.to_path_buf(),
                resolved,
                &root_resolved,
                &mut ancestors,
                true,
                deliveries,
            ) {
                debug!("could not track {}: {err}", child_abs.display());
            }
        }
        _ => {}
    }
}

fn forget_entry(state: &mut State, fd: RawFd) {
    if let Some(entry) = state.entries.remove(&fd) {
        state.by_path.remove(&entry.path);
    }
}

fn remove_from_parent_snapshot(state: &mut State, parent: &Path, child: &Path) {
    let Some(name) = child.file_name() else {
        return;
    };
    let Some(parent_fd) = state.by_path.get(parent).copied() else {
        return;
    };
    if let Some(entry) = state.entries.get_mut(&parent_fd) {
        if let Some(snapshot) = entry.snapshot.as_mut() {
            snapshot.remove(name);
        }
    }
}

/// Rebases tracked paths after a directory rename.
fn repath_entries(state: &mut State, from: &Path, to: &Path) {
    let moved: Vec<RawFd> = state
        .entries
        .iter()
        .filter(|(_, entry)| entry.path.starts_with(from))
        .map(|(fd, _)| *fd)
        .collect();
    for fd in moved {
        if let Some(entry) = state.entries.get_mut(&fd) {
            let suffix = entry
                .path
                .strip_prefix(from)
                .expect("entry under prefix")
                .to_path_buf();
            state.by_path.remove(&entry.path);
            entry.path = to.join(suffix);
            state.by_path.insert(entry.path.clone(), fd);
        }
    }
}
