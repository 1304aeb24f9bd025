//! Linux backend on top of inotify
//!
//! One watch descriptor per observed directory. Recursive roots register
//! every subdirectory up front and chase directories created afterwards,
//! filling the unavoidable race by enumerating a fresh directory's
//! children right after its descriptor is in place.

use crate::backend::Backend;
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::fsutil::{self, EntryKind};
use crate::watch::{Deliverer, WatchInfo};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// How long the worker blocks in poll(2) before re-checking the stop flag.
const WAIT_SLICE_MS: u16 = 250;

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_CLOSE_WRITE
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_MOVED_FROM
        | AddWatchFlags::IN_MOVED_TO
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MOVE_SELF
}

pub(crate) struct InotifyWatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    inotify: Inotify,
    running: AtomicBool,
    deliverer: Deliverer,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    watches: BTreeMap<WatchId, Arc<WatchInfo>>,
    dirs: HashMap<WatchDescriptor, DirBinding>,
    descriptors: HashMap<PathBuf, WatchDescriptor>,
}

#[derive(Clone)]
struct DirBinding {
    watch: WatchId,
    path: PathBuf,
}

/// A moved-from half waiting for its moved-to partner within one drain.
struct PendingRename {
    cookie: u32,
    watch: WatchId,
    abs: PathBuf,
    rel: PathBuf,
    is_dir: bool,
}

impl InotifyWatcher {
    pub fn new() -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(|err| Error::Unspecified(format!("inotify unavailable: {err}")))?;
        Ok(Self {
            shared: Arc::new(Shared {
                inotify,
                running: AtomicBool::new(false),
                deliverer: Deliverer::new(),
                state: Mutex::new(State::default()),
            }),
            worker: Mutex::new(None),
        })
    }
}

impl Backend for InotifyWatcher {
    fn add(&self, info: Arc<WatchInfo>) -> Result<WatchId> {
        let mut state = self.shared.state.lock();
        if let Err(err) = register_tree(&self.shared.inotify, &mut state, &info) {
            release_bindings(&self.shared.inotify, &mut state, info.id);
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
                release_bindings(&self.shared.inotify, &mut state, id);
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
            .name("vigil-inotify".into())
            .spawn(move || run(shared))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Unspecified(format!(
                    "failed to spawn inotify worker: {err}"
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
        let descriptors: Vec<WatchDescriptor> = state.dirs.keys().copied().collect();
        for wd in descriptors {
            let _ = self.shared.inotify.rm_watch(wd);
        }
        state.dirs.clear();
        state.descriptors.clear();
        state.watches.clear();
    }
}

impl Drop for InotifyWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Registers descriptors for a watch root and, when recursive, its
/// current subtree. No events are emitted for pre-existing entries.
fn register_tree(inotify: &Inotify, state: &mut State, info: &Arc<WatchInfo>) -> Result<()> {
    let root_resolved = fs::canonicalize(&info.root)
        .map_err(|_| Error::FileNotFound(info.root.clone()))?;
    let mut ancestors = Vec::new();
    let mut discarded = Vec::new();
    register_dir(
        inotify,
        state,
        info,
        info.root.clone(),
        root_resolved.clone(),
        &root_resolved,
        &mut ancestors,
        false,
        &mut discarded,
    )
}

/// Registers one directory and descends per the watch's symlink policy.
///
/// With `announce`, every child discovered on the way in is reported as
/// an `Add`; the worker uses this to close the create-before-descriptor
/// race for directories that appear while watching.
#[allow(clippy::too_many_arguments)]
fn register_dir(
    inotify: &Inotify,
    state: &mut State,
    info: &Arc<WatchInfo>,
    abs: PathBuf,
    resolved: PathBuf,
    root_resolved: &Path,
    ancestors: &mut Vec<PathBuf>,
    announce: bool,
    out: &mut Vec<(Arc<WatchInfo>, Event)>,
) -> Result<()> {
    let wd = inotify
        .add_watch(&abs, watch_mask())
        .map_err(|errno| map_errno(errno, &abs))?;
    if let Some(existing) = state.dirs.get(&wd) {
        // The kernel dedupes watches by inode: a second path to an
        // already-watched directory (symlink, overlapping roots) hands
        // back the same descriptor. First binding wins.
        if existing.path != abs || existing.watch != info.id {
            return Ok(());
        }
    }
    state.dirs.insert(
        wd,
        DirBinding {
            watch: info.id,
            path: abs.clone(),
        },
    );
    state.descriptors.insert(abs.clone(), wd);

    if !info.recursive && !announce {
        return Ok(());
    }

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
        if !info.recursive {
            continue;
        }
        if kind != EntryKind::Directory && kind != EntryKind::Symlink {
            continue;
        }
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
        if let Err(err) = register_dir(
            inotify,
            state,
            info,
            child_abs,
            child_resolved,
            root_resolved,
            ancestors,
            announce,
            out,
        ) {
            // A subdirectory may vanish between listing and registration.
            debug!("skipping subdirectory: {err}");
        }
    }
    ancestors.pop();
    Ok(())
}

fn map_errno(errno: Errno, path: &Path) -> Error {
    match errno {
        Errno::ENOENT | Errno::ENOTDIR => Error::FileNotFound(path.to_path_buf()),
        Errno::EACCES | Errno::EPERM => Error::FileNotReadable(path.to_path_buf()),
        Errno::ENOSPC => Error::WatcherFailed(format!(
            "inotify watch limit reached while watching {}",
            path.display()
        )),
        other => Error::Unspecified(format!("inotify_add_watch {}: {other}", path.display())),
    }
}

/// Drops every descriptor belonging to `id`.
fn release_bindings(inotify: &Inotify, state: &mut State, id: WatchId) {
    let owned: Vec<(WatchDescriptor, PathBuf)> = state
        .dirs
        .iter()
        .filter(|(_, binding)| binding.watch == id)
        .map(|(wd, binding)| (*wd, binding.path.clone()))
        .collect();
    for (wd, path) in owned {
        let _ = inotify.rm_watch(wd);
        state.dirs.remove(&wd);
        state.descriptors.remove(&path);
    }
}

fn run(shared: Arc<Shared>) {
    debug!("inotify worker started");
    while shared.running.load(Ordering::Acquire) {
        {
            let fd = shared.inotify.as_fd();
            let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(WAIT_SLICE_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(err) => {
                    error!("poll on inotify fd failed: {err}");
                    thread::sleep(Duration::from_millis(100));
                    continue;
                }
            }
        }
        drain(&shared);
    }
    debug!("inotify worker stopped");
}

/// Reads the queue dry, translates raw events, delivers outside the lock.
fn drain(shared: &Shared) {
    let mut deliveries: Vec<(Arc<WatchInfo>, Event)> = Vec::new();
    let mut lost: Vec<WatchId> = Vec::new();

    {
        let mut state = shared.state.lock();
        let mut pending: Vec<PendingRename> = Vec::new();
        let mut modified_seen: HashSet<(WatchId, PathBuf)> = HashSet::new();

        loop {
            let events = match shared.inotify.read_events() {
                Ok(events) => events,
                Err(Errno::EAGAIN) => break,
                Err(err) => {
                    error!("reading inotify events failed: {err}");
                    break;
                }
            };
            if events.is_empty() {
                break;
            }
            for event in events {
                translate(
                    shared,
                    &mut state,
                    event,
                    &mut pending,
                    &mut modified_seen,
                    &mut deliveries,
                    &mut lost,
                );
            }
        }

        flush_pending(shared, &mut state, pending, &mut deliveries);
    }

    for (info, event) in &deliveries {
        shared.deliverer.deliver(info, event);
    }

    if !lost.is_empty() {
        let mut state = shared.state.lock();
        for id in lost {
            if let Some(info) = state.watches.remove(&id) {
                release_bindings(&shared.inotify, &mut state, id);
                info.retire();
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn translate(
    shared: &Shared,
    state: &mut State,
    event: InotifyEvent,
    pending: &mut Vec<PendingRename>,
    modified_seen: &mut HashSet<(WatchId, PathBuf)>,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
    lost: &mut Vec<WatchId>,
) {
    if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
        warn!("inotify queue overflowed, resynchronizing descriptors");
        error::log_error(Error::WatcherFailed("inotify queue overflow".into()));
        resync(shared, state);
        return;
    }

    let Some(binding) = state.dirs.get(&event.wd).cloned() else {
        return;
    };

    if event.mask.contains(AddWatchFlags::IN_IGNORED) {
        state.dirs.remove(&event.wd);
        state.descriptors.remove(&binding.path);
        return;
    }

    let Some(info) = state.watches.get(&binding.watch).map(Arc::clone) else {
        return;
    };

    if event
        .mask
        .intersects(AddWatchFlags::IN_DELETE_SELF | AddWatchFlags::IN_MOVE_SELF)
    {
        if binding.path == info.root {
            deliveries.push((Arc::clone(&info), info.event("", Action::Delete, None)));
            error::log_error(Error::WatcherFailed(format!(
                "watch root disappeared: {}",
                info.root.display()
            )));
            lost.push(info.id);
        }
        return;
    }

    let Some(name) = event.name else {
        return;
    };
    let abs = binding.path.join(&name);
    let rel = info.relative(&abs);
    let is_dir = event.mask.contains(AddWatchFlags::IN_ISDIR);

    if event.mask.contains(AddWatchFlags::IN_CREATE) {
        deliveries.push((Arc::clone(&info), info.event(rel, Action::Add, None)));
        if is_dir && info.recursive {
            register_created_dir(shared, state, &info, &abs, deliveries);
        }
    } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
        let event = info.event(rel, Action::Delete, None);
        deliveries.push((info, event));
    } else if event.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
        pending.push(PendingRename {
            cookie: event.cookie,
            watch: info.id,
            abs,
            rel,
            is_dir,
        });
    } else if event.mask.contains(AddWatchFlags::IN_MOVED_TO) {
        let partner = pending
            .iter()
            .position(|p| p.cookie == event.cookie && p.watch == info.id);
        if let Some(index) = partner {
            let from = pending.remove(index);
            if from.is_dir {
                repath_bindings(state, &from.abs, &abs);
            }
            deliveries.push((
                Arc::clone(&info),
                info.event(rel, Action::Moved, Some(from.rel)),
            ));
        } else {
            deliveries.push((Arc::clone(&info), info.event(rel, Action::Add, None)));
            if is_dir && info.recursive {
                register_created_dir(shared, state, &info, &abs, deliveries);
            }
        }
    } else if event.mask.intersects(
        AddWatchFlags::IN_MODIFY | AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_ATTRIB,
    ) {
        if modified_seen.insert((info.id, rel.clone())) {
            let event = info.event(rel, Action::Modified, None);
            deliveries.push((info, event));
        }
    }
}

/// Registers a directory that appeared inside a recursive watch and
/// announces children created before the descriptor existed.
fn register_created_dir(
    shared: &Shared,
    state: &mut State,
    info: &Arc<WatchInfo>,
    abs: &Path,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
) {
    let Ok(root_resolved) = fs::canonicalize(&info.root) else {
        return;
    };
    let Some(resolved) = fsutil::descend_target(
        abs,
        &root_resolved,
        &[],
        matches!(fsutil::classify(abs), fsutil::PathKind::Symlink(_)),
        info.follow_symlinks,
        info.allow_out_of_scope,
    ) else {
        return;
    };
    let mut ancestors = vec![root_resolved.clone()];
    if let Err(err) = register_dir(
        &shared.inotify,
        state,
        info,
        abs.to_path_buf(),
        resolved,
        &root_resolved,
        &mut ancestors,
        true,
        deliveries,
    ) {
        debug!("late registration of {} failed: {err}", abs.display());
    }
}

/// Rebases descriptor bindings after a directory rename inside a watch.
fn repath_bindings(state: &mut State, from: &Path, to: &Path) {
    let moved: Vec<WatchDescriptor> = state
        .dirs
        .iter()
        .filter(|(_, binding)| binding.path.starts_with(from))
        .map(|(wd, _)| *wd)
        .collect();
    for wd in moved {
        if let Some(binding) = state.dirs.get_mut(&wd) {
            let suffix = binding
                .path
                .strip_prefix(from)
                .expect("binding under prefix")
                .to_path_buf();
            state.descriptors.remove(&binding.path);
            binding.path = to.join(suffix);
            state.descriptors.insert(binding.path.clone(), wd);
        }
    }
}

/// Unpaired halves left at the end of a drain: a moved-from with no
/// partner is a departure, and its descriptors go with it.
fn flush_pending(
    shared: &Shared,
    state: &mut State,
    pending: Vec<PendingRename>,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
) {
    for entry in pending {
        let Some(info) = state.watches.get(&entry.watch).map(Arc::clone) else {
            continue;
        };
        deliveries.push((
            Arc::clone(&info),
            info.event(entry.rel, Action::Delete, None),
        ));
        if entry.is_dir {
            let owned: Vec<(WatchDescriptor, PathBuf)> = state
                .dirs
                .iter()
                .filter(|(_, binding)| binding.path.starts_with(&entry.abs))
                .map(|(wd, binding)| (*wd, binding.path.clone()))
                .collect();
            for (wd, path) in owned {
                let _ = shared.inotify.rm_watch(wd);
                state.dirs.remove(&wd);
                state.descriptors.remove(&path);
            }
        }
    }
}

/// After an overflow the descriptor set may be stale: directories created
/// while the queue was full were never registered. Walk every recursive
/// root and fill the gaps.
fn resync(shared: &Shared, state: &mut State) {
    let infos: Vec<Arc<WatchInfo>> = state.watches.values().cloned().collect();
    for info in infos {
        if !info.recursive {
            continue;
        }
        if let Err(err) = register_tree(&shared.inotify, state, &info) {
            warn!("resync of {} failed: {err}", info.root.display());
        }
    }
}
