//! macOS backend on top of FSEvents
//!
//! One event stream per watch root, scheduled on a dedicated CFRunLoop
//! thread. The stream hands us per-item hints; we keep per-directory
//! snapshots and rescan the affected directory to turn coarse hints into
//! concrete add/delete/modify events. Renames carry consecutive event ids
//! on the two halves, which is what the pairing below keys on.

use crate::backend::Backend;
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::fsutil::{self, EntryKind};
use crate::snapshot::{self, Change, Snapshot};
use crate::watch::{Deliverer, WatchInfo};
use fsevent_sys as fs;
use fsevent_sys::core_foundation as cf;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Latency passed to the stream, in seconds. Zero keeps delivery prompt;
/// coalescing happens in our own rescan instead.
const STREAM_LATENCY: cf::CFTimeInterval = 0.05;

pub(crate) struct FsEventsWatcher {
    shared: Arc<Shared>,
}

struct Shared {
    deliverer: Arc<Deliverer>,
    streams: Mutex<BTreeMap<WatchId, StreamHandle>>,
}

struct StreamHandle {
    info: Arc<WatchInfo>,
    runloop: RunLoopHandle,
    thread: Option<JoinHandle<()>>,
}

/// CFRunLoopRef for cross-thread stop. The run loop outlives the handle:
/// the owning thread only exits after CFRunLoopStop.
struct RunLoopHandle(cf::CFRunLoopRef);
unsafe impl Send for RunLoopHandle {}

/// State owned by one stream's callback.
struct StreamState {
    info: Arc<WatchInfo>,
    deliverer: Arc<Deliverer>,
    nodes: Mutex<HashMap<PathBuf, Snapshot>>,
    pending_rename: Mutex<Option<(fs::FSEventStreamEventId, PathBuf)>>,
    root_gone: Mutex<bool>,
}

impl FsEventsWatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                deliverer: Arc::new(Deliverer::new()),
                streams: Mutex::new(BTreeMap::new()),
            }),
        }
    }
}

impl Backend for FsEventsWatcher {
    fn add(&self, info: Arc<WatchInfo>) -> Result<WatchId> {
        let mut streams = self.shared.streams.lock();

        let state = Arc::new(StreamState {
            info: Arc::clone(&info),
            deliverer: Arc::clone(&self.shared.deliverer),
            nodes: Mutex::new(HashMap::new()),
            pending_rename: Mutex::new(None),
            root_gone: Mutex::new(false),
        });
        build_nodes(&state);

        let (runloop_tx, runloop_rx) = std::sync::mpsc::channel();
        let thread_state = Arc::clone(&state);
        let root = info.root.clone();
        let thread = thread::Builder::new()
            .name(format!("vigil-fsevents-{}", info.id))
            .spawn(move || stream_thread(root, thread_state, runloop_tx))
            .map_err(|err| {
                Error::Unspecified(format!("failed to spawn fsevents thread: {err}"))
            })?;

        let runloop = match runloop_rx.recv() {
            Ok(Ok(runloop)) => runloop,
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(Error::WatcherFailed(format!(
                    "fsevents stream for {} never came up",
                    info.root.display()
                )));
            }
        };

        streams.insert(
            info.id,
            StreamHandle {
                info: Arc::clone(&info),
                runloop,
                thread: Some(thread),
            },
        );
        Ok(info.id)
    }

    fn remove(&self, id: WatchId) {
        let handle = self.shared.streams.lock().remove(&id);
        if let Some(mut handle) = handle {
            handle.info.retire();
            unsafe { cf::CFRunLoopStop(handle.runloop.0) };
            if let Some(thread) = handle.thread.take() {
                let _ = thread.join();
            }
            self.shared.deliverer.wait_idle();
        }
    }

    fn remove_by_root(&self, root: &Path) {
        let id = self
            .shared
            .streams
            .lock()
            .values()
            .find(|handle| handle.info.root == root)
            .map(|handle| handle.info.id);
        if let Some(id) = id {
            self.remove(id);
        }
    }

    fn list_roots(&self) -> Vec<PathBuf> {
        self.shared
            .streams
            .lock()
            .values()
            .map(|handle| handle.info.root.clone())
            .collect()
    }

    fn start(&self) -> Result<()> {
        // Streams run from the moment a watch is added.
        Ok(())
    }

    fn stop(&self) {
        let ids: Vec<WatchId> = self.shared.streams.lock().keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }
}

impl Drop for FsEventsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Seeds the per-directory snapshots for a fresh watch, silently.
fn build_nodes(state: &StreamState) {
    let info = &state.info;
    let Ok(root_resolved) = std::fs::canonicalize(&info.root) else {
        return;
    };
    let mut nodes = state.nodes.lock();
    let mut stack = vec![(PathBuf::new(), info.root.clone())];
    // Resolved paths already queued or visited. Coarser than a strict
    // ancestor chain, which is fine for seeding: any second route to a
    // directory would only duplicate its snapshot.
    let mut visited: Vec<PathBuf> = vec![root_resolved.clone()];
    while let Some((rel, abs)) = stack.pop() {
        let Ok(snapshot) = snapshot::capture(&abs, info.follow_symlinks) else {
            continue;
        };
        if info.recursive {
            for (name, meta) in &snapshot {
                if meta.kind != EntryKind::Directory {
                    continue;
                }
                let child_abs = abs.join(name);
                let is_symlink = matches!(
                    std::fs::symlink_metadata(&child_abs),
                    Ok(meta) if meta.file_type().is_symlink()
                );
                if let Some(child_resolved) = fsutil::descend_target(
                    &child_abs,
                    &root_resolved,
                    &visited,
                    is_symlink,
                    info.follow_symlinks,
                    info.allow_out_of_scope,
                ) {
                    visited.push(child_resolved);
                    stack.push((rel.join(name), child_abs));
                }
            }
        }
        nodes.insert(rel, snapshot);
    }
}

fn stream_thread(
    root: PathBuf,
    state: Arc<StreamState>,
    ready: std::sync::mpsc::Sender<Result<RunLoopHandle>>,
) {
    unsafe {
        let paths = cf::CFArrayCreateMutable(
            cf::kCFAllocatorDefault,
            0,
            &cf::kCFTypeArrayCallBacks,
        );
        let Some(root_str) = root.to_str() else {
            let _ = ready.send(Err(Error::Unspecified(format!(
                "watch root is not valid UTF-8: {}",
                root.display()
            ))));
            return;
        };
        let mut cf_err: cf::CFErrorRef = ptr::null_mut();
        let cf_path = cf::str_path_to_cfstring_ref(root_str, &mut cf_err);
        if !cf_err.is_null() || cf_path.is_null() {
            let _ = ready.send(Err(Error::WatcherFailed(format!(
                "could not build CFString for {}",
                root.display()
            ))));
            return;
        }
        cf::CFArrayAppendValue(paths, cf_path);
        cf::CFRelease(cf_path);

        let state_ptr = Arc::into_raw(Arc::clone(&state)) as *mut c_void;
        let context = fs::FSEventStreamContext {
            version: 0,
            info: state_ptr,
            retain: None,
            release: Some(release_state),
            copy_description: None,
        };

        let stream = fs::FSEventStreamCreate(
            cf::kCFAllocatorDefault,
            stream_callback,
            &context,
            paths,
            fs::kFSEventStreamEventIdSinceNow,
            STREAM_LATENCY,
            fs::kFSEventStreamCreateFlagFileEvents
                | fs::kFSEventStreamCreateFlagNoDefer
                | fs::kFSEventStreamCreateFlagWatchRoot,
        );
        cf::CFRelease(paths);
        if stream.is_null() {
            let _ = ready.send(Err(Error::WatcherFailed(format!(
                "FSEventStreamCreate failed for {}",
                root.display()
            ))));
            return;
        }

        let runloop = cf::CFRunLoopGetCurrent();
        fs::FSEventStreamScheduleWithRunLoop(stream, runloop, cf::kCFRunLoopDefaultMode);
        if fs::FSEventStreamStart(stream) == 0 {
            fs::FSEventStreamInvalidate(stream);
            fs::FSEventStreamRelease(stream);
            let _ = ready.send(Err(Error::WatcherFailed(format!(
                "FSEventStreamStart failed for {}",
                root.display()
            ))));
            return;
        }

        debug!(root = %root.display(), "fsevents stream running");
        let _ = ready.send(Ok(RunLoopHandle(runloop)));
        cf::CFRunLoopRun();

        fs::FSEventStreamStop(stream);
        fs::FSEventStreamInvalidate(stream);
        fs::FSEventStreamRelease(stream);
        debug!(root = %root.display(), "fsevents stream torn down");
    }
}

extern "C" fn release_state(info: *const c_void) {
    unsafe { drop(Arc::from_raw(info as *const StreamState)) };
}

extern "C" fn stream_callback(
    _stream: fs::FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const fs::FSEventStreamEventFlags,
    event_ids: *const fs::FSEventStreamEventId,
) {
    let state = unsafe { &*(info as *const StreamState) };
    let paths = event_paths as *const *const c_char;

    for index in 0..num_events {
        let (path, flags, id) = unsafe {
            let raw = *paths.add(index);
            if raw.is_null() {
                continue;
            }
            let bytes = CStr::from_ptr(raw).to_bytes();
            (
                PathBuf::from(String::from_utf8_lossy(bytes).into_owned()),
                *event_flags.add(index),
                *event_ids.add(index),
            )
        };
        handle_stream_event(state, path, flags, id);
    }
}

fn handle_stream_event(
    state: &StreamState,
    path: PathBuf,
    flags: fs::FSEventStreamEventFlags,
    id: fs::FSEventStreamEventId,
) {
    let info = &state.info;

    if flags & fs::kFSEventStreamEventFlagRootChanged != 0 {
        handle_root_change(state);
        return;
    }
    if flags & fs::kFSEventStreamEventFlagMustScanSubDirs != 0 {
        warn!(root = %info.root.display(), "fsevents dropped events, rescanning root");
        error::log_error(Error::WatcherFailed(format!(
            "fsevents dropped events under {}",
            info.root.display()
        )));
        rescan_tree(state);
        return;
    }

    // Two halves of one rename arrive with consecutive event ids.
    if flags & fs::kFSEventStreamEventFlagItemRenamed != 0 {
        let mut pending = state.pending_rename.lock();
        if let Some((pending_id, from)) = pending.take() {
            if id == pending_id + 1 {
                finish_rename(state, from, path);
                return;
            }
            // Not our partner; resolve the stale half first.
            drop(pending);
            finish_half_rename(state, from);
            *state.pending_rename.lock() = Some((id, path));
            return;
        }
        *pending = Some((id, path));
        return;
    }

    // Anything else: flush a dangling rename half, then rescan the
    // directory the item lives in.
    if let Some((_, from)) = state.pending_rename.lock().take() {
        finish_half_rename(state, from);
    }
    let dir = if flags & fs::kFSEventStreamEventFlagItemIsDir != 0 {
        path
    } else {
        path.parent().map(Path::to_path_buf).unwrap_or(path)
    };
    rescan_dir(state, &dir);
}

/// The watched root itself changed (removed, renamed or reappeared).
fn handle_root_change(state: &StreamState) {
    let info = &state.info;
    let mut gone = state.root_gone.lock();
    let exists = std::fs::metadata(&info.root)
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    if !exists && !*gone {
        *gone = true;
        state.nodes.lock().clear();
        let event = info.event("", Action::Delete, None);
        state.deliverer.deliver(info, &event);
        error::log_error(Error::WatcherFailed(format!(
            "watch root disappeared: {}",
            info.root.display()
        )));
    } else if exists && *gone {
        *gone = false;
        let event = info.event("", Action::Add, None);
        state.deliverer.deliver(info, &event);
        build_nodes(state);
    }
}

fn finish_rename(state: &StreamState, from: PathBuf, to: PathBuf) {
    let info = &state.info;
    let from_rel = info.relative(&from);
    let to_rel = info.relative(&to);
    let from_inside = from.starts_with(&info.root);
    let to_inside = to.starts_with(&info.root);

    let event = match (from_inside, to_inside) {
        (true, true) => info.event(to_rel.clone(), Action::Moved, Some(from_rel.clone())),
        (true, false) => info.event(from_rel.clone(), Action::Delete, None),
        (false, true) => info.event(to_rel.clone(), Action::Add, None),
        (false, false) => return,
    };
    state.deliverer.deliver(info, &event);
    refresh_after_rename(state, &from, &to);
}

/// A rename half whose partner never arrived: the other side lives
/// outside the watched tree, so it degrades to an add or a delete.
fn finish_half_rename(state: &StreamState, path: PathBuf) {
    let info = &state.info;
    let rel = info.relative(&path);
    let event = if path.exists() {
        info.event(rel, Action::Add, None)
    } else {
        info.event(rel, Action::Delete, None)
    };
    state.deliverer.deliver(info, &event);
    if let Some(parent) = path.parent() {
        refresh_snapshot_only(state, parent);
    }
}

/// Re-captures snapshots around a rename without emitting diff events,
/// so the explicit Moved is not followed by a synthetic delete/add pair.
fn refresh_after_rename(state: &StreamState, from: &Path, to: &Path) {
    for side in [from, to] {
        if let Some(parent) = side.parent() {
            refresh_snapshot_only(state, parent);
        }
    }
}

fn refresh_snapshot_only(state: &StreamState, dir_abs: &Path) {
    let info = &state.info;
    if !dir_abs.starts_with(&info.root) {
        return;
    }
    let rel = info.relative(dir_abs);
    let mut nodes = state.nodes.lock();
    if !nodes.contains_key(&rel) && !rel.as_os_str().is_empty() {
        return;
    }
    if let Ok(snapshot) = snapshot::capture(dir_abs, info.follow_symlinks) {
        nodes.insert(rel, snapshot);
    }
}

/// Diffs one directory against its snapshot and delivers the changes.
fn rescan_dir(state: &StreamState, dir_abs: &Path) {
    let info = &state.info;
    if *state.root_gone.lock() {
        return;
    }
    if !dir_abs.starts_with(&info.root) {
        return;
    }
    let rel = info.relative(dir_abs);
    if !info.recursive && !rel.as_os_str().is_empty() {
        return;
    }

    let new_snapshot = match snapshot::capture(dir_abs, info.follow_symlinks) {
        Ok(snapshot) => snapshot,
        Err(err) => {
            debug!("rescan of {} failed: {err}", dir_abs.display());
            return;
        }
    };

    let old_snapshot = {
        let nodes = state.nodes.lock();
        match nodes.get(&rel) {
            Some(snapshot) => snapshot.clone(),
            // A directory we never tracked; its announcement comes from
            // the parent's diff.
            None => Snapshot::new(),
        }
    };

    let mut events = Vec::new();
    for change in snapshot::diff(&old_snapshot, &new_snapshot) {
        match change {
            Change::Added(name) => {
                let child_rel = rel.join(&name);
                events.push(info.event(child_rel.clone(), Action::Add, None));
                if info.recursive
                    && new_snapshot
                        .get(&name)
                        .map(|meta| meta.kind == EntryKind::Directory)
                        .unwrap_or(false)
                {
                    announce_subtree(state, &dir_abs.join(&name), &mut events);
                }
            }
            Change::Deleted(name) => {
                let child_rel = rel.join(&name);
                drop_nodes_under(state, &child_rel);
                events.push(info.event(child_rel, Action::Delete, None));
            }
            Change::Modified(name) => {
                events.push(info.event(rel.join(&name), Action::Modified, None));
            }
            Change::Renamed { from, to } => {
                events.push(info.event(
                    rel.join(&to),
                    Action::Moved,
                    Some(rel.join(&from)),
                ));
            }
        }
    }

    state.nodes.lock().insert(rel, new_snapshot);
    for event in &events {
        state.deliverer.deliver(info, event);
    }
}

/// Announces a directory that appeared inside a recursive watch and
/// starts tracking it.
fn announce_subtree(state: &StreamState, dir_abs: &Path, events: &mut Vec<Event>) {
    let info = &state.info;
    let Ok(snapshot) = snapshot::capture(dir_abs, info.follow_symlinks) else {
        return;
    };
    let rel = info.relative(dir_abs);
    for (name, meta) in &snapshot {
        events.push(info.event(rel.join(name), Action::Add, None));
        if meta.kind == EntryKind::Directory {
            announce_subtree(state, &dir_abs.join(name), events);
        }
    }
    state.nodes.lock().insert(rel, snapshot);
}

fn drop_nodes_under(state: &StreamState, rel: &Path) {
    let mut nodes = state.nodes.lock();
    nodes.retain(|key, _| !key.starts_with(rel));
}

/// Full resync after the stream reports dropped events.
fn rescan_tree(state: &StreamState) {
    let dirs: Vec<PathBuf> = {
        let nodes = state.nodes.lock();
        nodes.keys().cloned().collect()
    };
    for rel in dirs {
        let abs = state.info.root.join(&rel);
        rescan_dir(state, &abs);
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            unsafe { cf::CFRunLoopStop(self.runloop.0) };
            let _ = thread.join();
        }
    }
}
