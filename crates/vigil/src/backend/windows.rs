//! Windows backend on top of ReadDirectoryChangesW
//!
//! Each watch keeps an overlapped read outstanding on its directory
//! handle; a single worker waits on the completion events. The kernel
//! walks subtrees for us, names arrive relative to the watch root, and
//! renames are two explicit records (old name, new name) we pair back up.

use crate::backend::Backend;
use crate::error::{self, Error, Result};
use crate::event::{Action, Event, WatchId};
use crate::options;
use crate::watch::{Deliverer, WatchInfo};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::io;
use std::mem::size_of;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};
use windows_sys::Win32::Foundation::{
    ERROR_INVALID_FUNCTION, ERROR_IO_PENDING, ERROR_NOTIFY_ENUM_DIR, ERROR_OPERATION_ABORTED,
    HANDLE, INVALID_HANDLE_VALUE, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
    FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
    FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
    FILE_NOTIFY_CHANGE_DIR_NAME, FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_WRITE,
    FILE_NOTIFY_CHANGE_SIZE, FILE_NOTIFY_INFORMATION, FILE_SHARE_DELETE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Threading::{CreateEventW, SetEvent, WaitForMultipleObjects};
use windows_sys::Win32::System::IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED};

const INFINITE: u32 = 0xFFFF_FFFF;
/// WaitForMultipleObjects limit; one slot goes to the wake event.
const MAX_WATCHES: usize = 63;

fn default_filter() -> u32 {
    FILE_NOTIFY_CHANGE_FILE_NAME
        | FILE_NOTIFY_CHANGE_DIR_NAME
        | FILE_NOTIFY_CHANGE_SIZE
        | FILE_NOTIFY_CHANGE_LAST_WRITE
}

pub(crate) struct WinWatcher {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    running: AtomicBool,
    deliverer: Deliverer,
    wake: OwnedHandle,
    state: Mutex<State>,
}

// Raw HANDLEs travel with their owning watch record.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

#[derive(Default)]
struct State {
    watches: BTreeMap<WatchId, WinWatch>,
}

struct WinWatch {
    info: Arc<WatchInfo>,
    dir: OwnedHandle,
    event: OwnedHandle,
    overlapped: Box<OVERLAPPED>,
    buffer: Vec<u8>,
    filter: u32,
    armed: bool,
}

impl WinWatcher {
    pub fn new() -> Result<Self> {
        let wake = create_event().map_err(|err| {
            Error::Unspecified(format!("could not create wake event: {err}"))
        })?;
        Ok(Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                deliverer: Deliverer::new(),
                wake,
                state: Mutex::new(State::default()),
            }),
            worker: Mutex::new(None),
        })
    }
}

impl Backend for WinWatcher {
    fn add(&self, info: Arc<WatchInfo>) -> Result<WatchId> {
        let mut state = self.shared.state.lock();
        if state.watches.len() >= MAX_WATCHES {
            return Err(Error::Unspecified(format!(
                "watch limit of {MAX_WATCHES} reached"
            )));
        }

        let dir = open_directory(&info.root)?;
        let event = create_event().map_err(|err| {
            Error::Unspecified(format!("could not create completion event: {err}"))
        })?;
        let buffer_size = options::effective_buffer_size(&info.options) as usize;
        let filter = options::notify_filter(&info.options).unwrap_or_else(default_filter);

        let mut watch = WinWatch {
            info: Arc::clone(&info),
            dir,
            event,
            overlapped: Box::new(unsafe { std::mem::zeroed() }),
            buffer: vec![0u8; buffer_size],
            filter,
            armed: false,
        };
        issue_read(&mut watch).map_err(|err| {
            if err.raw_os_error() == Some(ERROR_INVALID_FUNCTION as i32) {
                Error::FileRemote(info.root.clone())
            } else {
                Error::WatcherFailed(format!(
                    "ReadDirectoryChangesW on {}: {err}",
                    info.root.display()
                ))
            }
        })?;

        state.watches.insert(info.id, watch);
        drop(state);
        self.kick();
        Ok(info.id)
    }

    fn remove(&self, id: WatchId) {
        let watch = self.shared.state.lock().watches.remove(&id);
        if let Some(mut watch) = watch {
            // The kernel owns the buffer until the canceled read drains.
            if watch.armed {
                let mut transferred = 0u32;
                unsafe {
                    CancelIoEx(
                        watch.dir.as_raw_handle() as HANDLE,
                        watch.overlapped.as_mut(),
                    );
                    GetOverlappedResult(
                        watch.dir.as_raw_handle() as HANDLE,
                        watch.overlapped.as_mut(),
                        &mut transferred,
                        1,
                    );
                }
            }
            watch.info.retire();
            self.kick();
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
            .find(|watch| watch.info.root == root)
            .map(|watch| watch.info.id);
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
            .map(|watch| watch.info.root.clone())
            .collect()
    }

    fn start(&self) -> Result<()> {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let shared = Arc::clone(&self.shared);
        match thread::Builder::new()
            .name("vigil-rdcw".into())
            .spawn(move || run(shared))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Unspecified(format!(
                    "failed to spawn watcher worker: {err}"
                )))
            }
        }
    }

    fn stop(&self) {
        self.shared.running.store(false, Ordering::Release);
        self.kick();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        let mut state = self.shared.state.lock();
        for watch in state.watches.values_mut() {
            if watch.armed {
                let mut transferred = 0u32;
                unsafe {
                    CancelIoEx(
                        watch.dir.as_raw_handle() as HANDLE,
                        watch.overlapped.as_mut(),
                    );
                    GetOverlappedResult(
                        watch.dir.as_raw_handle() as HANDLE,
                        watch.overlapped.as_mut(),
                        &mut transferred,
                        1,
                    );
                }
            }
            watch.info.retire();
        }
        state.watches.clear();
    }
}

impl WinWatcher {
    fn kick(&self) {
        unsafe {
            SetEvent(self.shared.wake.as_raw_handle() as HANDLE);
        }
    }
}

impl Drop for WinWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_directory(path: &Path) -> Result<OwnedHandle> {
    let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
    wide.push(0);
    let handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            FILE_LIST_DIRECTORY,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
            ptr::null_mut() as HANDLE,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        let err = io::Error::last_os_error();
        return Err(match err.kind() {
            io::ErrorKind::NotFound => Error::FileNotFound(path.to_path_buf()),
            io::ErrorKind::PermissionDenied => Error::FileNotReadable(path.to_path_buf()),
            _ => Error::Unspecified(format!("CreateFileW {}: {err}", path.display())),
        });
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

fn create_event() -> io::Result<OwnedHandle> {
    let handle = unsafe { CreateEventW(ptr::null(), 0, 0, ptr::null()) };
    if handle == 0 as HANDLE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as RawHandle) })
}

/// Queues the next overlapped read for a watch.
fn issue_read(watch: &mut WinWatch) -> io::Result<()> {
    *watch.overlapped = unsafe { std::mem::zeroed() };
    watch.overlapped.hEvent = watch.event.as_raw_handle() as HANDLE;

    let ok = unsafe {
        ReadDirectoryChangesW(
            watch.dir.as_raw_handle() as HANDLE,
            watch.buffer.as_mut_ptr().cast(),
            watch.buffer.len() as u32,
            watch.info.recursive as i32,
            watch.filter,
            ptr::null_mut(),
            watch.overlapped.as_mut(),
            None,
        )
    };
    if ok == 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(ERROR_IO_PENDING as i32) {
            watch.armed = false;
            return Err(err);
        }
    }
    watch.armed = true;
    Ok(())
}

fn run(shared: Arc<Shared>) {
    debug!("watcher worker started");
    while shared.running.load(Ordering::Acquire) {
        let mut handles: Vec<HANDLE> = vec![shared.wake.as_raw_handle() as HANDLE];
        let mut ids: Vec<WatchId> = Vec::new();
        {
            let mut state = shared.state.lock();
            for (id, watch) in state.watches.iter_mut() {
                if !watch.armed {
                    if let Err(err) = issue_read(watch) {
                        error!(
                            "re-arming watch on {} failed: {err}",
                            watch.info.root.display()
                        );
                        continue;
                    }
                }
                handles.push(watch.event.as_raw_handle() as HANDLE);
                ids.push(*id);
            }
        }

        let signaled = unsafe {
            WaitForMultipleObjects(handles.len() as u32, handles.as_ptr(), 0, INFINITE)
        };
        if signaled == WAIT_FAILED {
            error!("WaitForMultipleObjects failed: {}", io::Error::last_os_error());
            break;
        }
        let index = (signaled - WAIT_OBJECT_0) as usize;
        if index == 0 {
            // Wake event: watch set changed or stop requested.
            continue;
        }
        let Some(id) = ids.get(index - 1).copied() else {
            continue;
        };

        let mut deliveries: Vec<(Arc<WatchInfo>, Event)> = Vec::new();
        {
            let mut state = shared.state.lock();
            if let Some(watch) = state.watches.get_mut(&id) {
                complete_read(watch, &mut deliveries);
            }
        }
        for (info, event) in &deliveries {
            shared.deliverer.deliver(info, event);
        }
    }
    debug!("watcher worker stopped");
}

/// Harvests one completed read and queues the next.
fn complete_read(watch: &mut WinWatch, deliveries: &mut Vec<(Arc<WatchInfo>, Event)>) {
    watch.armed = false;
    let mut transferred: u32 = 0;
    let ok = unsafe {
        GetOverlappedResult(
            watch.dir.as_raw_handle() as HANDLE,
            watch.overlapped.as_mut(),
            &mut transferred,
            0,
        )
    };
    if ok == 0 {
        let err = io::Error::last_os_error();
        match err.raw_os_error().map(|code| code as u32) {
            Some(ERROR_OPERATION_ABORTED) => return,
            Some(ERROR_NOTIFY_ENUM_DIR) => {
                overflowed(watch, deliveries);
            }
            _ => {
                error!(
                    "completion on {} failed: {err}",
                    watch.info.root.display()
                );
            }
        }
        let _ = issue_read(watch);
        return;
    }

    if transferred == 0 {
        // Zero bytes means the kernel dropped records for lack of buffer.
        overflowed(watch, deliveries);
        let _ = issue_read(watch);
        return;
    }

    decode_records(watch, transferred as usize, deliveries);
    let _ = issue_read(watch);
}

fn overflowed(watch: &WinWatch, _deliveries: &mut [(Arc<WatchInfo>, Event)]) {
    warn!(
        root = %watch.info.root.display(),
        "change buffer overflowed, events were lost"
    );
    error::log_error(Error::WatcherFailed(format!(
        "change buffer overflow under {}",
        watch.info.root.display()
    )));
}

/// Walks the packed `FILE_NOTIFY_INFORMATION` list.
fn decode_records(
    watch: &mut WinWatch,
    length: usize,
    deliveries: &mut Vec<(Arc<WatchInfo>, Event)>,
) {
    let info = Arc::clone(&watch.info);
    let buffer = &watch.buffer[..length];
    let mut pending_old: Option<PathBuf> = None;
    let mut modified_seen: HashSet<PathBuf> = HashSet::new();
    let mut offset = 0usize;

    loop {
        if buffer.len() - offset < size_of::<FILE_NOTIFY_INFORMATION>() {
            break;
        }
        let record = unsafe {
            &*(buffer[offset..].as_ptr() as *const FILE_NOTIFY_INFORMATION)
        };
        let name_len = record.FileNameLength as usize / 2;
        let name_slice =
            unsafe { std::slice::from_raw_parts(record.FileName.as_ptr(), name_len) };
        let name = PathBuf::from(OsString::from_wide(name_slice));

        match record.Action {
            FILE_ACTION_ADDED => {
                if let Some(old) = pending_old.take() {
                    deliveries.push((Arc::clone(&info), info.event(old, Action::Delete, None)));
                }
                deliveries.push((Arc::clone(&info), info.event(name, Action::Add, None)));
            }
            FILE_ACTION_REMOVED => {
                if let Some(old) = pending_old.take() {
                    deliveries.push((Arc::clone(&info), info.event(old, Action::Delete, None)));
                }
                deliveries.push((Arc::clone(&info), info.event(name, Action::Delete, None)));
            }
            FILE_ACTION_MODIFIED => {
                if let Some(old) = pending_old.take() {
                    deliveries.push((Arc::clone(&info), info.event(old, Action::Delete, None)));
                }
                if modified_seen.insert(name.clone()) {
                    deliveries.push((
                        Arc::clone(&info),
                        info.event(name, Action::Modified, None),
                    ));
                }
            }
            FILE_ACTION_RENAMED_OLD_NAME => {
                if let Some(old) = pending_old.take() {
                    deliveries.push((Arc::clone(&info), info.event(old, Action::Delete, None)));
                }
                pending_old = Some(name);
            }
            FILE_ACTION_RENAMED_NEW_NAME => match pending_old.take() {
                Some(old) => {
                    deliveries.push((
                        Arc::clone(&info),
                        info.event(name, Action::Moved, Some(old)),
                    ));
                }
                None => {
                    deliveries.push((Arc::clone(&info), info.event(name, Action::Add, None)));
                }
            },
            other => {
                debug!(action = other, "unhandled change record");
            }
        }

        if record.NextEntryOffset == 0 {
            break;
        }
        offset += record.NextEntryOffset as usize;
    }

    // A rename whose new half never arrived left the watched tree.
    if let Some(old) = pending_old {
        deliveries.push((Arc::clone(&info), info.event(old, Action::Delete, None)));
    }
}
