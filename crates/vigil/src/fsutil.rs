//! Path normalization and filesystem classification helpers

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// What a path points at, inspected without following symlinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathKind {
    /// The path does not exist.
    Missing,
    /// A regular file (or anything that is not a directory or symlink).
    File,
    /// A directory.
    Directory,
    /// A symbolic link, with its raw (unresolved) target.
    Symlink(PathBuf),
}

/// Kind of a directory entry as recorded in snapshots and listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (only reported when links are not being followed).
    Symlink,
    /// Sockets, fifos, devices.
    Other,
}

/// Classifies `path` without following a trailing symlink.
pub fn classify(path: &Path) -> PathKind {
    match fs::symlink_metadata(path) {
        Err(_) => PathKind::Missing,
        Ok(meta) if meta.file_type().is_symlink() => {
            PathKind::Symlink(fs::read_link(path).unwrap_or_default())
        }
        Ok(meta) if meta.is_dir() => PathKind::Directory,
        Ok(_) => PathKind::File,
    }
}

/// Normalizes `path` to an absolute form, resolving `.` and `..`
/// lexically.
///
/// Symlinks are deliberately left in place: a watch root added through a
/// link keeps its symbolic spelling, so events report the path the caller
/// asked for. Recursive descent resolves links separately.
pub fn canonicalize_root(path: &Path) -> io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    Ok(normalized)
}

/// Lists the immediate children of `path` as `(name, kind)` pairs.
///
/// Order is whatever the OS returns; callers that diff listings sort or
/// use keyed structures.
pub fn list_directory(path: &Path) -> io::Result<Vec<(OsString, EntryKind)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let file_type = match entry.file_type() {
            Ok(file_type) => file_type,
            Err(_) => continue,
        };
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        entries.push((entry.file_name(), kind));
    }
    Ok(entries)
}

/// True when `child` is lexically inside (or equal to) `root`.
pub fn is_lexically_inside(child: &Path, root: &Path) -> bool {
    child.starts_with(root)
}

/// Best-effort check whether `path` lives on a remote filesystem
/// (NFS, SMB/CIFS and friends) that kernel watchers cannot observe.
#[cfg(target_os = "linux")]
pub fn is_remote(path: &Path) -> bool {
    // f_type magics from statfs(2)
    const NFS_SUPER_MAGIC: i64 = 0x6969;
    const SMB_SUPER_MAGIC: i64 = 0x517b;
    const SMB2_SUPER_MAGIC: i64 = 0xfe53_4d42;
    const CIFS_SUPER_MAGIC: i64 = 0xff53_4d42;
    const NCP_SUPER_MAGIC: i64 = 0x564c;
    const CODA_SUPER_MAGIC: i64 = 0x7375_4245;
    const AFS_SUPER_MAGIC: i64 = 0x5346_414f;

    match nix::sys::statfs::statfs(path) {
        Ok(stat) => matches!(
            stat.filesystem_type().0 as i64,
            NFS_SUPER_MAGIC
                | SMB_SUPER_MAGIC
                | SMB2_SUPER_MAGIC
                | CIFS_SUPER_MAGIC
                | NCP_SUPER_MAGIC
                | CODA_SUPER_MAGIC
                | AFS_SUPER_MAGIC
        ),
        Err(_) => false,
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn is_remote(path: &Path) -> bool {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let mut stat = MaybeUninit::<libc::statfs>::uninit();
    let rc = unsafe { libc::statfs(c_path.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return false;
    }
    let stat = unsafe { stat.assume_init() };
    stat.f_flags as u64 & libc::MNT_LOCAL as u64 == 0
}

#[cfg(target_os = "windows")]
pub fn is_remote(path: &Path) -> bool {
    use std::os::windows::ffi::OsStrExt;
    use windows_sys::Win32::Storage::FileSystem::{GetDriveTypeW, DRIVE_REMOTE};

    // UNC paths are remote by construction.
    if path.as_os_str().to_string_lossy().starts_with(r"\\") {
        return true;
    }
    let Some(root) = path.components().next() else {
        return false;
    };
    let mut wide: Vec<u16> = Path::new(&root.as_os_str())
        .join(r"\")
        .as_os_str()
        .encode_wide()
        .collect();
    wide.push(0);
    unsafe { GetDriveTypeW(wide.as_ptr()) == DRIVE_REMOTE }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    target_os = "windows"
)))]
pub fn is_remote(_path: &Path) -> bool {
    false
}

/// Decides whether a recursive walk may enter `child_abs`.
///
/// Returns the resolved form of the directory when descent is permitted.
/// `ancestors` holds the resolved paths of every directory on the current
/// descent chain; a resolved target already present there is a symlink
/// cycle and is skipped. Targets of links resolving outside
/// `root_resolved` are skipped unless `allow_out_of_scope` is set.
pub(crate) fn descend_target(
    child_abs: &Path,
    root_resolved: &Path,
    ancestors: &[PathBuf],
    is_symlink: bool,
    follow_symlinks: bool,
    allow_out_of_scope: bool,
) -> Option<PathBuf> {
    if is_symlink && !follow_symlinks {
        return None;
    }
    let resolved = fs::canonicalize(child_abs).ok()?;
    if ancestors.iter().any(|ancestor| *ancestor == resolved) {
        debug!(path = %child_abs.display(), "skipping symlink cycle");
        return None;
    }
    if is_symlink
        && !allow_out_of_scope
        && !is_lexically_inside(&resolved, root_resolved)
    {
        debug!(
            path = %child_abs.display(),
            target = %resolved.display(),
            "skipping out-of-scope symlink"
        );
        return None;
    }
    Some(resolved)
}
