//! Directory snapshots and diff-based event derivation
//!
//! The polling backend and the native backends that re-enumerate on a
//! directory-changed signal (kqueue, fsevents) all derive events the same
//! way: capture the directory's entries, diff against the previous
//! snapshot, synthesize a rename when exactly one entry left and exactly
//! one appeared with matching metadata.

use crate::fsutil::EntryKind;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Two mtimes within this tolerance are considered equal when pairing a
/// delete/add into a rename.
const RENAME_MTIME_TOLERANCE: Duration = Duration::from_secs(1);

/// Metadata recorded per directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryMeta {
    pub kind: EntryKind,
    pub mtime: SystemTime,
    pub size: u64,
}

/// One directory's entries, keyed by name. Replaced wholesale per rescan.
pub(crate) type Snapshot = BTreeMap<OsString, EntryMeta>;

/// A change derived from two snapshots of the same directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Change {
    Added(OsString),
    Deleted(OsString),
    Modified(OsString),
    Renamed { from: OsString, to: OsString },
}

/// Captures the current entries of `dir`.
///
/// With `follow_symlinks` the recorded kind and metadata are those of the
/// link target, so a link to a directory diffs like a directory. Without
/// it the link itself is the entry. Entries that vanish mid-listing are
/// skipped and picked up by the next capture.
pub(crate) fn capture(dir: &Path, follow_symlinks: bool) -> io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        let path = entry.path();
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(_) => continue,
        };
        let meta = if meta.file_type().is_symlink() && follow_symlinks {
            // Dangling links keep their own metadata.
            fs::metadata(&path).unwrap_or(meta)
        } else {
            meta
        };
        let file_type = meta.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        snapshot.insert(
            entry.file_name(),
            EntryMeta {
                kind,
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                size: meta.len(),
            },
        );
    }
    Ok(snapshot)
}

/// Diffs two snapshots of one directory into an ordered change list.
///
/// Retained entries whose kind changed produce a `Deleted` immediately
/// followed by an `Added` and never participate in rename pairing.
pub(crate) fn diff(old: &Snapshot, new: &Snapshot) -> Vec<Change> {
    let mut changes = Vec::new();
    let mut deleted: Vec<&OsString> = Vec::new();
    let mut added: Vec<&OsString> = Vec::new();

    for (name, old_meta) in old {
        match new.get(name) {
            None => deleted.push(name),
            Some(new_meta) if new_meta.kind != old_meta.kind => {
                changes.push(Change::Deleted(name.clone()));
                changes.push(Change::Added(name.clone()));
            }
            Some(new_meta) => {
                if new_meta.mtime != old_meta.mtime || new_meta.size != old_meta.size {
                    changes.push(Change::Modified(name.clone()));
                }
            }
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            added.push(name);
        }
    }

    if deleted.len() == 1 && added.len() == 1 {
        let (from, to) = (deleted[0], added[0]);
        let (old_meta, new_meta) = (old[from], new[to]);
        if old_meta.kind == new_meta.kind
            && old_meta.size == new_meta.size
            && close_enough(old_meta.mtime, new_meta.mtime)
        {
            changes.push(Change::Renamed {
                from: from.clone(),
                to: to.clone(),
            });
            return changes;
        }
    }

    changes.extend(deleted.into_iter().map(|name| Change::Deleted(name.clone())));
    changes.extend(added.into_iter().map(|name| Change::Added(name.clone())));
    changes
}

fn close_enough(a: SystemTime, b: SystemTime) -> bool {
    let delta = a
        .duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or(Duration::ZERO);
    delta <= RENAME_MTIME_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(kind: EntryKind, secs: u64, size: u64) -> EntryMeta {
        EntryMeta {
            kind,
            mtime: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            size,
        }
    }

    fn snapshot(entries: &[(&str, EntryMeta)]) -> Snapshot {
        entries
            .iter()
            .map(|(name, meta)| (OsString::from(name), *meta))
            .collect()
    }

    #[test]
    fn additions_deletions_and_modifications() {
        let old = snapshot(&[
            ("keep", meta(EntryKind::File, 10, 1)),
            ("gone", meta(EntryKind::File, 10, 2)),
            ("dir", meta(EntryKind::Directory, 10, 0)),
        ]);
        let new = snapshot(&[
            ("keep", meta(EntryKind::File, 20, 5)),
            ("dir", meta(EntryKind::Directory, 10, 0)),
            ("fresh", meta(EntryKind::Directory, 20, 0)),
        ]);

        let changes = diff(&old, &new);
        assert!(changes.contains(&Change::Modified(OsString::from("keep"))));
        // One delete and one add of different kinds must not pair up.
        assert!(changes.contains(&Change::Deleted(OsString::from("gone"))));
        assert!(changes.contains(&Change::Added(OsString::from("fresh"))));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn single_matching_pair_becomes_a_rename() {
        let old = snapshot(&[("a", meta(EntryKind::File, 100, 42))]);
        let new = snapshot(&[("b", meta(EntryKind::File, 100, 42))]);
        assert_eq!(
            diff(&old, &new),
            vec![Change::Renamed {
                from: OsString::from("a"),
                to: OsString::from("b"),
            }]
        );
    }

    #[test]
    fn rename_tolerates_sub_second_mtime_skew() {
        let old = snapshot(&[("a", meta(EntryKind::File, 100, 42))]);
        let new = snapshot(&[(
            "b",
            EntryMeta {
                kind: EntryKind::File,
                mtime: SystemTime::UNIX_EPOCH + Duration::from_millis(100_900),
                size: 42,
            },
        )]);
        assert!(matches!(diff(&old, &new)[..], [Change::Renamed { .. }]));
    }

    #[test]
    fn rename_requires_matching_metadata() {
        let old = snapshot(&[("a", meta(EntryKind::File, 100, 42))]);
        let new = snapshot(&[("b", meta(EntryKind::File, 100, 43))]);
        let changes = diff(&old, &new);
        assert_eq!(
            changes,
            vec![
                Change::Deleted(OsString::from("a")),
                Change::Added(OsString::from("b")),
            ]
        );

        let new = snapshot(&[("b", meta(EntryKind::File, 200, 42))]);
        assert!(diff(&old, &new)
            .iter()
            .all(|change| !matches!(change, Change::Renamed { .. })));
    }

    #[test]
    fn two_departures_never_pair() {
        let old = snapshot(&[
            ("a", meta(EntryKind::File, 100, 42)),
            ("b", meta(EntryKind::File, 100, 42)),
        ]);
        let new = snapshot(&[("c", meta(EntryKind::File, 100, 42))]);
        let changes = diff(&old, &new);
        assert!(changes
            .iter()
            .all(|change| !matches!(change, Change::Renamed { .. })));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn kind_change_is_delete_then_add() {
        let old = snapshot(&[("x", meta(EntryKind::File, 100, 0))]);
        let new = snapshot(&[("x", meta(EntryKind::Directory, 100, 0))]);
        assert_eq!(
            diff(&old, &new),
            vec![
                Change::Deleted(OsString::from("x")),
                Change::Added(OsString::from("x")),
            ]
        );
    }

    #[test]
    fn capture_records_entries() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), b"hello").unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();

        let snapshot = capture(tmp.path(), false).unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&OsString::from("f")].kind, EntryKind::File);
        assert_eq!(snapshot[&OsString::from("f")].size, 5);
        assert_eq!(snapshot[&OsString::from("d")].kind, EntryKind::Directory);
    }
}
