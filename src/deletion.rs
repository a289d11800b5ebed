//! Deletion log protocol and DeletionSync.
//!
//! Hard-deleting a note removes its `notes/{noteId}/` tree and records the
//! fact in the deleting instance's own deletion log. Every other instance
//! watches all deletion logs and, on a new line, removes the note from its
//! local cache — idempotently, since the note may already be unknown
//! locally.

use crate::error::{CoreError, Result};
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId};
use crate::sd::StorageDir;

/// One parsed deletion-log line: `<noteId>|<timestampMs>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionEntry {
    /// The hard-deleted note.
    pub note: NoteId,
    /// Unix ms when the deleting instance recorded the deletion. A hint,
    /// not a correctness signal.
    pub timestamp_ms: i64,
}

/// Format one deletion-log line (without trailing `\n`).
pub fn format_line(note: NoteId, timestamp_ms: i64) -> String {
    format!("{note}|{timestamp_ms}")
}

/// Parse one deletion-log line. Returns `None` for anything that doesn't
/// match, including a trailing partial line.
pub fn parse_line(line: &str) -> Option<DeletionEntry> {
    let (note_str, ts_str) = line.split_once('|')?;
    Some(DeletionEntry {
        note: note_str.parse().ok()?,
        timestamp_ms: ts_str.parse().ok()?,
    })
}

/// Read every complete line of `instance`'s deletion log on `sd`, dropping
/// a trailing partial line exactly like `activity::read_entries`.
pub fn read_entries(
    fs: &dyn FileSystem,
    sd: &StorageDir,
    instance: &InstanceId,
) -> Result<Vec<DeletionEntry>> {
    let path = sd.deletion_log_path(instance);
    if !fs.exists(&path) {
        return Ok(Vec::new());
    }
    let content = fs.read_to_string(&path).map_err(|e| CoreError::FileRead {
        path: path.clone(),
        source: e,
    })?;
    let complete = if content.ends_with('\n') {
        &content[..]
    } else {
        match content.rfind('\n') {
            Some(idx) => &content[..idx + 1],
            None => "",
        }
    };
    Ok(complete.lines().filter_map(parse_line).collect())
}

/// Record a hard-delete: remove `notes/{noteId}/` from `sd` and append a
/// deletion-log line under `self`'s own log.
///
/// The tree removal happens first, mirroring the at-least-once delivery
/// contract updates get from activity logs: a crash between the two still
/// leaves the deletion durable once the log append lands, and a remote
/// instance's wake discovery (`wake.rs`) independently notices the
/// directory's absence.
pub fn hard_delete(
    fs: &dyn FileSystem,
    sd: &StorageDir,
    instance: &InstanceId,
    note: NoteId,
    now_ms: i64,
) -> Result<()> {
    let note_dir = sd.note_dir(note);
    fs.remove_dir_all(&note_dir).map_err(|e| CoreError::FileWrite {
        path: note_dir,
        source: e,
    })?;

    let line = format_line(note, now_ms);
    crate::atomic::append_line(fs, &sd.deletion_log_path(instance), &line)
}

/// Every note that has been hard-deleted according to any instance's
/// visible deletion log on `sd`.
pub fn all_deleted_notes(fs: &dyn FileSystem, sd: &StorageDir) -> Result<std::collections::HashSet<NoteId>> {
    let mut out = std::collections::HashSet::new();
    let dir = sd.deleted_dir();
    let entries = fs.list_dir(&dir).map_err(|e| CoreError::FileRead { path: dir, source: e })?;
    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(instance_str) = name.strip_suffix(".log") else {
            continue;
        };
        let instance = InstanceId::from_str_override(instance_str);
        for entry in read_entries(fs, sd, &instance)? {
            out.insert(entry.note);
        }
    }
    Ok(out)
}

/// Outcome of scanning one remote instance's deletion log for notes this
/// reader hasn't yet processed.
#[derive(Debug, Default)]
pub struct DeletionScan {
    /// Notes newly observed as hard-deleted since the last scan.
    pub newly_deleted: Vec<NoteId>,
}

/// Scan `source`'s deletion log for entries beyond `last_seen_count`
/// (the number of lines this reader had already processed), returning the
/// newly-observed deletions and the updated line count to remember.
///
/// Deletion-log entries have no per-instance sequence number (unlike
/// activity log lines), so the watermark here is a simple line count
/// rather than a `seq`.
pub fn scan_new(
    fs: &dyn FileSystem,
    sd: &StorageDir,
    source: &InstanceId,
    last_seen_count: usize,
) -> Result<(DeletionScan, usize)> {
    let entries = read_entries(fs, sd, source)?;
    let newly_deleted = entries
        .iter()
        .skip(last_seen_count)
        .map(|e| e.note)
        .collect();
    Ok((DeletionScan { newly_deleted }, entries.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn line_round_trips() {
        let note = NoteId::new();
        let line = format_line(note, 123);
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.note, note);
        assert_eq!(parsed.timestamp_ms, 123);
    }

    #[test]
    fn hard_delete_removes_tree_and_appends_log() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let instance = InstanceId::new();
        let note = NoteId::new();
        fs.create_dir_all(&sd.note_dir(note).join("updates")).unwrap();

        hard_delete(&fs, &sd, &instance, note, 500).unwrap();

        assert!(!fs.exists(&sd.note_dir(note)));
        let entries = read_entries(&fs, &sd, &instance).unwrap();
        assert_eq!(entries, vec![DeletionEntry { note, timestamp_ms: 500 }]);
    }

    #[test]
    fn scan_new_only_returns_unprocessed_entries() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let instance = InstanceId::new();
        let a = NoteId::new();
        let b = NoteId::new();

        hard_delete(&fs, &sd, &instance, a, 1).unwrap();
        let (scan, count) = scan_new(&fs, &sd, &instance, 0).unwrap();
        assert_eq!(scan.newly_deleted, vec![a]);

        hard_delete(&fs, &sd, &instance, b, 2).unwrap();
        let (scan, count2) = scan_new(&fs, &sd, &instance, count).unwrap();
        assert_eq!(scan.newly_deleted, vec![b]);
        assert_eq!(count2, 2);
    }

    #[test]
    fn idempotent_on_unknown_note() {
        // DeletionSync applying a deletion for a note the local cache never
        // heard of is a no-op at the cache layer; this module only asserts
        // that reading/deleting doesn't error when the note dir never
        // existed in the first place.
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let instance = InstanceId::new();
        let note = NoteId::new();
        assert!(hard_delete(&fs, &sd, &instance, note, 1).is_ok());
    }

    #[test]
    fn all_deleted_notes_spans_every_instance_log() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let a = InstanceId::new();
        let b = InstanceId::new();
        let n1 = NoteId::new();
        let n2 = NoteId::new();
        hard_delete(&fs, &sd, &a, n1, 1).unwrap();
        hard_delete(&fs, &sd, &b, n2, 2).unwrap();

        let all = all_deleted_notes(&fs, &sd).unwrap();
        assert!(all.contains(&n1));
        assert!(all.contains(&n2));
    }
}
