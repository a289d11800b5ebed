//! Wake-from-sleep discovery.
//!
//! On system resume, after letting cloud sync catch up, an instance walks
//! `notes/` and reconciles it against what the local cache already knows —
//! picking up notes a missed activity-log notification never announced,
//! and applying hard-deletes whose deletion-log line arrived while this
//! instance was asleep.
//!
//! This module computes the reconciliation *plan* as pure data; applying
//! it (composing state for new notes, evicting cache rows) is
//! `context.rs`'s job, since it needs both `update_manager` and `cache`.

use std::collections::HashSet;

use crate::deletion;
use crate::error::Result;
use crate::fs::FileSystem;
use crate::ids::NoteId;
use crate::sd::StorageDir;

/// What one wake-discovery pass found needs to happen.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WakePlan {
    /// Notes present on disk, absent from the cache, and not recorded as
    /// hard-deleted: compose their state and insert a cache row.
    pub to_insert: Vec<NoteId>,
    /// Notes present in the cache whose `notes/{id}/` directory has
    /// disappeared and whose deletion-log entry is now visible: apply the
    /// hard-delete locally.
    pub to_hard_delete: Vec<NoteId>,
}

/// Diff disk state against known cache state to build a [`WakePlan`].
///
/// `known_to_cache` is every note id the local cache currently has a row
/// for.
pub fn plan(fs: &dyn FileSystem, sd: &StorageDir, known_to_cache: &HashSet<NoteId>) -> Result<WakePlan> {
    let on_disk: HashSet<NoteId> = sd.list_note_ids(fs)?.into_iter().collect();
    let deleted = deletion::all_deleted_notes(fs, sd)?;

    let to_insert = on_disk
        .iter()
        .filter(|id| !known_to_cache.contains(id) && !deleted.contains(id))
        .copied()
        .collect();

    let to_hard_delete = known_to_cache
        .iter()
        .filter(|id| !on_disk.contains(id) && deleted.contains(id))
        .copied()
        .collect();

    Ok(WakePlan {
        to_insert,
        to_hard_delete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deletion::hard_delete;
    use crate::fs::InMemoryFileSystem;
    use crate::ids::InstanceId;

    #[test]
    fn finds_notes_on_disk_but_not_in_cache() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let note = NoteId::new();
        fs.create_dir_all(&sd.note_dir(note).join("updates")).unwrap();

        let plan = plan(&fs, &sd, &HashSet::new()).unwrap();
        assert_eq!(plan.to_insert, vec![note]);
        assert!(plan.to_hard_delete.is_empty());
    }

    #[test]
    fn ignores_notes_whose_deletion_is_already_visible() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let instance = InstanceId::new();
        let note = NoteId::new();
        // Directory never existed (or was already removed) and a deletion
        // log entry is visible: not something to insert.
        hard_delete(&fs, &sd, &instance, note, 1).unwrap();

        let plan = plan(&fs, &sd, &HashSet::new()).unwrap();
        assert!(plan.to_insert.is_empty());
    }

    #[test]
    fn finds_cache_rows_whose_directory_disappeared_and_is_deleted() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let instance = InstanceId::new();
        let note = NoteId::new();
        hard_delete(&fs, &sd, &instance, note, 1).unwrap();

        let mut cache = HashSet::new();
        cache.insert(note);
        let plan = plan(&fs, &sd, &cache).unwrap();
        assert_eq!(plan.to_hard_delete, vec![note]);
    }

    #[test]
    fn cache_row_with_no_deletion_log_and_no_directory_is_left_alone() {
        // Directory missing but no deletion-log entry visible yet: could
        // just be a not-yet-synced deletion log, not evidence of deletion.
        // Wake discovery must not guess.
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let note = NoteId::new();
        let mut cache = HashSet::new();
        cache.insert(note);

        let plan = plan(&fs, &sd, &cache).unwrap();
        assert!(plan.to_hard_delete.is_empty());
    }
}
