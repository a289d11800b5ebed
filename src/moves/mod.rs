//! Crash-safe cross-SD move execution.
//!
//! `state_machine.rs` owns the state set and legal transitions as pure
//! data; this module drives a [`MoveRecord`] through them, touching the
//! filesystem for the copy/rename/cleanup steps and a small
//! [`MoveCacheOps`] capability
//! for the local-cache transaction, so this module never depends on
//! `cache.rs`'s SQLite details directly.

pub mod state_machine;

pub use state_machine::{ConflictStrategy, MoveRecord, MoveState, TargetConflict};

use crate::activity;
use crate::atomic;
use crate::clock_source::Clock;
use crate::error::{CoreError, Result};
use crate::filename::UpdateName;
use crate::fs::FileSystem;
use crate::ids::{InstanceId, NoteId};
use crate::sd::StorageDir;

/// The local-cache side of a move: conflict detection and the row
/// mutations of a "begin a local-cache transaction" step. Implemented by
/// `cache::Cache`.
pub trait MoveCacheOps {
    /// What does the target SD currently hold for this note id?
    fn detect_conflict(&self, target_sd: crate::ids::SdUuid, note: NoteId) -> Result<TargetConflict>;

    /// Hard-delete whatever row exists for `note` (used both to clear a
    /// soft-deleted target row and, on `Replace`, an active one).
    fn hard_delete_row(&self, sd: crate::ids::SdUuid, note: NoteId) -> Result<()>;

    /// Insert the moved note's row into the target SD, optionally under a
    /// freshly generated id (`KeepBoth`). `source_sd` identifies which
    /// existing row to copy title/preview metadata from, since the note
    /// id alone may also name an unrelated row already sitting on the
    /// target.
    fn insert_moved_row(
        &self,
        source_sd: crate::ids::SdUuid,
        target_sd: crate::ids::SdUuid,
        note: NoteId,
        as_id: NoteId,
        target_folder: crate::ids::FolderId,
    ) -> Result<()>;

    /// Remove the note's row from the source SD.
    fn remove_source_row(&self, source_sd: crate::ids::SdUuid, note: NoteId) -> Result<()>;

    /// Rollback helper: restore the source row that `remove_source_row`
    /// removed.
    fn reinsert_source_row(&self, source_sd: crate::ids::SdUuid, note: NoteId) -> Result<()>;
}

/// Drives one [`MoveRecord`] through the filesystem-facing steps of the
/// protocol. Cache-facing steps go through a caller-supplied
/// [`MoveCacheOps`].
pub struct MoveExecutor<'a> {
    fs: &'a dyn FileSystem,
    clock: &'a dyn Clock,
}

impl<'a> MoveExecutor<'a> {
    /// Bind an executor to a filesystem and clock source.
    pub fn new(fs: &'a dyn FileSystem, clock: &'a dyn Clock) -> Self {
        Self { fs, clock }
    }

    /// Create `.moving-{noteId}/` on the target and copy the source's full
    /// `notes/{noteId}/` tree into it.
    pub fn copy_to_scratch(&self, record: &mut MoveRecord) -> Result<()> {
        record.transition(MoveState::Copying, self.clock.now_ms())?;

        let source_sd = StorageDir::new(record.source_sd_path.clone());
        let target_sd = StorageDir::new(record.target_sd_path.clone());
        let scratch = target_sd.moving_scratch_dir(record.note);

        // A prior crashed attempt may have left a partial scratch dir;
        // resuming from `copying` deletes it and restarts the copy.
        self.fs
            .remove_dir_all(&scratch)
            .map_err(|e| CoreError::FileWrite { path: scratch.clone(), source: e })?;

        self.fs
            .copy_dir_all(&source_sd.note_dir(record.note), &scratch)
            .map_err(|e| CoreError::FileWrite { path: scratch, source: e })?;

        record.transition(MoveState::FilesCopied, self.clock.now_ms())
    }

    /// Conflict detection and the local-cache transaction (insert into
    /// target, remove from source).
    ///
    /// `strategy` is required only when [`TargetConflict::Active`] is
    /// detected; it is ignored otherwise.
    pub fn update_db(
        &self,
        record: &mut MoveRecord,
        cache: &dyn MoveCacheOps,
        strategy: Option<ConflictStrategy>,
    ) -> Result<Option<NoteId>> {
        let conflict = cache.detect_conflict(record.target_sd, record.note)?;
        let mut keep_both_id = None;

        match conflict {
            TargetConflict::None => {}
            TargetConflict::SoftDeletedOnly => cache.hard_delete_row(record.target_sd, record.note)?,
            TargetConflict::Active => match strategy {
                Some(ConflictStrategy::Replace) => {
                    cache.hard_delete_row(record.target_sd, record.note)?
                }
                Some(ConflictStrategy::KeepBoth) => keep_both_id = Some(NoteId::new()),
                Some(ConflictStrategy::Cancel) => {
                    record.transition(MoveState::Cancelled, self.clock.now_ms())?;
                    return Ok(None);
                }
                None => {
                    return Err(CoreError::MoveConflict {
                        note_id: record.note.to_string(),
                    });
                }
            },
        }

        record.keep_both_note_id = keep_both_id;
        let target_id = record.target_note_id();
        cache.insert_moved_row(record.source_sd, record.target_sd, record.note, target_id, record.target_folder)?;
        cache.remove_source_row(record.source_sd, record.note)?;

        record.transition(MoveState::DbUpdated, self.clock.now_ms())?;
        Ok(keep_both_id)
    }

    /// Atomically rename the scratch directory into place and append one
    /// activity-log line per copied update, as if self had just written
    /// them, so other instances watching the target SD reload. Lands
    /// under [`MoveRecord::target_note_id`], which differs from `record.note`
    /// when `KeepBoth` assigned the dragged copy a fresh id.
    pub fn finalize_on_target(&self, record: &mut MoveRecord, instance: &InstanceId) -> Result<()> {
        let target_sd = StorageDir::new(record.target_sd_path.clone());
        let target_note_id = record.target_note_id();
        let scratch = target_sd.moving_scratch_dir(record.note);
        let dest = target_sd.note_dir(target_note_id);

        self.fs
            .rename(&scratch, &dest)
            .map_err(|e| CoreError::FileWrite { path: dest.clone(), source: e })?;

        let updates_dir = dest.join("updates");
        let mut names: Vec<UpdateName> = self
            .fs
            .list_dir(&updates_dir)
            .map_err(|e| CoreError::FileRead { path: updates_dir, source: e })?
            .into_iter()
            .filter_map(|p| UpdateName::parse(p.file_name()?.to_str()?).ok())
            .collect();
        names.sort_by_key(|n| n.seq);

        let activity_path = target_sd.activity_log_path(instance);
        for name in names {
            let line = activity::format_line(&target_note_id.to_string(), instance, name.seq);
            atomic::append_line(self.fs, &activity_path, &line)?;
        }

        record.transition(MoveState::Cleaning, self.clock.now_ms())
    }

    /// Delete the source tree and record the hard-delete in the source
    /// SD's deletion log.
    pub fn cleanup_source(&self, record: &mut MoveRecord, instance: &InstanceId) -> Result<()> {
        let source_sd = StorageDir::new(record.source_sd_path.clone());
        crate::deletion::hard_delete(self.fs, &source_sd, instance, record.note, self.clock.now_ms())?;
        record.transition(MoveState::Completed, self.clock.now_ms())
    }

    /// Roll back a failed move, reversing completed steps in reverse
    /// order. On full success the
    /// record transitions to `Cancelled`; if any rollback step itself
    /// fails, it transitions to `RolledBack` with `error` populated and is
    /// left for operator recovery.
    pub fn rollback(&self, record: &mut MoveRecord, cache: &dyn MoveCacheOps) -> Result<()> {
        let target_sd = StorageDir::new(record.target_sd_path.clone());
        let mut errors: Vec<String> = Vec::new();

        let scratch = target_sd.moving_scratch_dir(record.note);
        if self.fs.exists(&scratch) {
            if let Err(e) = self.fs.remove_dir_all(&scratch) {
                errors.push(format!("removing scratch dir: {e}"));
            }
        }
        let target_note_dir = target_sd.note_dir(record.target_note_id());
        if self.fs.exists(&target_note_dir) {
            if let Err(e) = self.fs.remove_dir_all(&target_note_dir) {
                errors.push(format!("removing target note dir: {e}"));
            }
        }

        if matches!(record.state, MoveState::DbUpdated | MoveState::Cleaning) {
            if let Err(e) = cache.reinsert_source_row(record.source_sd, record.note) {
                errors.push(format!("reinserting source row: {e}"));
            }
            if let Err(e) = cache.hard_delete_row(record.target_sd, record.target_note_id()) {
                errors.push(format!("removing target row: {e}"));
            }
        }

        let now = self.clock.now_ms();
        if errors.is_empty() {
            record.transition(MoveState::Cancelled, now)
        } else {
            record.error = Some(errors.join("; "));
            record.state = MoveState::RolledBack;
            record.last_modified_ms = now;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock_source::FixedClock;
    use crate::fs::InMemoryFileSystem;
    use crate::ids::{FolderId, SdUuid};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCache {
        target_conflict: Mutex<TargetConflict>,
        source_row_present: Mutex<bool>,
        target_row_present: Mutex<bool>,
    }

    impl MoveCacheOps for FakeCache {
        fn detect_conflict(&self, _sd: SdUuid, _note: NoteId) -> Result<TargetConflict> {
            Ok(*self.target_conflict.lock().unwrap())
        }
        fn hard_delete_row(&self, _sd: SdUuid, _note: NoteId) -> Result<()> {
            *self.target_row_present.lock().unwrap() = false;
            Ok(())
        }
        fn insert_moved_row(
            &self,
            _source_sd: SdUuid,
            _sd: SdUuid,
            _note: NoteId,
            _as_id: NoteId,
            _folder: FolderId,
        ) -> Result<()> {
            *self.target_row_present.lock().unwrap() = true;
            Ok(())
        }
        fn remove_source_row(&self, _sd: SdUuid, _note: NoteId) -> Result<()> {
            *self.source_row_present.lock().unwrap() = false;
            Ok(())
        }
        fn reinsert_source_row(&self, _sd: SdUuid, _note: NoteId) -> Result<()> {
            *self.source_row_present.lock().unwrap() = true;
            Ok(())
        }
    }

    fn setup_record(fs: &InMemoryFileSystem) -> MoveRecord {
        let note = NoteId::new();
        fs.create_dir_all(&std::path::PathBuf::from("/src/notes").join(note.to_string()).join("updates"))
            .unwrap();
        fs.write_binary(
            &std::path::PathBuf::from("/src/notes")
                .join(note.to_string())
                .join("updates")
                .join("inst_1700000000000-0.yjson"),
            &[1, 1, 2, 3],
        )
        .unwrap();

        MoveRecord::new(
            note,
            SdUuid::new(),
            SdUuid::new(),
            FolderId::new(),
            InstanceId::new(),
            "/src".into(),
            "/tgt".into(),
            0,
        )
    }

    #[test]
    fn full_happy_path_reaches_completed() {
        let fs = InMemoryFileSystem::new();
        let clock = FixedClock::new(0);
        let instance = InstanceId::new();
        let mut record = setup_record(&fs);
        record.initiated_by = instance.clone();
        let cache = FakeCache::default();
        *cache.source_row_present.lock().unwrap() = true;
        let exec = MoveExecutor::new(&fs, &clock);

        exec.copy_to_scratch(&mut record).unwrap();
        assert_eq!(record.state, MoveState::FilesCopied);

        exec.update_db(&mut record, &cache, None).unwrap();
        assert_eq!(record.state, MoveState::DbUpdated);
        assert!(*cache.target_row_present.lock().unwrap());
        assert!(!*cache.source_row_present.lock().unwrap());

        exec.finalize_on_target(&mut record, &instance).unwrap();
        assert_eq!(record.state, MoveState::Cleaning);
        let target_sd = StorageDir::new(record.target_sd_path.clone());
        assert!(fs.exists(&target_sd.note_dir(record.note)));
        let activity_log = fs.read_to_string(&target_sd.activity_log_path(&instance)).unwrap();
        assert!(activity_log.contains(&record.note.to_string()));

        exec.cleanup_source(&mut record, &instance).unwrap();
        assert_eq!(record.state, MoveState::Completed);
        let source_sd = StorageDir::new(record.source_sd_path.clone());
        assert!(!fs.exists(&source_sd.note_dir(record.note)));
    }

    #[test]
    fn active_conflict_without_strategy_is_reported() {
        let fs = InMemoryFileSystem::new();
        let clock = FixedClock::new(0);
        let mut record = setup_record(&fs);
        let cache = FakeCache::default();
        *cache.target_conflict.lock().unwrap() = TargetConflict::Active;
        let exec = MoveExecutor::new(&fs, &clock);

        exec.copy_to_scratch(&mut record).unwrap();
        let err = exec.update_db(&mut record, &cache, None).unwrap_err();
        assert!(matches!(err, CoreError::MoveConflict { .. }));
    }

    #[test]
    fn active_conflict_cancel_strategy_transitions_to_cancelled() {
        let fs = InMemoryFileSystem::new();
        let clock = FixedClock::new(0);
        let mut record = setup_record(&fs);
        let cache = FakeCache::default();
        *cache.target_conflict.lock().unwrap() = TargetConflict::Active;
        let exec = MoveExecutor::new(&fs, &clock);

        exec.copy_to_scratch(&mut record).unwrap();
        exec.update_db(&mut record, &cache, Some(ConflictStrategy::Cancel)).unwrap();
        assert_eq!(record.state, MoveState::Cancelled);
    }

    #[test]
    fn keep_both_generates_a_new_id() {
        let fs = InMemoryFileSystem::new();
        let clock = FixedClock::new(0);
        let mut record = setup_record(&fs);
        let cache = FakeCache::default();
        *cache.target_conflict.lock().unwrap() = TargetConflict::Active;
        let exec = MoveExecutor::new(&fs, &clock);

        exec.copy_to_scratch(&mut record).unwrap();
        let new_id = exec
            .update_db(&mut record, &cache, Some(ConflictStrategy::KeepBoth))
            .unwrap();
        assert!(new_id.is_some());
        assert_ne!(new_id.unwrap(), record.note);
    }

    #[test]
    fn rollback_after_db_update_reinserts_source_and_clears_target() {
        let fs = InMemoryFileSystem::new();
        let clock = FixedClock::new(0);
        let instance = InstanceId::new();
        let mut record = setup_record(&fs);
        record.initiated_by = instance.clone();
        let cache = FakeCache::default();
        *cache.source_row_present.lock().unwrap() = true;
        let exec = MoveExecutor::new(&fs, &clock);

        exec.copy_to_scratch(&mut record).unwrap();
        exec.update_db(&mut record, &cache, None).unwrap();

        exec.rollback(&mut record, &cache).unwrap();
        assert_eq!(record.state, MoveState::Cancelled);
        assert!(*cache.source_row_present.lock().unwrap());
        assert!(!*cache.target_row_present.lock().unwrap());
    }
}
