//! Cross-SD moves where the target already holds a row for the same note
//! id, driven through the real `MoveExecutor` and a
//! real `Cache` (rather than the `FakeCache` test double `moves/mod.rs`'s
//! own unit tests use) against a shared in-memory filesystem, so the
//! conflict-resolution matrix is exercised with the actual SQL queries
//! `detect_conflict`/`hard_delete_row`/etc. run against.

use scribe_core::cache::{Cache, NoteFilter, NoteRow};
use scribe_core::clock_source::FixedClock;
use scribe_core::fs::InMemoryFileSystem;
use scribe_core::ids::{FolderId, InstanceId, NoteId, SdUuid};
use scribe_core::moves::{ConflictStrategy, MoveExecutor, MoveRecord, MoveState};
use scribe_core::sd::StorageDir;

struct Fixture {
    fs: InMemoryFileSystem,
    clock: FixedClock,
    cache: Cache,
    source_sd_uuid: SdUuid,
    target_sd_uuid: SdUuid,
    source: StorageDir,
    target: StorageDir,
}

fn setup_with_note() -> (Fixture, NoteId) {
    let fs = InMemoryFileSystem::new();
    let clock = FixedClock::new(1_700_000_000_000);
    let cache = Cache::open_in_memory().unwrap();

    let source = StorageDir::new("/source-sd");
    let target = StorageDir::new("/target-sd");
    let source_sd_uuid = source.ensure_sd_uuid(&fs).unwrap();
    let target_sd_uuid = target.ensure_sd_uuid(&fs).unwrap();
    let source_sd_id = cache.upsert_storage_dir(source_sd_uuid, "/source-sd").unwrap();

    let note = NoteId::new();
    // Seed the note's CRDT file tree on the source, and its cache row.
    let instance = InstanceId::from_str_override("inst-a");
    let um = scribe_core::update_manager::UpdateManager::new(
        &fs,
        &clock,
        &source,
        instance,
        &scribe_core::config::CoreConfig::default(),
    );
    um.write_update(scribe_core::sd::DocumentRef::Note(note), b"hello").unwrap();
    cache
        .upsert_note(
            &NoteRow {
                id: note,
                sd_id: source_sd_id,
                folder_id: None,
                title: "Conflicted note".into(),
                preview: "".into(),
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "hello",
        )
        .unwrap();

    (
        Fixture {
            fs,
            clock,
            cache,
            source_sd_uuid,
            target_sd_uuid,
            source,
            target,
        },
        note,
    )
}

fn record(fx: &Fixture, note: NoteId, target_folder: FolderId) -> MoveRecord {
    MoveRecord::new(
        note,
        fx.source_sd_uuid,
        fx.target_sd_uuid,
        target_folder,
        InstanceId::from_str_override("inst-a"),
        fx.source.root().to_path_buf(),
        fx.target.root().to_path_buf(),
        fx.clock.now_ms(),
    )
}

fn drive_through_conflict(
    fx: &Fixture,
    rec: &mut MoveRecord,
    strategy: Option<ConflictStrategy>,
) -> scribe_core::Result<()> {
    let exec = MoveExecutor::new(&fx.fs, &fx.clock);
    exec.copy_to_scratch(rec)?;
    exec.update_db(rec, &fx.cache, strategy)?;
    if rec.state == MoveState::Cancelled {
        return Ok(());
    }
    exec.finalize_on_target(rec, &rec.initiated_by.clone())?;
    exec.cleanup_source(rec, &rec.initiated_by.clone())
}

/// `replace`: the target's active row is hard-deleted and the move
/// proceeds; afterwards there is exactly one active row for this note id,
/// on the target.
#[test]
fn replace_strategy_removes_conflicting_target_row() {
    let (fx, note) = setup_with_note();
    let target_folder = FolderId::new();
    let target_sd_id = fx.cache.upsert_storage_dir(fx.target_sd_uuid, "/target-sd").unwrap();
    fx.cache
        .upsert_note(
            &NoteRow {
                id: note,
                sd_id: target_sd_id,
                folder_id: None,
                title: "Stale target copy".into(),
                preview: "".into(),
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "stale",
        )
        .unwrap();

    let mut rec = record(&fx, note, target_folder);
    drive_through_conflict(&fx, &mut rec, Some(ConflictStrategy::Replace)).unwrap();

    assert_eq!(rec.state, MoveState::Completed);
    let target_notes = fx.cache.list_notes(target_sd_id, None, NoteFilter::All).unwrap();
    assert_eq!(target_notes.len(), 1);
    assert_eq!(target_notes[0].id, note);
    assert!(!fx.fs.exists(&fx.source.note_dir(note)));
}

/// `keepBoth`: the dragged copy is assigned a fresh id so both rows
/// survive; at no point is the original id active in both SDs at once.
#[test]
fn keep_both_strategy_assigns_a_new_id_to_the_moved_copy() {
    let (fx, note) = setup_with_note();
    let target_folder = FolderId::new();
    let target_sd_id = fx.cache.upsert_storage_dir(fx.target_sd_uuid, "/target-sd").unwrap();
    fx.cache
        .upsert_note(
            &NoteRow {
                id: note,
                sd_id: target_sd_id,
                folder_id: None,
                title: "Existing target note".into(),
                preview: "".into(),
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "existing",
        )
        .unwrap();

    let mut rec = record(&fx, note, target_folder);
    drive_through_conflict(&fx, &mut rec, Some(ConflictStrategy::KeepBoth)).unwrap();

    assert_eq!(rec.state, MoveState::Completed);
    let target_notes = fx.cache.list_notes(target_sd_id, None, NoteFilter::All).unwrap();
    // The pre-existing target row (under the original id) plus the newly
    // inserted copy under a fresh id: two rows, not a collision.
    assert_eq!(target_notes.len(), 2);
    assert!(target_notes.iter().any(|n| n.id == note));
    assert!(target_notes.iter().any(|n| n.id != note));
}

/// `cancel`: the move is abandoned at the conflict; the target keeps its
/// pre-existing row untouched and the source row is never removed.
#[test]
fn cancel_strategy_leaves_both_sides_untouched() {
    let (fx, note) = setup_with_note();
    let target_folder = FolderId::new();
    let target_sd_id = fx.cache.upsert_storage_dir(fx.target_sd_uuid, "/target-sd").unwrap();
    fx.cache
        .upsert_note(
            &NoteRow {
                id: note,
                sd_id: target_sd_id,
                folder_id: None,
                title: "Existing target note".into(),
                preview: "".into(),
                deleted: false,
                pinned: false,
                updated_at_ms: 0,
            },
            "existing",
        )
        .unwrap();
    let source_sd_id = fx.cache.sd_id_for_uuid(fx.source_sd_uuid).unwrap().unwrap();

    let mut rec = record(&fx, note, target_folder);
    let exec = MoveExecutor::new(&fx.fs, &fx.clock);
    exec.copy_to_scratch(&mut rec).unwrap();
    exec.update_db(&mut rec, &fx.cache, Some(ConflictStrategy::Cancel)).unwrap();

    assert_eq!(rec.state, MoveState::Cancelled);
    // Source row is untouched (update_db never got to remove_source_row).
    assert_eq!(fx.cache.list_notes(source_sd_id, None, NoteFilter::All).unwrap().len(), 1);
    assert_eq!(fx.cache.list_notes(target_sd_id, None, NoteFilter::All).unwrap().len(), 1);
}

/// A conflict against a *soft-deleted* target row is resolved silently —
/// no `ConflictStrategy` is consulted, the stale row is hard-deleted and
/// the move proceeds: the user already deleted it there.
#[test]
fn soft_deleted_target_row_is_silently_replaced_without_a_strategy() {
    let (fx, note) = setup_with_note();
    let target_folder = FolderId::new();
    let target_sd_id = fx.cache.upsert_storage_dir(fx.target_sd_uuid, "/target-sd").unwrap();
    fx.cache
        .upsert_note(
            &NoteRow {
                id: note,
                sd_id: target_sd_id,
                folder_id: None,
                title: "Already deleted here".into(),
                preview: "".into(),
                deleted: true,
                pinned: false,
                updated_at_ms: 0,
            },
            "gone",
        )
        .unwrap();

    let mut rec = record(&fx, note, target_folder);
    // No strategy supplied at all: must not error, since the conflict is
    // soft-deleted-only.
    drive_through_conflict(&fx, &mut rec, None).unwrap();

    assert_eq!(rec.state, MoveState::Completed);
    let target_notes = fx.cache.list_notes(target_sd_id, None, NoteFilter::Active).unwrap();
    assert_eq!(target_notes.len(), 1);
    assert_eq!(target_notes[0].id, note);
}

/// A crash between `files_copied` and `db_updated` (scratch directory
/// exists, cache transaction never ran) must roll back to a clean slate:
/// no target row, no scratch directory, source row intact.
#[test]
fn rollback_after_copy_but_before_db_update_restores_source() {
    let (fx, note) = setup_with_note();
    let target_folder = FolderId::new();
    let source_sd_id = fx.cache.sd_id_for_uuid(fx.source_sd_uuid).unwrap().unwrap();

    let mut rec = record(&fx, note, target_folder);
    let exec = MoveExecutor::new(&fx.fs, &fx.clock);
    exec.copy_to_scratch(&mut rec).unwrap();
    assert!(fx.fs.exists(&fx.target.moving_scratch_dir(note)));

    exec.rollback(&mut rec, &fx.cache).unwrap();

    assert_eq!(rec.state, MoveState::Cancelled);
    assert!(!fx.fs.exists(&fx.target.moving_scratch_dir(note)));
    assert_eq!(fx.cache.list_notes(source_sd_id, None, NoteFilter::All).unwrap().len(), 1);
}
