//! `CoreContext`, the crate's public entry point.
//!
//! Everything above this module — `update_manager`, `cache`, `moves`,
//! `wake`, `gc` — is wired together here behind one cheaply-cloneable
//! handle that an embedding application's UI and IPC layers both hold
//! onto. `CoreContext` additionally owns the local cache connection and
//! the cross-SD move executor.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::cache::{Cache, NoteFilter, NoteRow};
use crate::clock::VectorClock;
use crate::clock_source::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::crdt::{CrdtDocument, YrsDocument};
use crate::error::{CoreError, Result};
use crate::extract;
use crate::fs::{FileSystem, RealFileSystem};
use crate::gc::{self, GcStats};
use crate::ids::{FolderId, InstanceId, MoveId, NoteId, SdId, SdUuid};
use crate::moves::{ConflictStrategy, MoveExecutor, MoveRecord, MoveState};
use crate::sd::DocumentRef;
use crate::update_manager::{self, EditRate, SnapshotDecisionInput, UpdateManager, classify_edit_rate};
use crate::wake;

/// How far back `DocActivity::edit_rate` looks to estimate a trailing
/// edits-per-minute rate.
const EDIT_RATE_WINDOW_MS: i64 = 60_000;

/// Per-document edit tracking used to decide when to force a snapshot.
/// `UpdateManager` itself is rebuilt on every call and keeps no state
/// across calls, so this lives on `CoreContext` instead.
#[derive(Default)]
struct DocActivity {
    recent_edits_ms: VecDeque<i64>,
    updates_since_snapshot: u32,
    last_update_ms: i64,
}

impl DocActivity {
    fn record_edit(&mut self, now_ms: i64) {
        self.recent_edits_ms.push_back(now_ms);
        while self.recent_edits_ms.len() > 64 {
            self.recent_edits_ms.pop_front();
        }
        self.updates_since_snapshot += 1;
        self.last_update_ms = now_ms;
    }

    fn edit_rate(&self, now_ms: i64) -> EditRate {
        let count = self
            .recent_edits_ms
            .iter()
            .filter(|&&t| now_ms - t <= EDIT_RATE_WINDOW_MS)
            .count();
        classify_edit_rate(count as f64 * 60_000.0 / EDIT_RATE_WINDOW_MS as f64)
    }

    fn idle_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_update_ms
    }
}

/// A remote change made visible by composing a document's state, delivered
/// to whoever is subscribed to it via [`DocumentHandle::subscribe`].
#[derive(Debug, Clone)]
pub struct RemoteUpdate {
    /// Which document changed.
    pub doc: DocumentRef,
    /// The contiguous-prefix clock reached by this recomposition.
    pub clock: VectorClock,
}

struct Inner {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    instance: InstanceId,
    config: CoreConfig,
    cache: Mutex<Cache>,
    sds: Mutex<HashMap<SdUuid, crate::sd::StorageDir>>,
    subscribers: Mutex<HashMap<(SdUuid, DocumentRef), Vec<Sender<RemoteUpdate>>>>,
    activity: Mutex<HashMap<(SdUuid, DocumentRef), DocActivity>>,
}

/// The storage/sync core's public entry point. Cheap to clone — every
/// clone shares the same cache connection and in-memory subscriber
/// registry.
#[derive(Clone)]
pub struct CoreContext(Arc<Inner>);

impl CoreContext {
    /// Open a context backed by the real filesystem and system clock, with
    /// a cache database at `cache_path`, registering `sd_root` as its
    /// first Storage Directory.
    pub fn open(
        cache_path: impl AsRef<Path>,
        sd_root: impl Into<PathBuf>,
        instance_id: InstanceId,
        config: CoreConfig,
    ) -> Result<Self> {
        let cache = Cache::open(cache_path)?;
        Self::open_with(Arc::new(RealFileSystem), Arc::new(SystemClock), cache, sd_root, instance_id, config)
    }

    /// Open a context over injected filesystem/clock/cache implementations.
    pub fn open_with(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        cache: Cache,
        sd_root: impl Into<PathBuf>,
        instance_id: InstanceId,
        config: CoreConfig,
    ) -> Result<Self> {
        let ctx = Self(Arc::new(Inner {
            fs,
            clock,
            instance: instance_id,
            config,
            cache: Mutex::new(cache),
            sds: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            activity: Mutex::new(HashMap::new()),
        }));
        ctx.register_storage_dir(sd_root)?;
        Ok(ctx)
    }

    /// Register an additional Storage Directory with this profile, reading
    /// or adopting its `SD_ID`.
    pub fn register_storage_dir(&self, root: impl Into<PathBuf>) -> Result<SdUuid> {
        let sd = crate::sd::StorageDir::new(root.into());
        let uuid = sd.ensure_sd_uuid(&*self.0.fs)?;
        self.0
            .cache
            .lock()
            .unwrap()
            .upsert_storage_dir(uuid, &sd.root().to_string_lossy())?;
        self.0.sds.lock().unwrap().insert(uuid, sd);
        Ok(uuid)
    }

    fn storage_dir(&self, sd_uuid: SdUuid) -> Result<crate::sd::StorageDir> {
        self.0
            .sds
            .lock()
            .unwrap()
            .get(&sd_uuid)
            .cloned()
            .ok_or_else(|| CoreError::StorageUnavailable(PathBuf::from(sd_uuid.to_string())))
    }

    fn sd_id(&self, sd_uuid: SdUuid) -> Result<SdId> {
        self.0
            .cache
            .lock()
            .unwrap()
            .sd_id_for_uuid(sd_uuid)?
            .ok_or_else(|| CoreError::StorageUnavailable(PathBuf::from(sd_uuid.to_string())))
    }

    fn update_manager<'a>(&'a self, sd: &'a crate::sd::StorageDir) -> UpdateManager<'a> {
        UpdateManager::new(&*self.0.fs, &*self.0.clock, sd, self.0.instance.clone(), &self.0.config)
    }

    /// Open a handle to one document.
    pub fn open_document(&self, sd_uuid: SdUuid, doc: DocumentRef) -> Result<DocumentHandle> {
        self.storage_dir(sd_uuid)?;
        Ok(DocumentHandle {
            context: self.clone(),
            sd_uuid,
            doc,
        })
    }

    /// `listNotes(sdId, folderId, filter)`.
    pub fn list_notes(&self, sd_uuid: SdUuid, folder_id: Option<FolderId>, filter: NoteFilter) -> Result<Vec<NoteRow>> {
        let sd_id = self.sd_id(sd_uuid)?;
        self.0.cache.lock().unwrap().list_notes(sd_id, folder_id, filter)
    }

    /// `searchNotes(query)`.
    pub fn search_notes(&self, query: &str) -> Result<Vec<NoteRow>> {
        self.0.cache.lock().unwrap().search_notes(query)
    }

    /// `createNote(sdId, folderId)`: writes an empty
    /// document's initial state as update 0 and seeds its cache row.
    pub fn create_note(&self, sd_uuid: SdUuid, folder_id: Option<FolderId>) -> Result<NoteId> {
        let sd = self.storage_dir(sd_uuid)?;
        let sd_id = self.sd_id(sd_uuid)?;
        let note = NoteId::new();

        let doc = YrsDocument::new();
        let um = self.update_manager(&sd);
        um.write_update(DocumentRef::Note(note), &doc.encode_state())?;

        self.hydrate_note_cache(sd_id, note, folder_id, &doc)?;
        Ok(note)
    }

    /// `soft_delete_note(note_id)`.
    pub fn soft_delete_note(&self, sd_uuid: SdUuid, note: NoteId) -> Result<()> {
        let sd = self.storage_dir(sd_uuid)?;
        let um = self.update_manager(&sd);
        let composed = um.read_composed_state(DocumentRef::Note(note))?;
        let before = composed.document.encode_state_vector();
        composed.document.set_deleted(true)?;
        let diff = composed.document.encode_diff(&before)?;
        um.write_update(DocumentRef::Note(note), &diff)?;

        let sd_id = self.sd_id(sd_uuid)?;
        self.0.cache.lock().unwrap().soft_delete_note(sd_id, note)?;
        self.notify(sd_uuid, DocumentRef::Note(note), composed.clock);
        Ok(())
    }

    /// `moveNote(note_id, dest_folder_id)`: intra-SD folder
    /// reassignment. Recorded in the folder-tree document so other
    /// instances converge on it, and mirrored into the cache's derived
    /// `folder_id` column so `listNotes` doesn't need to recompose the
    /// folder tree on every call.
    pub fn move_note(&self, sd_uuid: SdUuid, note: NoteId, dest_folder: Option<FolderId>) -> Result<()> {
        let sd = self.storage_dir(sd_uuid)?;
        let um = self.update_manager(&sd);
        let composed = um.read_composed_state(DocumentRef::FolderTree)?;
        let before = composed.document.encode_state_vector();
        let key = note.to_string();
        composed
            .document
            .set_meta(&key, &dest_folder.map(|f| f.to_string()).unwrap_or_default())?;
        let diff = composed.document.encode_diff(&before)?;
        um.write_update(DocumentRef::FolderTree, &diff)?;

        let sd_id = self.sd_id(sd_uuid)?;
        self.0.cache.lock().unwrap().set_note_folder(sd_id, note, dest_folder)?;
        self.notify(sd_uuid, DocumentRef::FolderTree, composed.clock);
        Ok(())
    }

    /// Move a note across storage directories: drives a [`MoveExecutor`]
    /// through the full protocol, rolling back on any failure.
    pub fn move_note_cross_sd(
        &self,
        note: NoteId,
        source_sd: SdUuid,
        target_sd: SdUuid,
        target_folder: FolderId,
        strategy: Option<ConflictStrategy>,
    ) -> Result<MoveId> {
        let source = self.storage_dir(source_sd)?;
        let target = self.storage_dir(target_sd)?;
        let now = self.0.clock.now_ms();

        let mut record = MoveRecord::new(
            note,
            source_sd,
            target_sd,
            target_folder,
            self.0.instance.clone(),
            source.root().to_path_buf(),
            target.root().to_path_buf(),
            now,
        );
        let cache = self.0.cache.lock().unwrap();
        cache.upsert_move(&record)?;
        drop(cache);

        let exec = MoveExecutor::new(&*self.0.fs, &*self.0.clock);
        let outcome = self.run_move(&exec, &mut record, strategy);

        if outcome.is_err() {
            let cache = self.0.cache.lock().unwrap();
            let _ = exec.rollback(&mut record, &*cache);
        }
        self.0.cache.lock().unwrap().upsert_move(&record)?;
        Ok(record.id)
    }

    fn run_move(
        &self,
        exec: &MoveExecutor<'_>,
        record: &mut MoveRecord,
        strategy: Option<ConflictStrategy>,
    ) -> Result<()> {
        exec.copy_to_scratch(record)?;
        let cache = self.0.cache.lock().unwrap();
        exec.update_db(record, &*cache, strategy)?;
        drop(cache);
        if record.state == MoveState::Cancelled {
            return Ok(());
        }
        exec.finalize_on_target(record, &self.0.instance)?;
        exec.cleanup_source(record, &self.0.instance)
    }

    /// Resume any non-terminal moves owned by this instance after a
    /// restart. A move whose source or
    /// target SD isn't currently registered with this context is left
    /// untouched — the caller is expected to register every known SD
    /// before calling this, and a move for an SD that's genuinely gone
    /// surfaces via [`CoreError::StorageUnavailable`] on its own path
    /// instead. Returns the ids of moves this pass drove to a new state
    /// (including a rollback).
    ///
    /// A conflict newly discovered during resume
    /// cannot be interactively resolved here, since there is no caller on
    /// the stack to ask; it is treated as `strategy = None`, which fails
    /// the step and rolls the move back, leaving it available for
    /// [`Self::list_stuck_moves`]/[`Self::take_over_move`] with a fresh
    /// attempt. In practice this only matters if the crash happened
    /// during the `files_copied -> db_updated` transition itself.
    pub fn recover_moves(&self) -> Result<Vec<MoveId>> {
        let pending = self
            .0
            .cache
            .lock()
            .unwrap()
            .list_nonterminal_moves(Some(self.0.instance.as_str()))?;

        let mut touched = Vec::new();
        for mut record in pending {
            if self.storage_dir(record.source_sd).is_err() || self.storage_dir(record.target_sd).is_err() {
                continue;
            }
            let exec = MoveExecutor::new(&*self.0.fs, &*self.0.clock);
            let outcome = self.resume_move(&exec, &mut record);
            if outcome.is_err() {
                let cache = self.0.cache.lock().unwrap();
                let _ = exec.rollback(&mut record, &*cache);
            }
            self.0.cache.lock().unwrap().upsert_move(&record)?;
            touched.push(record.id);
        }
        Ok(touched)
    }

    /// Drive `record` through the remaining steps from its
    /// [`MoveRecord::resume_from`] point.
    fn resume_move(&self, exec: &MoveExecutor<'_>, record: &mut MoveRecord) -> Result<()> {
        if matches!(record.resume_from(), MoveState::Initiated) {
            exec.copy_to_scratch(record)?;
        }
        if matches!(record.state, MoveState::FilesCopied) {
            let cache = self.0.cache.lock().unwrap();
            exec.update_db(record, &*cache, None)?;
            drop(cache);
            if record.state == MoveState::Cancelled {
                return Ok(());
            }
        }
        if matches!(record.state, MoveState::DbUpdated) {
            exec.finalize_on_target(record, &self.0.instance)?;
        }
        if matches!(record.state, MoveState::Cleaning) {
            exec.cleanup_source(record, &self.0.instance)?;
        }
        Ok(())
    }

    /// `listStuckMoves()`.
    pub fn list_stuck_moves(&self) -> Result<Vec<MoveRecord>> {
        let now = self.0.clock.now_ms();
        let stuck_age_ms = self.0.config.stuck_move_age.as_millis() as i64;
        let cache = self.0.cache.lock().unwrap();
        Ok(cache
            .list_nonterminal_moves(None)?
            .into_iter()
            .filter(|r| r.is_stuck(now, &self.0.instance, stuck_age_ms))
            .collect())
    }

    /// `takeOverMove(moveId)`: claim ownership of a
    /// stuck move so this instance resumes driving it.
    pub fn take_over_move(&self, move_id: MoveId) -> Result<()> {
        let cache = self.0.cache.lock().unwrap();
        let mut record = cache
            .get_move(move_id)?
            .ok_or_else(|| CoreError::MoveConflict { note_id: move_id.to_string() })?;
        record.take_over(self.0.instance.clone(), self.0.clock.now_ms());
        cache.upsert_move(&record)
    }

    /// `cancelMove(moveId)`: abandon a non-terminal move.
    /// Files already copied into the target's scratch directory are rolled
    /// back, same as an execution failure.
    pub fn cancel_move(&self, move_id: MoveId) -> Result<()> {
        let cache = self.0.cache.lock().unwrap();
        let mut record = cache
            .get_move(move_id)?
            .ok_or_else(|| CoreError::MoveConflict { note_id: move_id.to_string() })?;
        drop(cache);

        let exec = MoveExecutor::new(&*self.0.fs, &*self.0.clock);
        let cache = self.0.cache.lock().unwrap();
        exec.rollback(&mut record, &*cache)?;
        record.state = MoveState::Cancelled;
        cache.upsert_move(&record)
    }

    /// Run a wake-discovery pass over `sd_uuid`, composing
    /// state for newly-found notes and evicting hard-deleted ones from the
    /// cache.
    pub fn wake_discovery(&self, sd_uuid: SdUuid) -> Result<wake::WakePlan> {
        let sd = self.storage_dir(sd_uuid)?;
        let sd_id = self.sd_id(sd_uuid)?;
        let known = self.0.cache.lock().unwrap().known_note_ids(sd_id)?;
        let plan = wake::plan(&*self.0.fs, &sd, &known)?;

        for &note in &plan.to_insert {
            let um = self.update_manager(&sd);
            let composed = um.read_composed_state(DocumentRef::Note(note))?;
            self.hydrate_note_cache(sd_id, note, None, &composed.document)?;
        }
        for &note in &plan.to_hard_delete {
            self.0.cache.lock().unwrap().remove_note(sd_id, note)?;
        }
        Ok(plan)
    }

    /// Run a GC pass over every document in `sd_uuid`.
    pub fn run_gc(&self, sd_uuid: SdUuid) -> Result<GcStats> {
        let sd = self.storage_dir(sd_uuid)?;
        Ok(gc::run_gc_for_sd(&*self.0.fs, &*self.0.clock, &sd, self.0.instance.clone(), &self.0.config))
    }

    /// Pack this instance's own updates across every document in `sd_uuid`.
    /// Intended to run on `pack_interval`; distinct from GC, which only
    /// cleans up what packing (and failed/abandoned packs) leaves behind.
    pub fn pack_updates(&self, sd_uuid: SdUuid) -> Result<usize> {
        let sd = self.storage_dir(sd_uuid)?;
        let summary =
            update_manager::pack_updates_for_sd(&*self.0.fs, &*self.0.clock, &sd, self.0.instance.clone(), &self.0.config)?;
        for (doc, err) in &summary.errors {
            log::warn!("pack_updates: {doc:?} failed: {err}");
        }
        Ok(summary.packed)
    }

    /// Force a snapshot for any document that has gone idle past
    /// `snapshot_thresholds.idle_force_after` with enough pending updates,
    /// without requiring a further edit to trigger the check —
    /// `DocumentHandle::apply_local_edit` only re-evaluates
    /// `should_snapshot` when a new edit actually arrives, so a document
    /// that simply stops being edited needs this sweep to ever get forced.
    pub fn snapshot_maintenance(&self, sd_uuid: SdUuid) -> Result<usize> {
        let now = self.0.clock.now_ms();
        let due: Vec<DocumentRef> = {
            let activity = self.0.activity.lock().unwrap();
            activity
                .iter()
                .filter(|((sd, _), _)| *sd == sd_uuid)
                .filter_map(|((_, doc), state)| {
                    let input = SnapshotDecisionInput {
                        updates_since_snapshot: state.updates_since_snapshot,
                        idle_ms: state.idle_ms(now),
                        edit_rate: state.edit_rate(now),
                    };
                    (state.updates_since_snapshot > 0
                        && input.idle_ms >= self.0.config.snapshot_thresholds.idle_force_after.as_millis() as i64
                        && input.updates_since_snapshot >= self.0.config.snapshot_thresholds.idle_force)
                        .then_some(*doc)
                })
                .collect()
        };

        let sd = self.storage_dir(sd_uuid)?;
        let um = self.update_manager(&sd);
        let mut forced = 0;
        for doc in due {
            um.create_snapshot(doc)?;
            if let Some(state) = self.0.activity.lock().unwrap().get_mut(&(sd_uuid, doc)) {
                state.updates_since_snapshot = 0;
            }
            forced += 1;
        }
        Ok(forced)
    }

    /// Record a just-written local edit against `doc`'s activity tracker
    /// and create a snapshot now if the edit-rate-adaptive threshold (or
    /// the idle-force condition) is crossed.
    fn record_edit_and_maybe_snapshot(&self, sd: &crate::sd::StorageDir, sd_uuid: SdUuid, doc: DocumentRef) -> Result<()> {
        let now = self.0.clock.now_ms();
        let due = {
            let mut activity = self.0.activity.lock().unwrap();
            let state = activity.entry((sd_uuid, doc)).or_default();
            state.record_edit(now);
            let input = SnapshotDecisionInput {
                updates_since_snapshot: state.updates_since_snapshot,
                idle_ms: state.idle_ms(now),
                edit_rate: state.edit_rate(now),
            };
            let um = UpdateManager::new(&*self.0.fs, &*self.0.clock, sd, self.0.instance.clone(), &self.0.config);
            if um.should_snapshot(input) {
                state.updates_since_snapshot = 0;
                true
            } else {
                false
            }
        };
        if due {
            self.update_manager(sd).create_snapshot(doc)?;
        }
        Ok(())
    }

    /// Purge old terminal move records. Intended
    /// to be run on the same cadence as GC.
    pub fn purge_old_moves(&self) -> Result<usize> {
        let now = self.0.clock.now_ms();
        self.0
            .cache
            .lock()
            .unwrap()
            .purge_old_moves(now, self.0.config.move_record_retention_days)
    }

    /// Remove cache rows with no valid referent. Run at startup.
    pub fn cleanup_orphaned_cache(&self) -> Result<crate::cache::OrphanCleanupStats> {
        self.0.cache.lock().unwrap().cleanup_orphaned_data()
    }

    /// A clone of the current configuration, for callers
    /// like the optional background scheduler that need it outside this
    /// context's own lock scopes.
    pub fn config_snapshot(&self) -> CoreConfig {
        self.0.config.clone()
    }

    fn hydrate_note_cache(
        &self,
        sd_id: SdId,
        note: NoteId,
        folder_hint: Option<FolderId>,
        doc: &YrsDocument,
    ) -> Result<()> {
        let cache = self.0.cache.lock().unwrap();
        let existing = cache.get_note(sd_id, note)?;
        let folder_id = folder_hint.or_else(|| existing.as_ref().and_then(|n| n.folder_id));
        let pinned = existing.as_ref().map(|n| n.pinned).unwrap_or(false);
        let text = doc.text();

        cache.upsert_note(
            &NoteRow {
                id: note,
                sd_id,
                folder_id,
                title: extract::extract_title(&text),
                preview: extract::extract_preview(&text),
                deleted: doc.is_deleted(),
                pinned,
                updated_at_ms: self.0.clock.now_ms(),
            },
            &text,
        )?;
        cache.set_tags_for_note(note, &extract::extract_tags(&text))
    }

    fn notify(&self, sd_uuid: SdUuid, doc: DocumentRef, clock: VectorClock) {
        let mut subscribers = self.0.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get_mut(&(sd_uuid, doc)) {
            senders.retain(|s| s.send(RemoteUpdate { doc, clock: clock.clone() }).is_ok());
        }
    }
}

/// A handle to one document within one Storage Directory.
pub struct DocumentHandle {
    context: CoreContext,
    sd_uuid: SdUuid,
    doc: DocumentRef,
}

impl DocumentHandle {
    /// Apply a local edit: replace the document's text content, write the
    /// resulting minimal diff as a new update file, refresh the cache, and
    /// force a snapshot now if this document's edit-rate-adaptive
    /// threshold is crossed.
    pub fn apply_local_edit(&self, content: &str) -> Result<()> {
        let sd = self.context.storage_dir(self.sd_uuid)?;
        let um = self.context.update_manager(&sd);
        let composed = um.read_composed_state(self.doc)?;

        if composed.document.text() == content {
            return Ok(());
        }

        let before = composed.document.encode_state_vector();
        composed.document.set_text(content)?;
        let diff = composed.document.encode_diff(&before)?;
        um.write_update(self.doc, &diff)?;
        self.context.record_edit_and_maybe_snapshot(&sd, self.sd_uuid, self.doc)?;

        if let DocumentRef::Note(note) = self.doc {
            let sd_id = self.context.sd_id(self.sd_uuid)?;
            self.context.hydrate_note_cache(sd_id, note, None, &composed.document)?;
        }
        self.context.notify(self.sd_uuid, self.doc, composed.clock);
        Ok(())
    }

    /// Recompose and return the document's current plain-text content.
    pub fn read(&self) -> Result<String> {
        let sd = self.context.storage_dir(self.sd_uuid)?;
        let um = self.context.update_manager(&sd);
        Ok(um.read_composed_state(self.doc)?.document.text())
    }

    /// Subscribe to remote-update notifications for this document. The
    /// embedder is responsible for calling [`CoreContext::wake_discovery`]
    /// or otherwise triggering a recomposition when the fast path or
    /// polling group detects a new file; this channel is how that news
    /// reaches this handle's owner.
    pub fn subscribe(&self) -> Receiver<RemoteUpdate> {
        let (tx, rx) = mpsc::channel();
        self.context
            .0
            .subscribers
            .lock()
            .unwrap()
            .entry((self.sd_uuid, self.doc))
            .or_default()
            .push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock_source::FixedClock;
    use crate::fs::InMemoryFileSystem;

    fn context() -> CoreContext {
        CoreContext::open_with(
            Arc::new(InMemoryFileSystem::new()),
            Arc::new(FixedClock::new(1_000)),
            Cache::open_in_memory().unwrap(),
            "/sd",
            InstanceId::from_str_override("inst-a"),
            CoreConfig::default(),
        )
        .unwrap()
    }

    fn context_with_config(config: CoreConfig) -> (CoreContext, Arc<FixedClock>) {
        let clock = Arc::new(FixedClock::new(1_000));
        let ctx = CoreContext::open_with(
            Arc::new(InMemoryFileSystem::new()),
            clock.clone(),
            Cache::open_in_memory().unwrap(),
            "/sd",
            InstanceId::from_str_override("inst-a"),
            config,
        )
        .unwrap();
        (ctx, clock)
    }

    fn sd_uuid(ctx: &CoreContext) -> SdUuid {
        *ctx.0.sds.lock().unwrap().keys().next().unwrap()
    }

    fn snapshot_count(ctx: &CoreContext, sd_uuid: SdUuid, doc: DocumentRef) -> usize {
        let sd = ctx.storage_dir(sd_uuid).unwrap();
        ctx.0.fs.list_dir(&sd.snapshots_dir(doc)).unwrap().len()
    }

    #[test]
    fn create_note_is_immediately_listable() {
        let ctx = context();
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let notes = ctx.list_notes(sd, None, NoteFilter::Active).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, note);
    }

    #[test]
    fn apply_local_edit_updates_title_and_search_index() {
        let ctx = context();
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let handle = ctx.open_document(sd, DocumentRef::Note(note)).unwrap();
        handle.apply_local_edit("Shopping List\n\nmilk eggs bread #groceries").unwrap();

        assert_eq!(handle.read().unwrap(), "Shopping List\n\nmilk eggs bread #groceries");
        let notes = ctx.list_notes(sd, None, NoteFilter::Active).unwrap();
        assert_eq!(notes[0].title, "Shopping List");
        assert_eq!(ctx.search_notes("eggs").unwrap().len(), 1);
    }

    #[test]
    fn soft_delete_moves_note_out_of_active_filter() {
        let ctx = context();
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        ctx.soft_delete_note(sd, note).unwrap();

        assert!(ctx.list_notes(sd, None, NoteFilter::Active).unwrap().is_empty());
        assert_eq!(ctx.list_notes(sd, None, NoteFilter::Deleted).unwrap().len(), 1);
    }

    #[test]
    fn move_note_updates_cached_folder() {
        let ctx = context();
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let folder = FolderId::new();
        ctx.move_note(sd, note, Some(folder)).unwrap();

        let notes = ctx.list_notes(sd, Some(folder), NoteFilter::Active).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, note);
    }

    #[test]
    fn subscriber_receives_notification_on_local_edit() {
        let ctx = context();
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let handle = ctx.open_document(sd, DocumentRef::Note(note)).unwrap();
        let rx = handle.subscribe();

        handle.apply_local_edit("hello").unwrap();
        let update = rx.try_recv().unwrap();
        assert_eq!(update.doc, DocumentRef::Note(note));
    }

    #[test]
    fn wake_discovery_finds_notes_written_by_another_instance() {
        let ctx = context();
        let sd = sd_uuid(&ctx);

        // Simulate a note written directly by another instance, bypassing
        // this context's own cache writes.
        let other_fs = ctx.0.fs.clone();
        let other_sd = ctx.storage_dir(sd).unwrap();
        let other_instance = InstanceId::from_str_override("inst-b");
        let other_clock = FixedClock::new(2_000);
        let other_um = UpdateManager::new(&*other_fs, &other_clock, &other_sd, other_instance, &ctx.0.config);
        let note = NoteId::new();
        let doc = YrsDocument::new();
        doc.set_text("from another device").unwrap();
        other_um.write_update(DocumentRef::Note(note), &doc.encode_state()).unwrap();

        let plan = ctx.wake_discovery(sd).unwrap();
        assert_eq!(plan.to_insert, vec![note]);
        let notes = ctx.list_notes(sd, None, NoteFilter::Active).unwrap();
        assert!(notes.iter().any(|n| n.id == note));
    }

    #[test]
    fn cross_sd_move_relocates_note_and_marks_completed() {
        let ctx = context();
        let source = sd_uuid(&ctx);
        let target = ctx.register_storage_dir("/sd2").unwrap();
        let note = ctx.create_note(source, None).unwrap();
        let dest_folder = FolderId::new();

        let move_id = ctx
            .move_note_cross_sd(note, source, target, dest_folder, None)
            .unwrap();

        let record = ctx.0.cache.lock().unwrap().get_move(move_id).unwrap().unwrap();
        assert_eq!(record.state, MoveState::Completed);
        assert!(ctx.list_notes(source, None, NoteFilter::All).unwrap().is_empty());
        assert_eq!(ctx.list_notes(target, Some(dest_folder), NoteFilter::Active).unwrap().len(), 1);
    }

    #[test]
    fn recover_moves_resumes_a_move_interrupted_after_db_update() {
        let ctx = context();
        let source = sd_uuid(&ctx);
        let target = ctx.register_storage_dir("/sd2").unwrap();
        let note = ctx.create_note(source, None).unwrap();
        let dest_folder = FolderId::new();

        // Simulate a crash right after the `db_updated` transition: drive
        // the move that far by hand instead of going through
        // `move_note_cross_sd` (which would run it to completion).
        let src_sd = ctx.storage_dir(source).unwrap();
        let tgt_sd = ctx.storage_dir(target).unwrap();
        let mut record = MoveRecord::new(
            note,
            source,
            target,
            dest_folder,
            ctx.0.instance.clone(),
            src_sd.root().to_path_buf(),
            tgt_sd.root().to_path_buf(),
            ctx.0.clock.now_ms(),
        );
        let exec = MoveExecutor::new(&*ctx.0.fs, &*ctx.0.clock);
        exec.copy_to_scratch(&mut record).unwrap();
        let cache = ctx.0.cache.lock().unwrap();
        exec.update_db(&mut record, &*cache, None).unwrap();
        drop(cache);
        assert_eq!(record.state, MoveState::DbUpdated);
        ctx.0.cache.lock().unwrap().upsert_move(&record).unwrap();

        let recovered = ctx.recover_moves().unwrap();
        assert_eq!(recovered, vec![record.id]);

        let stored = ctx.0.cache.lock().unwrap().get_move(record.id).unwrap().unwrap();
        assert_eq!(stored.state, MoveState::Completed);
        assert_eq!(ctx.list_notes(target, Some(dest_folder), NoteFilter::Active).unwrap().len(), 1);
    }

    #[test]
    fn recover_moves_ignores_moves_owned_by_another_instance() {
        let ctx = context();
        let source = sd_uuid(&ctx);
        let target = ctx.register_storage_dir("/sd2").unwrap();
        let note = ctx.create_note(source, None).unwrap();

        let src_sd = ctx.storage_dir(source).unwrap();
        let tgt_sd = ctx.storage_dir(target).unwrap();
        let record = MoveRecord::new(
            note,
            source,
            target,
            FolderId::new(),
            InstanceId::from_str_override("inst-other"),
            src_sd.root().to_path_buf(),
            tgt_sd.root().to_path_buf(),
            ctx.0.clock.now_ms(),
        );
        ctx.0.cache.lock().unwrap().upsert_move(&record).unwrap();

        assert!(ctx.recover_moves().unwrap().is_empty());
        let stored = ctx.0.cache.lock().unwrap().get_move(record.id).unwrap().unwrap();
        assert_eq!(stored.state, MoveState::Initiated);
    }

    #[test]
    fn apply_local_edit_forces_a_snapshot_once_the_rate_threshold_is_crossed() {
        let mut config = CoreConfig::default();
        // All four buckets set to the same small value so the test doesn't
        // depend on exactly which bucket two rapid edits land in.
        config.snapshot_thresholds.very_high = 2;
        config.snapshot_thresholds.high = 2;
        config.snapshot_thresholds.medium = 2;
        config.snapshot_thresholds.low = 2;
        let (ctx, _clock) = context_with_config(config);
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let doc = DocumentRef::Note(note);
        let handle = ctx.open_document(sd, doc).unwrap();

        handle.apply_local_edit("one").unwrap();
        assert_eq!(snapshot_count(&ctx, sd, doc), 0);

        handle.apply_local_edit("one two").unwrap();
        assert_eq!(snapshot_count(&ctx, sd, doc), 1);
    }

    #[test]
    fn snapshot_maintenance_forces_a_snapshot_after_idle_with_enough_updates() {
        let mut config = CoreConfig::default();
        // Thresholds per-rate stay high so the per-edit check never fires,
        // isolating the idle-force path this test targets.
        config.snapshot_thresholds.low = 1_000;
        config.snapshot_thresholds.idle_force = 1;
        config.snapshot_thresholds.idle_force_after = std::time::Duration::from_secs(60);
        let (ctx, clock) = context_with_config(config);
        let sd = sd_uuid(&ctx);
        let note = ctx.create_note(sd, None).unwrap();
        let doc = DocumentRef::Note(note);
        let handle = ctx.open_document(sd, doc).unwrap();
        handle.apply_local_edit("hello").unwrap();
        assert_eq!(snapshot_count(&ctx, sd, doc), 0);

        // Not yet idle long enough: no snapshot.
        assert_eq!(ctx.snapshot_maintenance(sd).unwrap(), 0);

        clock.advance_ms(61_000);
        assert_eq!(ctx.snapshot_maintenance(sd).unwrap(), 1);
        assert_eq!(snapshot_count(&ctx, sd, doc), 1);

        // A second sweep has nothing left to force.
        assert_eq!(ctx.snapshot_maintenance(sd).unwrap(), 0);
    }
}
