//! Garbage collection of redundant snapshot/pack/update files.
//!
//! GC is a safety net, not the primary space-reclamation mechanism — that's
//! `UpdateManager::pack_updates`. GC exists to clean up stragglers left by
//! crashed packs, failed deletions, and instances that went away mid-write.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::CoreError;
use crate::ids::InstanceId;
use crate::sd::DocumentRef;
use crate::update_manager::UpdateManager;

/// One file GC failed to delete or inspect, collected rather than aborting
/// the whole pass.
#[derive(Debug)]
pub struct GcError {
    /// Path of the file GC could not remove.
    pub path: PathBuf,
    /// Why removal failed.
    pub error: CoreError,
}

/// Outcome of one `runGC` pass over a single document.
#[derive(Debug, Default)]
pub struct GcStats {
    /// Snapshot files deleted (older than the retained set).
    pub snapshots_deleted: usize,
    /// Pack files deleted (fully absorbed into the retained baseline and
    /// old enough).
    pub packs_deleted: usize,
    /// Update files deleted (fully absorbed and old enough).
    pub updates_deleted: usize,
    /// Per-file failures, isolated so one bad file doesn't abort the pass.
    pub errors: Vec<GcError>,
}

impl GcStats {
    fn merge(&mut self, other: GcStats) {
        self.snapshots_deleted += other.snapshots_deleted;
        self.packs_deleted += other.packs_deleted;
        self.updates_deleted += other.updates_deleted;
        self.errors.extend(other.errors);
    }
}

impl<'a> UpdateManager<'a> {
    /// Run one GC pass over `doc`.
    ///
    /// Per-file errors are isolated into [`GcStats::errors`] rather than
    /// aborting the whole pass.
    pub fn run_gc(&self, doc: DocumentRef) -> GcStats {
        let mut stats = GcStats::default();

        let mut snapshots = match self.list_snapshots_pub(doc) {
            Ok(s) => s,
            Err(e) => {
                stats.errors.push(GcError {
                    path: self.sd().snapshots_dir(doc),
                    error: e,
                });
                return stats;
            }
        };
        // Sort newest (by totalChanges) first so the first `gc_snapshot_retention`
        // entries are the kept set.
        snapshots.sort_by(|(a, _), (b, _)| b.total_changes.cmp(&a.total_changes));

        let retention = self.config_snapshot_retention();
        let (kept, stale) = if snapshots.len() > retention {
            snapshots.split_at(retention)
        } else {
            (&snapshots[..], &snapshots[0..0][..])
        };

        // KEEP_VC is the pointwise max across every *kept* snapshot's clock:
        // a pack/update is only redundant once it's absorbed by every
        // snapshot we intend to keep, not merely the single oldest one.
        let mut keep_vc: BTreeMap<InstanceId, u64> = BTreeMap::new();
        for (_, snap) in kept {
            for (instance, seq) in &snap.max_sequences {
                let slot = keep_vc.entry(instance.clone()).or_insert(0);
                if *seq > *slot {
                    *slot = *seq;
                }
            }
        }

        for (name, _) in stale {
            let path = self
                .sd()
                .snapshots_dir(doc)
                .join(crate::filename::SnapshotName {
                    total_changes: name.total_changes,
                    creating_instance: name.creating_instance.clone(),
                }
                .to_string());
            match self.fs().remove_file(&path) {
                Ok(()) => stats.snapshots_deleted += 1,
                Err(e) => stats.errors.push(GcError {
                    path: path.clone(),
                    error: CoreError::FileWrite { path, source: e },
                }),
            }
        }

        let now = self.now_ms();
        let min_history_ms = self.config_min_history_ms();

        let packs = match self.list_packs_pub(doc) {
            Ok(p) => p,
            Err(e) => {
                stats.errors.push(GcError {
                    path: self.sd().packs_dir(doc),
                    error: e,
                });
                return stats;
            }
        };
        for (name, path) in packs {
            let floor = keep_vc.get(&name.instance).copied().unwrap_or(0);
            if name.end_seq > floor {
                continue;
            }
            let Some(newest_ts) = self.pack_newest_timestamp(&path) else {
                continue;
            };
            if now - newest_ts < min_history_ms {
                continue;
            }
            match self.fs().remove_file(&path) {
                Ok(()) => stats.packs_deleted += 1,
                Err(e) => stats.errors.push(GcError {
                    path: path.clone(),
                    error: CoreError::FileWrite { path, source: e },
                }),
            }
        }

        let updates = match self.list_updates_pub(doc) {
            Ok(u) => u,
            Err(e) => {
                stats.errors.push(GcError {
                    path: self.sd().updates_dir(doc),
                    error: e,
                });
                return stats;
            }
        };
        for (name, path) in updates {
            let floor = keep_vc.get(&name.instance).copied().unwrap_or(0);
            if name.seq > floor {
                continue;
            }
            if now - name.timestamp_ms < min_history_ms {
                continue;
            }
            match self.fs().remove_file(&path) {
                Ok(()) => stats.updates_deleted += 1,
                Err(e) => stats.errors.push(GcError {
                    path: path.clone(),
                    error: CoreError::FileWrite { path, source: e },
                }),
            }
        }

        stats
    }

    fn config_snapshot_retention(&self) -> usize {
        self.config_ref().gc_snapshot_retention
    }

    fn config_min_history_ms(&self) -> i64 {
        self.config_ref().gc_min_history.as_millis() as i64
    }
}

/// Run GC over every note and the folder-tree document in one SD.
pub fn run_gc_for_sd(
    fs: &dyn crate::fs::FileSystem,
    clock_source: &dyn crate::clock_source::Clock,
    sd: &crate::sd::StorageDir,
    instance: InstanceId,
    config: &crate::config::CoreConfig,
) -> GcStats {
    let mut total = GcStats::default();

    let note_ids = match sd.list_note_ids(fs) {
        Ok(ids) => ids,
        Err(e) => {
            total.errors.push(GcError {
                path: sd.notes_dir(),
                error: e,
            });
            return total;
        }
    };

    let mut docs: Vec<DocumentRef> = note_ids.into_iter().map(DocumentRef::Note).collect();
    docs.push(DocumentRef::FolderTree);

    for doc in docs {
        let mgr = UpdateManager::new(fs, clock_source, sd, instance.clone(), config);
        total.merge(mgr.run_gc(doc));
    }

    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock_source::FixedClock;
    use crate::crdt::{CrdtDocument, YrsDocument};
    use crate::fs::InMemoryFileSystem;
    use crate::ids::NoteId;

    fn setup() -> (
        InMemoryFileSystem,
        FixedClock,
        crate::sd::StorageDir,
        crate::config::CoreConfig,
    ) {
        (
            InMemoryFileSystem::new(),
            FixedClock::new(1_700_000_000_000),
            crate::sd::StorageDir::new("/sd"),
            crate::config::CoreConfig::default(),
        )
    }

    #[test]
    fn gc_retains_only_the_configured_number_of_snapshots() {
        let (fs, clock, sd, mut cfg) = setup();
        cfg.gc_snapshot_retention = 1;
        let instance = InstanceId::new();
        let doc = DocumentRef::Note(NoteId::new());
        let mgr = UpdateManager::new(&fs, &clock, &sd, instance.clone(), &cfg);

        for i in 0..2 {
            let d = YrsDocument::new();
            d.set_text(&format!("v{i}")).unwrap();
            mgr.write_update(doc, &d.encode_state()).unwrap();
            mgr.create_snapshot(doc).unwrap();
        }
        assert_eq!(mgr.list_snapshots_pub(doc).unwrap().len(), 2);

        clock.advance_ms(2 * 24 * 60 * 60 * 1000);
        let stats = mgr.run_gc(doc);
        assert_eq!(stats.snapshots_deleted, 1);
        assert_eq!(mgr.list_snapshots_pub(doc).unwrap().len(), 1);
    }

    #[test]
    fn gc_leaves_updates_newer_than_min_history_alone() {
        let (fs, clock, sd, cfg) = setup();
        let instance = InstanceId::new();
        let doc = DocumentRef::Note(NoteId::new());
        let mgr = UpdateManager::new(&fs, &clock, &sd, instance.clone(), &cfg);

        mgr.write_update(doc, b"x").unwrap();
        mgr.create_snapshot(doc).unwrap();

        // Fresh: nothing eligible yet.
        let stats = mgr.run_gc(doc);
        assert_eq!(stats.updates_deleted, 0);
        assert_eq!(mgr.list_updates_pub(doc).unwrap().len(), 1);

        clock.advance_ms(2 * 24 * 60 * 60 * 1000);
        let stats = mgr.run_gc(doc);
        assert_eq!(stats.updates_deleted, 1);
        assert_eq!(mgr.list_updates_pub(doc).unwrap().len(), 0);
    }

    #[test]
    fn gc_does_not_delete_updates_not_covered_by_kept_snapshots() {
        let (fs, clock, sd, cfg) = setup();
        let instance = InstanceId::new();
        let doc = DocumentRef::Note(NoteId::new());
        let mgr = UpdateManager::new(&fs, &clock, &sd, instance.clone(), &cfg);

        mgr.write_update(doc, b"x").unwrap();
        // No snapshot taken: KEEP_VC is empty, so nothing is "absorbed" yet.
        clock.advance_ms(2 * 24 * 60 * 60 * 1000);
        let stats = mgr.run_gc(doc);
        assert_eq!(stats.updates_deleted, 0);
        assert_eq!(mgr.list_updates_pub(doc).unwrap().len(), 1);
    }

    #[test]
    fn run_gc_for_sd_covers_notes_and_folder_tree() {
        let (fs, clock, sd, cfg) = setup();
        let instance = InstanceId::new();
        let note = NoteId::new();

        let mgr = UpdateManager::new(&fs, &clock, &sd, instance.clone(), &cfg);
        mgr.write_update(DocumentRef::Note(note), b"x").unwrap();
        mgr.write_update(DocumentRef::FolderTree, b"y").unwrap();

        let stats = run_gc_for_sd(&fs, &clock, &sd, instance, &cfg);
        assert!(stats.errors.is_empty());
    }
}
