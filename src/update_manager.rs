//! Per-(SD, document) update/pack/snapshot lifecycle.
//!
//! `UpdateManager` is the one type that actually lays out the file tree
//! under a storage directory: it writes updates, composes them (with packs
//! and snapshots) back into a document, and produces new packs/snapshots
//! on the cadences configured in [`crate::config::CoreConfig`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::atomic::{self, FlaggedRead};
use crate::clock::VectorClock;
use crate::clock_source::Clock;
use crate::config::CoreConfig;
use crate::crdt::{CrdtDocument, YrsDocument};
use crate::error::{CoreError, Result};
use crate::filename::{PackName, SnapshotName, UpdateName};
use crate::fs::FileSystem;
use crate::ids::InstanceId;
use crate::sd::{DocumentRef, StorageDir};

#[derive(Serialize, Deserialize)]
pub(crate) struct PackEntryWire {
    pub(crate) seq: u64,
    pub(crate) timestamp: i64,
    pub(crate) data: String,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct PackWire {
    pub(crate) entries: Vec<PackEntryWire>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotWire {
    version: u32,
    timestamp: i64,
    total_changes: u64,
    document_state: String,
    max_sequences: BTreeMap<String, u64>,
}

/// One decoded update, pack, or snapshot entry's contribution of
/// `(instance, seq, payload)` triples, in the order `readComposedState`
/// needs to apply them.
struct Entry {
    instance: InstanceId,
    seq: u64,
    payload: Vec<u8>,
}

/// Coarse recent edit-rate bucket a document falls into, used to pick which
/// column of `SnapshotThresholds` applies. Measured by the caller (`context`
/// tracks a trailing window of edit timestamps per document) rather than
/// here, since `UpdateManager` itself is stateless and rebuilt per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditRate {
    VeryHigh,
    High,
    Medium,
    Low,
}

/// Classify a trailing edits-per-minute rate into an [`EditRate`] bucket.
/// The cutoffs aren't named anywhere as a fixed table; chosen so that
/// "very high" means rapid-fire typing/paste bursts, "low" means
/// occasional single edits, with "high"/"medium" spanning normal typing.
pub fn classify_edit_rate(edits_per_min: f64) -> EditRate {
    if edits_per_min >= 20.0 {
        EditRate::VeryHigh
    } else if edits_per_min >= 8.0 {
        EditRate::High
    } else if edits_per_min >= 2.0 {
        EditRate::Medium
    } else {
        EditRate::Low
    }
}

/// Everything `maybeCreateSnapshot` needs to decide whether to fire.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotDecisionInput {
    /// Updates written since the last snapshot for this document.
    pub updates_since_snapshot: u32,
    /// Milliseconds since the last update was written to this document.
    pub idle_ms: i64,
    /// This document's current edit-rate bucket, selecting which
    /// `SnapshotThresholds` column applies.
    pub edit_rate: EditRate,
}

/// Result of composing a document's current state.
pub struct Composed {
    /// The merged document.
    pub document: YrsDocument,
    /// Highest *contiguous* sequence absorbed per instance — stops at the
    /// first gap, even if higher-seq files exist.
    pub clock: VectorClock,
}

/// Per-(SD, document) update/pack/snapshot manager.
pub struct UpdateManager<'a> {
    fs: &'a dyn FileSystem,
    clock_source: &'a dyn Clock,
    sd: &'a StorageDir,
    instance: InstanceId,
    config: &'a CoreConfig,
}

impl<'a> UpdateManager<'a> {
    /// Build a manager bound to one SD and this process's instance id.
    pub fn new(
        fs: &'a dyn FileSystem,
        clock_source: &'a dyn Clock,
        sd: &'a StorageDir,
        instance: InstanceId,
        config: &'a CoreConfig,
    ) -> Self {
        Self {
            fs,
            clock_source,
            sd,
            instance,
            config,
        }
    }

    /// The filesystem this manager reads and writes through (used by GC to
    /// delete files it has decided are redundant).
    pub(crate) fn fs(&self) -> &'a dyn FileSystem {
        self.fs
    }

    /// The SD this manager is bound to.
    pub(crate) fn sd(&self) -> &'a StorageDir {
        self.sd
    }

    /// Current wall-clock time per this manager's [`Clock`] source.
    pub(crate) fn now_ms(&self) -> i64 {
        self.clock_source.now_ms()
    }

    /// List `updates/`, parsing filenames (used by GC to find deletable
    /// update files by `(instance, seq, timestamp)`).
    pub(crate) fn list_updates_pub(&self, doc: DocumentRef) -> Result<Vec<(UpdateName, PathBuf)>> {
        self.list_updates(doc)
    }

    /// List `packs/`, parsing filenames (used by GC).
    pub(crate) fn list_packs_pub(&self, doc: DocumentRef) -> Result<Vec<(PackName, PathBuf)>> {
        self.list_packs(doc)
    }

    /// List `snapshots/` with decoded clocks (used by GC to find the
    /// retained set).
    pub(crate) fn list_snapshots_pub(
        &self,
        doc: DocumentRef,
    ) -> Result<Vec<(SnapshotName, DecodedSnapshot)>> {
        self.list_snapshots(doc)
    }

    /// Newest entry timestamp within a pack file, or `None` if it can't be
    /// read (treated by GC as "not yet eligible").
    pub(crate) fn pack_newest_timestamp(&self, path: &std::path::Path) -> Option<i64> {
        let FlaggedRead::Complete(payload) = atomic::read_flagged(self.fs, path).ok()? else {
            return None;
        };
        let wire: PackWire = serde_json::from_slice(&payload).ok()?;
        wire.entries.iter().map(|e| e.timestamp).max()
    }

    /// Next seq this instance should use for `doc`, recovered by scanning
    /// existing files.
    fn next_seq(&self, doc: DocumentRef) -> Result<u64> {
        let mut max_seq: Option<u64> = None;
        for (name, _) in self.list_updates(doc)? {
            if name.instance == self.instance {
                max_seq = Some(max_seq.map_or(name.seq, |m| m.max(name.seq)));
            }
        }
        for (name, _) in self.list_packs(doc)? {
            if name.instance == self.instance {
                max_seq = Some(max_seq.map_or(name.end_seq, |m| m.max(name.end_seq)));
            }
        }
        for (name, snap) in self.list_snapshots(doc)? {
            let _ = name;
            if let Some(seq) = snap.max_sequences.get(&self.instance) {
                max_seq = Some(max_seq.map_or(*seq, |m| m.max(*seq)));
            }
        }
        Ok(max_seq.map_or(0, |m| m + 1))
    }

    /// Emit a new update file for `doc` containing `diff`, and append the
    /// corresponding activity-log line.
    ///
    /// Both writes form one logical operation, but the update write is the
    /// durable one: we write it first and only then append activity, so a
    /// crash between the two still leaves the update in place, relying on
    /// wake discovery to cover the missed notification.
    pub fn write_update(&self, doc: DocumentRef, diff: &[u8]) -> Result<u64> {
        let seq = self.next_seq(doc)?;
        let name = UpdateName {
            instance: self.instance.clone(),
            timestamp_ms: self.clock_source.now_ms(),
            seq,
        };
        let path = self.sd.updates_dir(doc).join(name.to_string());
        atomic::write_flagged(self.fs, &path, diff)?;

        let activity_path = self.sd.activity_log_path(&self.instance);
        let line = format!("{}|{}_{}", doc.key(), self.instance, seq);
        atomic::append_line(self.fs, &activity_path, &line)?;

        Ok(seq)
    }

    /// List `updates/`, parsing filenames; unparseable entries are skipped
    /// (treated as `CorruptFile` and ignored).
    fn list_updates(&self, doc: DocumentRef) -> Result<Vec<(UpdateName, PathBuf)>> {
        let dir = self.sd.updates_dir(doc);
        let entries = self.fs.list_dir(&dir).map_err(|e| CoreError::FileRead {
            path: dir,
            source: e,
        })?;
        Ok(entries
            .into_iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?;
                UpdateName::parse(name).ok().map(|n| (n, p))
            })
            .collect())
    }

    fn list_packs(&self, doc: DocumentRef) -> Result<Vec<(PackName, PathBuf)>> {
        let dir = self.sd.packs_dir(doc);
        let entries = self.fs.list_dir(&dir).map_err(|e| CoreError::FileRead {
            path: dir,
            source: e,
        })?;
        Ok(entries
            .into_iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?;
                PackName::parse(name).ok().map(|n| (n, p))
            })
            .collect())
    }

    fn list_snapshots(&self, doc: DocumentRef) -> Result<Vec<(SnapshotName, DecodedSnapshot)>> {
        let dir = self.sd.snapshots_dir(doc);
        let entries = self.fs.list_dir(&dir).map_err(|e| CoreError::FileRead {
            path: dir,
            source: e,
        })?;
        let mut out = Vec::new();
        for path in entries {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(parsed) = SnapshotName::parse(name) else {
                continue;
            };
            let Ok(FlaggedRead::Complete(payload)) = atomic::read_flagged(self.fs, &path) else {
                continue;
            };
            let Ok(wire) = serde_json::from_slice::<SnapshotWire>(&payload) else {
                continue;
            };
            let Ok(document_state) = BASE64.decode(&wire.document_state) else {
                continue;
            };
            let max_sequences: BTreeMap<InstanceId, u64> = wire
                .max_sequences
                .into_iter()
                .map(|(k, v)| (InstanceId::from_str_override(k), v))
                .collect();
            out.push((
                parsed,
                DecodedSnapshot {
                    timestamp: wire.timestamp,
                    total_changes: wire.total_changes,
                    document_state,
                    max_sequences,
                },
            ));
        }
        Ok(out)
    }

    /// Select the best loadable snapshot: highest `totalChanges`, tie-break
    /// on lexicographically smallest instance id.
    fn select_snapshot(&self, doc: DocumentRef) -> Result<Option<DecodedSnapshot>> {
        let mut candidates = self.list_snapshots(doc)?;
        candidates.sort_by(|(a_name, _), (b_name, _)| {
            b_name
                .total_changes
                .cmp(&a_name.total_changes)
                .then_with(|| a_name.creating_instance.cmp(&b_name.creating_instance))
        });
        Ok(candidates.into_iter().map(|(_, snap)| snap).next())
    }

    /// Compose the current document state for `doc`.
    pub fn read_composed_state(&self, doc: DocumentRef) -> Result<Composed> {
        let snapshot = self.select_snapshot(doc)?;
        let (document, base_clock) = match snapshot {
            Some(snap) => (
                YrsDocument::from_state(&snap.document_state)?,
                VectorClock::from_pairs(snap.max_sequences.iter().map(|(k, v)| (k.clone(), *v))),
            ),
            None => (YrsDocument::new(), VectorClock::new()),
        };

        // Gather pack + update entries newer than the snapshot baseline,
        // in (instance, seq) order, and apply them all to the document —
        // CRDT merges are commutative/idempotent, so gaps don't block
        // composing the document itself.
        let mut entries: Vec<Entry> = Vec::new();

        for (name, path) in self.list_packs(doc)? {
            if name.end_seq <= base_clock.get(&name.instance).unwrap_or(0) {
                continue;
            }
            let Ok(FlaggedRead::Complete(payload)) = atomic::read_flagged(self.fs, &path) else {
                continue;
            };
            let Ok(wire) = serde_json::from_slice::<PackWire>(&payload) else {
                continue;
            };
            let floor = base_clock.get(&name.instance).unwrap_or(0);
            for entry in wire.entries {
                if entry.seq <= floor {
                    continue;
                }
                let Ok(data) = BASE64.decode(&entry.data) else {
                    continue;
                };
                entries.push(Entry {
                    instance: name.instance.clone(),
                    seq: entry.seq,
                    payload: data,
                });
            }
        }

        for (name, path) in self.list_updates(doc)? {
            if name.seq <= base_clock.get(&name.instance).unwrap_or(0) {
                continue;
            }
            let Ok(FlaggedRead::Complete(payload)) = atomic::read_flagged(self.fs, &path) else {
                continue;
            };
            entries.push(Entry {
                instance: name.instance,
                seq: name.seq,
                payload,
            });
        }

        entries.sort_by(|a, b| a.instance.cmp(&b.instance).then(a.seq.cmp(&b.seq)));

        let mut final_clock = base_clock.clone();
        let mut next_expected: BTreeMap<InstanceId, u64> = BTreeMap::new();
        for (instance, seq) in base_clock.iter() {
            next_expected.insert(instance, seq + 1);
        }

        for entry in &entries {
            document.apply_update(&entry.payload)?;

            let expected = next_expected.entry(entry.instance.clone()).or_insert(0);
            if entry.seq == *expected {
                final_clock.advance(entry.instance.clone(), entry.seq);
                *expected = entry.seq + 1;
            }
            // seq < expected would be a duplicate of an already-contiguous
            // prefix (harmless, CRDT idempotence handles it); seq > expected
            // is a gap and must not advance the clock.
        }

        Ok(Composed {
            document,
            clock: final_clock,
        })
    }

    /// Decide whether `maybeCreateSnapshot` should fire for the given
    /// edit-rate inputs.
    pub fn should_snapshot(&self, input: SnapshotDecisionInput) -> bool {
        let t = &self.config.snapshot_thresholds;
        if input.updates_since_snapshot == 0 {
            return false;
        }
        if input.idle_ms >= t.idle_force_after.as_millis() as i64
            && input.updates_since_snapshot >= t.idle_force
        {
            return true;
        }
        let threshold = match input.edit_rate {
            EditRate::VeryHigh => t.very_high,
            EditRate::High => t.high,
            EditRate::Medium => t.medium,
            EditRate::Low => t.low,
        };
        input.updates_since_snapshot >= threshold
    }

    /// Build and write a new snapshot for `doc`.
    pub fn create_snapshot(&self, doc: DocumentRef) -> Result<()> {
        let composed = self.read_composed_state(doc)?;
        let total_changes = composed.clock.total_changes();
        let max_sequences: BTreeMap<String, u64> = composed
            .clock
            .iter()
            .map(|(inst, seq)| (inst.to_string(), seq))
            .collect();

        let wire = SnapshotWire {
            version: 1,
            timestamp: self.clock_source.now_ms(),
            total_changes,
            document_state: BASE64.encode(composed.document.encode_state()),
            max_sequences,
        };
        let payload = serde_json::to_vec(&wire)
            .map_err(|e| CoreError::Crdt(format!("snapshot encode failed: {e}")))?;

        let name = SnapshotName {
            total_changes,
            creating_instance: self.instance.clone(),
        };
        let path = self.sd.snapshots_dir(doc).join(name.to_string());
        atomic::write_flagged(self.fs, &path, &payload)
    }

    /// Pack this instance's own contiguous, old-enough update runs into
    /// pack files, then delete the now-redundant update files. Only ever
    /// touches files this instance wrote (`name.instance == self.instance`)
    /// — each instance packs only its own files.
    pub fn pack_updates(&self, doc: DocumentRef) -> Result<usize> {
        let now = self.clock_source.now_ms();
        let freshness_ms = self.config.pack_freshness_window.as_millis() as i64;

        let mut mine: Vec<(UpdateName, PathBuf)> = self
            .list_updates(doc)?
            .into_iter()
            .filter(|(n, _)| n.instance == self.instance)
            .collect();
        mine.sort_by_key(|(n, _)| n.seq);

        if mine.len() <= self.config.pack_keep_recent {
            return Ok(0);
        }
        // Leave the most recent `pack_keep_recent` entries unpacked.
        let packable_count = mine.len() - self.config.pack_keep_recent;
        let mut candidates = &mine[..packable_count];

        // Only pack a contiguous run, and only entries old enough.
        let mut contiguous_len = 1;
        while contiguous_len < candidates.len()
            && candidates[contiguous_len].0.seq == candidates[contiguous_len - 1].0.seq + 1
        {
            contiguous_len += 1;
        }
        candidates = &candidates[..contiguous_len];

        if candidates.len() < self.config.pack_min_size {
            return Ok(0);
        }
        let newest_ts = candidates.iter().map(|(n, _)| n.timestamp_ms).max().unwrap_or(0);
        if now - newest_ts < freshness_ms {
            return Ok(0);
        }

        let mut wire = PackWire { entries: Vec::new() };
        for (name, path) in candidates {
            let Ok(FlaggedRead::Complete(payload)) = atomic::read_flagged(self.fs, path) else {
                // A pack must be built from fully-visible files only; bail
                // out of this pack attempt rather than skip a hole in the
                // middle of the contiguous range.
                return Ok(0);
            };
            wire.entries.push(PackEntryWire {
                seq: name.seq,
                timestamp: name.timestamp_ms,
                data: BASE64.encode(payload),
            });
        }

        let start_seq = candidates.first().unwrap().0.seq;
        let end_seq = candidates.last().unwrap().0.seq;
        let pack_name = PackName {
            instance: self.instance.clone(),
            start_seq,
            end_seq,
        };
        let payload = serde_json::to_vec(&wire)
            .map_err(|e| CoreError::Crdt(format!("pack encode failed: {e}")))?;
        let path = self.sd.packs_dir(doc).join(pack_name.to_string());
        atomic::write_flagged(self.fs, &path, &payload)?;

        // Pack committed: its constituent updates are now redundant.
        for (_, path) in candidates {
            self.fs.remove_file(path).map_err(|e| CoreError::FileWrite {
                path: path.clone(),
                source: e,
            })?;
        }

        Ok(candidates.len())
    }
}

/// Outcome of one `pack_updates_for_sd` sweep.
#[derive(Debug, Default)]
pub struct PackSummary {
    /// Update files folded into packs across every document in the SD.
    pub packed: usize,
    /// Per-document failures, isolated so one bad document doesn't abort
    /// the rest of the sweep.
    pub errors: Vec<(DocumentRef, CoreError)>,
}

/// Pack this instance's own updates across every note and the folder tree
/// in one SD — the sweep the background scheduler runs on `pack_interval`.
pub fn pack_updates_for_sd(
    fs: &dyn FileSystem,
    clock_source: &dyn Clock,
    sd: &StorageDir,
    instance: InstanceId,
    config: &CoreConfig,
) -> Result<PackSummary> {
    let note_ids = sd.list_note_ids(fs)?;
    let mut docs: Vec<DocumentRef> = note_ids.into_iter().map(DocumentRef::Note).collect();
    docs.push(DocumentRef::FolderTree);

    let mut summary = PackSummary::default();
    for doc in docs {
        let mgr = UpdateManager::new(fs, clock_source, sd, instance.clone(), config);
        match mgr.pack_updates(doc) {
            Ok(n) => summary.packed += n,
            Err(e) => summary.errors.push((doc, e)),
        }
    }
    Ok(summary)
}

/// A snapshot file's decoded contents (instance ids kept as strings until
/// matched against a real [`InstanceId`] so a snapshot written by an
/// instance this process has never otherwise seen still parses).
pub(crate) struct DecodedSnapshot {
    pub(crate) timestamp: i64,
    pub(crate) total_changes: u64,
    pub(crate) document_state: Vec<u8>,
    pub(crate) max_sequences: BTreeMap<InstanceId, u64>,
}
