//! A single Storage Directory's on-disk layout.
//!
//! ```text
//! {sd-root}/
//!   SD_ID
//!   notes/{noteId}/{snapshots,packs,updates}/
//!   folders/{snapshots,packs,updates}/
//!   activity/{instanceId}.log
//!   deleted/{instanceId}.log
//!   .moving-{noteId}/
//! ```
//!
//! [`StorageDir`] is the handle application code holds for one such tree,
//! generalized to the multi-document, multi-instance layout above.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::fs::FileSystem;
use crate::ids::{FolderId, NoteId, SdUuid};

/// One CRDT document's identity within an SD: either a specific note, or
/// the single per-SD folder-tree document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentRef {
    /// A note's CRDT document, identified by note id.
    Note(NoteId),
    /// The one folder-tree document for this SD.
    FolderTree,
}

impl DocumentRef {
    /// A stable string key for this document, suitable for use as a cache
    /// key or log field (not a filesystem path).
    pub fn key(&self) -> String {
        match self {
            DocumentRef::Note(id) => id.to_string(),
            DocumentRef::FolderTree => "folders".to_string(),
        }
    }
}

/// Root of one Storage Directory, plus accessors for every subtree in its
/// on-disk layout.
#[derive(Debug, Clone)]
pub struct StorageDir {
    root: PathBuf,
}

impl StorageDir {
    /// Wrap an existing (or not-yet-created) SD root path. Does not touch
    /// the filesystem; call [`Self::ensure_sd_uuid`] to materialize
    /// `SD_ID`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The SD's root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the `SD_ID` marker file.
    pub fn sd_id_path(&self) -> PathBuf {
        self.root.join("SD_ID")
    }

    /// Read, or create and adopt, this SD's stable [`SdUuid`].
    ///
    /// If `SD_ID` is missing, this instance generates a fresh UUID and
    /// writes it. Because two instances can race to do this on a
    /// freshly-shared SD, after writing we read the file back: if another
    /// instance won the race and its UUID differs from ours, we adopt the
    /// winner's UUID rather than the one we just wrote.
    pub fn ensure_sd_uuid(&self, fs: &dyn FileSystem) -> Result<SdUuid> {
        let path = self.sd_id_path();
        if let Ok(existing) = fs.read_to_string(&path) {
            let trimmed = existing.trim();
            if let Ok(uuid) = trimmed.parse::<SdUuid>() {
                return Ok(uuid);
            }
        }

        let candidate = SdUuid::new();
        fs.write_binary(&path, candidate.to_string().as_bytes())
            .map_err(|e| CoreError::FileWrite {
                path: path.clone(),
                source: e,
            })?;

        // Read back to detect a concurrent writer that won the race.
        let readback = fs.read_to_string(&path).map_err(|e| CoreError::FileRead {
            path: path.clone(),
            source: e,
        })?;
        readback
            .trim()
            .parse::<SdUuid>()
            .map_err(|_| CoreError::CorruptFile {
                path,
                reason: "SD_ID does not contain a valid UUID".to_string(),
            })
    }

    /// `notes/` root.
    pub fn notes_dir(&self) -> PathBuf {
        self.root.join("notes")
    }

    /// `notes/{noteId}/`.
    pub fn note_dir(&self, note: NoteId) -> PathBuf {
        self.notes_dir().join(note.to_string())
    }

    /// `folders/`, the single folder-tree document's root.
    pub fn folders_dir(&self) -> PathBuf {
        self.root.join("folders")
    }

    /// The document subtree root for `doc` (a note's `notes/{id}/`, or the
    /// shared `folders/`).
    pub fn document_dir(&self, doc: DocumentRef) -> PathBuf {
        match doc {
            DocumentRef::Note(id) => self.note_dir(id),
            DocumentRef::FolderTree => self.folders_dir(),
        }
    }

    /// `.../updates/` for a document.
    pub fn updates_dir(&self, doc: DocumentRef) -> PathBuf {
        self.document_dir(doc).join("updates")
    }

    /// `.../packs/` for a document.
    pub fn packs_dir(&self, doc: DocumentRef) -> PathBuf {
        self.document_dir(doc).join("packs")
    }

    /// `.../snapshots/` for a document.
    pub fn snapshots_dir(&self, doc: DocumentRef) -> PathBuf {
        self.document_dir(doc).join("snapshots")
    }

    /// `activity/` root.
    pub fn activity_dir(&self) -> PathBuf {
        self.root.join("activity")
    }

    /// `activity/{instanceId}.log`.
    pub fn activity_log_path(&self, instance: &crate::ids::InstanceId) -> PathBuf {
        self.activity_dir().join(format!("{instance}.log"))
    }

    /// `deleted/` root.
    pub fn deleted_dir(&self) -> PathBuf {
        self.root.join("deleted")
    }

    /// `deleted/{instanceId}.log`.
    pub fn deletion_log_path(&self, instance: &crate::ids::InstanceId) -> PathBuf {
        self.deleted_dir().join(format!("{instance}.log"))
    }

    /// `.moving-{noteId}/`, the scratch directory used by the cross-SD
    /// move state machine's `copying` step. Dot-prefixed so
    /// every other subsystem (wake discovery, GC, ActivitySync) ignores it.
    pub fn moving_scratch_dir(&self, note: NoteId) -> PathBuf {
        self.root.join(format!(".moving-{note}"))
    }

    /// List all `noteId`s that currently have a `notes/{id}/` directory
    /// on disk, used by wake discovery and GC.
    pub fn list_note_ids(&self, fs: &dyn FileSystem) -> Result<Vec<NoteId>> {
        let entries = fs.list_dir(&self.notes_dir()).map_err(|e| CoreError::FileRead {
            path: self.notes_dir(),
            source: e,
        })?;
        Ok(entries
            .into_iter()
            .filter(|p| fs.is_dir(p))
            .filter_map(|p| p.file_name()?.to_str()?.parse::<NoteId>().ok())
            .collect())
    }
}

/// Folders within the folder-tree document are distinguished by
/// [`FolderId`], not by filesystem path — the folder tree is itself one
/// CRDT document's content, not a directory structure.
/// This marker exists so call sites that need "a folder id" don't have to
/// reach into `cache` for the type.
pub type FolderRef = FolderId;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFileSystem;

    #[test]
    fn ensure_sd_uuid_creates_and_persists() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let uuid = sd.ensure_sd_uuid(&fs).unwrap();
        let again = sd.ensure_sd_uuid(&fs).unwrap();
        assert_eq!(uuid, again);
    }

    #[test]
    fn ensure_sd_uuid_adopts_existing_value() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let preexisting = SdUuid::new();
        fs.write_binary(&sd.sd_id_path(), preexisting.to_string().as_bytes())
            .unwrap();
        let read = sd.ensure_sd_uuid(&fs).unwrap();
        assert_eq!(read, preexisting);
    }

    #[test]
    fn document_dir_distinguishes_notes_from_folder_tree() {
        let sd = StorageDir::new("/sd");
        let note = NoteId::new();
        assert_ne!(
            sd.document_dir(DocumentRef::Note(note)),
            sd.document_dir(DocumentRef::FolderTree)
        );
        assert_eq!(sd.document_dir(DocumentRef::FolderTree), PathBuf::from("/sd/folders"));
    }

    #[test]
    fn list_note_ids_reflects_disk_state() {
        let fs = InMemoryFileSystem::new();
        let sd = StorageDir::new("/sd");
        let note = NoteId::new();
        fs.create_dir_all(&sd.note_dir(note)).unwrap();
        let ids = sd.list_note_ids(&fs).unwrap();
        assert_eq!(ids, vec![note]);
    }
}
