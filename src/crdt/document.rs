//! Opaque per-document CRDT wrapper.
//!
//! The storage core treats a document as a black box: "encode full state",
//! "encode diff against a state-vector", "apply update", "merge two
//! states". [`YrsDocument`] realizes that contract on top of `yrs`, wrapping
//! a `Y.Doc`-equivalent and also carrying the `deleted` flag used by
//! soft-delete, exposing merge/diff as the primitives `UpdateManager`
//! composes rather than a body-specific API.

use std::sync::Mutex;

use yrs::{
    Doc, GetString, Map, ReadTxn, StateVector, Text, Transact, Update,
    updates::decoder::Decode,
    updates::encoder::Encode,
};

use crate::error::{CoreError, Result};

const TEXT_NAME: &str = "text";
const META_MAP_NAME: &str = "meta";
const DELETED_KEY: &str = "deleted";

/// Operations any backing CRDT implementation must provide: a real
/// `yrs`-backed implementation or an in-memory test double may be
/// substituted behind this trait.
pub trait CrdtDocument: Send + Sync {
    /// Encode this document's full current state (used when no snapshot
    /// exists, or to build a new one).
    fn encode_state(&self) -> Vec<u8>;

    /// Encode this document's state vector (per-client clock), used to ask
    /// "what have you not seen yet".
    fn encode_state_vector(&self) -> Vec<u8>;

    /// Encode the diff between this document's state and a remote state
    /// vector: the minimal update a peer holding that state vector needs.
    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>>;

    /// Apply a remote update (or a full encoded state — `yrs` accepts
    /// either as an "update" blob) to this document. Merges are
    /// commutative, associative, and idempotent.
    fn apply_update(&self, update: &[u8]) -> Result<()>;

    /// The document's plain-text projection (used by `extract.rs` for
    /// title/tag/preview extraction).
    fn text(&self) -> String;

    /// Replace the text content with minimal insert/delete ops so
    /// unaffected regions keep their CRDT identity (required for correct
    /// merging across concurrent editors of the same document).
    fn set_text(&self, content: &str) -> Result<()>;

    /// Has the `deleted` flag been merged into this document?
    fn is_deleted(&self) -> bool;

    /// Merge the soft-delete flag into the document.
    fn set_deleted(&self, deleted: bool) -> Result<()>;

    /// Read an arbitrary string-valued entry from the document's metadata
    /// map. Used by the folder-tree document to store note/folder
    /// assignments as `{noteOrFolderId: parentFolderId}` pairs, generalizing the same map `is_deleted`/`set_deleted` use for
    /// the `deleted` key.
    fn get_meta(&self, key: &str) -> Option<String>;

    /// Merge a string-valued entry into the document's metadata map.
    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

/// `yrs`-backed `CrdtDocument`. One `NoteId` or `FolderId` document is one
/// `YrsDocument` — or, for the folder-tree document, the one-per-SD
/// document named `folders`.
pub struct YrsDocument {
    doc: Doc,
    // yrs's `TextRef`/`MapRef` aren't `Send`, so the whole `Doc` graph
    // lives behind a mutex; txns are always short-lived.
    inner: Mutex<Inner>,
}

struct Inner {
    text: yrs::TextRef,
    meta: yrs::MapRef,
}

impl YrsDocument {
    /// A fresh, empty document.
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(TEXT_NAME);
        let meta = doc.get_or_insert_map(META_MAP_NAME);
        Self {
            doc,
            inner: Mutex::new(Inner { text, meta }),
        }
    }

    /// Rebuild a document from a previously encoded full state (as written
    /// into a [`crate::filename::SnapshotName`] file's `documentState`, or
    /// loaded from the in-memory representation during `readComposedState`).
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let doc = Self::new();
        if !state.is_empty() {
            doc.apply_update(state)?;
        }
        Ok(doc)
    }
}

impl Default for YrsDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDocument for YrsDocument {
    fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| CoreError::Crdt(format!("bad state vector: {e}")))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    fn apply_update(&self, update: &[u8]) -> Result<()> {
        let update =
            Update::decode_v1(update).map_err(|e| CoreError::Crdt(format!("bad update: {e}")))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| CoreError::Crdt(format!("apply_update failed: {e}")))
    }

    fn text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        let txn = self.doc.transact();
        inner.text.get_string(&txn)
    }

    fn set_text(&self, content: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let current = {
            let txn = self.doc.transact();
            inner.text.get_string(&txn)
        };
        if current == content {
            return Ok(());
        }

        let current_chars: Vec<char> = current.chars().collect();
        let new_chars: Vec<char> = content.chars().collect();

        let common_prefix = current_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let remaining_current = current_chars.len() - common_prefix;
        let remaining_new = new_chars.len() - common_prefix;
        let common_suffix = current_chars[common_prefix..]
            .iter()
            .rev()
            .zip(new_chars[common_prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .take(remaining_current.min(remaining_new))
            .count();

        let delete_start = common_prefix;
        let delete_end = current_chars.len() - common_suffix;
        let insert_start = common_prefix;
        let insert_end = new_chars.len() - common_suffix;

        let mut txn = self.doc.transact_mut();
        if delete_end > delete_start {
            inner
                .text
                .remove_range(&mut txn, delete_start as u32, (delete_end - delete_start) as u32);
        }
        if insert_end > insert_start {
            let insertion: String = new_chars[insert_start..insert_end].iter().collect();
            inner.text.insert(&mut txn, insert_start as u32, &insertion);
        }
        Ok(())
    }

    fn is_deleted(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        let txn = self.doc.transact();
        inner
            .meta
            .get(&txn, DELETED_KEY)
            .and_then(|v| v.cast::<bool>().ok())
            .unwrap_or(false)
    }

    fn set_deleted(&self, deleted: bool) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut txn = self.doc.transact_mut();
        inner.meta.insert(&mut txn, DELETED_KEY, deleted);
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let txn = self.doc.transact();
        inner.meta.get(&txn, key).and_then(|v| v.cast::<String>().ok())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let mut txn = self.doc.transact_mut();
        inner.meta.insert(&mut txn, key, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_and_apply_round_trip() {
        let doc = YrsDocument::new();
        doc.set_text("hello world").unwrap();
        let state = doc.encode_state();

        let restored = YrsDocument::from_state(&state).unwrap();
        assert_eq!(restored.text(), "hello world");
    }

    #[test]
    fn diff_against_state_vector_is_smaller_than_full_state() {
        let doc = YrsDocument::new();
        doc.set_text("first").unwrap();
        let sv = doc.encode_state_vector();
        doc.set_text("first second").unwrap();
        let diff = doc.encode_diff(&sv).unwrap();
        let full = doc.encode_state();
        assert!(diff.len() <= full.len());
    }

    #[test]
    fn merge_is_commutative() {
        let a = YrsDocument::new();
        a.set_text("from a").unwrap();
        let b = YrsDocument::new();
        b.set_text("from b ").unwrap();

        let merged1 = YrsDocument::new();
        merged1.apply_update(&a.encode_state()).unwrap();
        merged1.apply_update(&b.encode_state()).unwrap();

        let merged2 = YrsDocument::new();
        merged2.apply_update(&b.encode_state()).unwrap();
        merged2.apply_update(&a.encode_state()).unwrap();

        assert_eq!(merged1.encode_state_vector(), merged2.encode_state_vector());
    }

    #[test]
    fn applying_same_diff_twice_is_idempotent() {
        let doc = YrsDocument::new();
        doc.set_text("hi").unwrap();
        let state = doc.encode_state();

        let target = YrsDocument::new();
        target.apply_update(&state).unwrap();
        target.apply_update(&state).unwrap();
        assert_eq!(target.text(), "hi");
    }

    #[test]
    fn deleted_flag_merges_like_any_other_field() {
        let doc = YrsDocument::new();
        assert!(!doc.is_deleted());
        doc.set_deleted(true).unwrap();
        assert!(doc.is_deleted());
    }

    #[test]
    fn meta_entries_round_trip() {
        let doc = YrsDocument::new();
        assert_eq!(doc.get_meta("folder-for-note-1"), None);
        doc.set_meta("folder-for-note-1", "folder-a").unwrap();
        assert_eq!(doc.get_meta("folder-for-note-1"), Some("folder-a".to_string()));
    }
}
