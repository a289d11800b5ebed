//! Unified error type for the storage core.
//!
//! Lower layers never format user-facing strings; they return one of these
//! typed variants and the embedding application localizes/displays them.

use std::path::PathBuf;

use thiserror::Error;

use crate::ids::InstanceId;

/// Errors raised by the storage core.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wrapped `std::io::Error` for I/O failures not otherwise categorized.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to read a specific file.
    #[error("failed to read '{path}': {source}")]
    FileRead {
        /// Path that failed to be read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to write a specific file.
    #[error("failed to write '{path}': {source}")]
    FileWrite {
        /// Path that failed to be written.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Flag byte is `0x00`: the file is mid-write. Not fatal — schedule a
    /// retry.
    #[error("'{path}' is not yet fully written (flag byte is 0x00)")]
    PartialFile {
        /// Path of the partially-written file.
        path: PathBuf,
    },

    /// Flag byte is neither `0x00` nor `0x01`, the filename failed to
    /// parse, or the payload failed to decode. The loader should skip this
    /// file and fall back to the next-best candidate.
    #[error("'{path}' is corrupt: {reason}")]
    CorruptFile {
        /// Path of the corrupt file.
        path: PathBuf,
        /// Human-readable (but not user-facing) description of the defect.
        reason: String,
    },

    /// `readComposedState` was asked to load from a snapshot but none
    /// exists or none were loadable.
    #[error("no loadable snapshot for document '{0}'")]
    MissingSnapshot(String),

    /// During pack or snapshot creation, a contiguous prefix from
    /// `instance` cannot be advanced past `missing_seq` because that
    /// sequence number was never observed. Not fatal: the pack stops short
    /// of the gap and the snapshot clock stops at `missing_seq - 1`.
    #[error("sequence gap for instance {instance}: seq {missing_seq} missing")]
    SequenceGap {
        /// Instance whose sequence has a gap.
        instance: InstanceId,
        /// The first missing sequence number.
        missing_seq: u64,
    },

    /// A Storage Directory previously known to this instance no longer
    /// resolves (e.g. the cloud-sync mount was ejected). Background jobs
    /// for that SD pause until it reappears.
    #[error("storage directory unavailable: {0}")]
    StorageUnavailable(PathBuf),

    /// Cross-SD move found an active note with the same id already present
    /// on the target SD. Propagated to the UI for conflict resolution.
    #[error("note '{note_id}' already exists as an active note on the target storage directory")]
    MoveConflict {
        /// The note id in conflict.
        note_id: String,
    },

    /// Storage device reports no space left.
    #[error("storage quota exceeded writing '{0}'")]
    QuotaExceeded(PathBuf),

    /// Storage device denies the write.
    #[error("permission denied writing '{0}'")]
    PermissionDenied(PathBuf),

    /// The local SQL cache could not be migrated to the current schema
    /// version and user-data tables (tags, note_tags, app_state) could not
    /// be preserved. This is the one fatal condition in the core: the
    /// caller should treat `CoreContext::open` failing with this variant
    /// as unrecoverable.
    #[error("cache migration failed: {0}")]
    CacheMigrationFailed(String),

    /// A CRDT encode/decode/merge operation failed at the `yrs` layer.
    #[error("CRDT error: {0}")]
    Crdt(String),

    /// The local SQL cache returned an error.
    #[error("cache error: {0}")]
    Rusqlite(#[from] rusqlite::Error),

    /// A move state machine transition was attempted that is not in the
    /// permitted transition table. Indicates a core bug,
    /// not a recoverable condition.
    #[error("invalid move transition: {from:?} -> {to:?}")]
    InvalidMoveTransition {
        /// State the move record was in.
        from: String,
        /// State the caller tried to transition to.
        to: String,
    },

    /// A filename did not match the update/pack/snapshot grammar.
    #[error("unparseable filename '{0}'")]
    BadFilename(String),
}

/// Result alias for storage-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
