#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

/// Append-only per-instance activity log and ActivitySync.
pub mod activity;

/// Flag-byte atomic writes for files shared over cloud-sync folders.
pub mod atomic;

/// The derived local SQL cache.
pub mod cache;

/// Vector clocks tracking each writer instance's highest contiguous
/// sequence.
pub mod clock;

/// The `Clock` abstraction and its real/fixed implementations.
pub mod clock_source;

/// Runtime configuration and its documented defaults.
pub mod config;

/// `CoreContext`, the crate's public entry point.
pub mod context;

/// Opaque per-document CRDT state.
pub mod crdt;

/// Deletion log protocol and DeletionSync.
pub mod deletion;

/// Error types returned throughout the crate.
pub mod error;

/// Title/preview/tag extraction from a document's plain-text projection.
pub mod extract;

/// Filename grammar for update/pack/snapshot files.
pub mod filename;

/// Filesystem abstraction, with a real and an in-memory implementation.
pub mod fs;

/// Garbage collection of redundant snapshot/pack/update files.
pub mod gc;

/// Stable identifiers used throughout the storage core.
pub mod ids;

/// Crash-safe cross-SD move execution.
pub mod moves;

/// The two-tier change-notification system: fast path and polling group.
pub mod polling;

/// A background thread-based scheduler for pack/GC/repoll cadences,
/// for embedders that don't already have one.
#[cfg(feature = "native-scheduler")]
pub mod scheduler;

/// A single Storage Directory's on-disk layout.
pub mod sd;

/// Per-(SD, document) update/pack/snapshot management: `writeUpdate`,
/// `readComposedState`, `createSnapshot`, `packUpdates`.
pub mod update_manager;

/// Wake-from-sleep discovery.
pub mod wake;

pub use context::{CoreContext, DocumentHandle, RemoteUpdate};
pub use error::{CoreError, Result};
