//! Filename grammar for update / pack / snapshot files.
//!
//! `InstanceId` is usually a UUID but a command-line override for test
//! harnesses is allowed, so the grammar does not assume the instance-id
//! component is underscore-free. Parsing always splits from the side
//! where the format is unambiguous (the numeric suffix) rather than from
//! the left, so an instance id like `test_instance_a` round-trips.

use std::fmt;

use crate::error::CoreError;
use crate::ids::InstanceId;

/// `.yjson` is the extension for every file in the update/pack/snapshot
/// family.
pub const EXTENSION: &str = "yjson";

/// Parsed name of an update file: `<instanceId>_<timestampMs>-<seq>.yjson`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateName {
    /// Writer of this update.
    pub instance: InstanceId,
    /// Wall-clock timestamp embedded at write time (a hint, not a truth).
    pub timestamp_ms: i64,
    /// Per-(instance, document) monotonic sequence number.
    pub seq: u64,
}

impl fmt::Display for UpdateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}-{}.{EXTENSION}",
            self.instance, self.timestamp_ms, self.seq
        )
    }
}

impl UpdateName {
    /// Parse a bare filename (no directory components).
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        let stem = strip_extension(name)?;
        // Pack and snapshot names are also `_`-delimited; reject them
        // explicitly before attempting the update grammar.
        if stem.starts_with("snapshot_") || stem.contains("_pack_") {
            return Err(bad(name));
        }
        let mut parts = stem.rsplitn(2, '_');
        let seq_part = parts.next().ok_or_else(|| bad(name))?;
        let instance_part = parts.next().ok_or_else(|| bad(name))?;

        let (ts_str, seq_str) = seq_part.split_once('-').ok_or_else(|| bad(name))?;
        let timestamp_ms: i64 = ts_str.parse().map_err(|_| bad(name))?;
        let seq: u64 = seq_str.parse().map_err(|_| bad(name))?;
        let instance: InstanceId = instance_part.parse().map_err(|_| bad(name))?;

        Ok(Self {
            instance,
            timestamp_ms,
            seq,
        })
    }
}

/// Parsed name of a pack file: `<instanceId>_pack_<startSeq>-<endSeq>.yjson`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackName {
    /// Instance whose updates this pack batches. Packs only ever contain an
    /// instance's own updates.
    pub instance: InstanceId,
    /// First sequence in the contiguous range, inclusive.
    pub start_seq: u64,
    /// Last sequence in the contiguous range, inclusive.
    pub end_seq: u64,
}

impl fmt::Display for PackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_pack_{}-{}.{EXTENSION}",
            self.instance, self.start_seq, self.end_seq
        )
    }
}

impl PackName {
    /// Parse a bare filename.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        let stem = strip_extension(name)?;
        let idx = stem.rfind("_pack_").ok_or_else(|| bad(name))?;
        let instance_part = &stem[..idx];
        let range_part = &stem[idx + "_pack_".len()..];

        let (start_str, end_str) = range_part.split_once('-').ok_or_else(|| bad(name))?;
        let start_seq: u64 = start_str.parse().map_err(|_| bad(name))?;
        let end_seq: u64 = end_str.parse().map_err(|_| bad(name))?;
        if start_seq > end_seq {
            return Err(bad(name));
        }
        let instance: InstanceId = instance_part.parse().map_err(|_| bad(name))?;

        Ok(Self {
            instance,
            start_seq,
            end_seq,
        })
    }
}

/// Parsed name of a snapshot file: `snapshot_<totalChanges>_<instanceId>.yjson`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotName {
    /// Sum of the snapshot's vector clock.
    pub total_changes: u64,
    /// Instance that created this snapshot.
    pub creating_instance: InstanceId,
}

impl fmt::Display for SnapshotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "snapshot_{}_{}.{EXTENSION}",
            self.total_changes, self.creating_instance
        )
    }
}

impl SnapshotName {
    const PREFIX: &'static str = "snapshot_";

    /// Parse a bare filename.
    pub fn parse(name: &str) -> Result<Self, CoreError> {
        let stem = strip_extension(name)?;
        let rest = stem.strip_prefix(Self::PREFIX).ok_or_else(|| bad(name))?;
        let (total_str, instance_str) = rest.split_once('_').ok_or_else(|| bad(name))?;
        let total_changes: u64 = total_str.parse().map_err(|_| bad(name))?;
        let creating_instance: InstanceId = instance_str.parse().map_err(|_| bad(name))?;

        Ok(Self {
            total_changes,
            creating_instance,
        })
    }
}

fn strip_extension(name: &str) -> Result<&str, CoreError> {
    name.strip_suffix(&format!(".{EXTENSION}")).ok_or_else(|| bad(name))
}

fn bad(name: &str) -> CoreError {
    CoreError::BadFilename(name.to_string())
}
