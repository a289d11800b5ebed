//! Runtime configuration for the storage core.
//!
//! Every tunable lives on [`CoreConfig`], with a `Default` impl that
//! reproduces the documented defaults exactly. Construction is primarily
//! programmatic (this is a library, not a CLI) but the type is
//! `serde`-capable so an embedding application may persist it as TOML
//! alongside its own settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Edit-rate-adaptive snapshot thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotThresholds {
    /// Minimum new updates to force a snapshot under very-high edit rate.
    pub very_high: u32,
    /// ...under high edit rate.
    pub high: u32,
    /// ...under medium edit rate.
    pub medium: u32,
    /// ...under low edit rate.
    pub low: u32,
    /// Minimum updates required to force a snapshot after `idle_force_after`
    /// of inactivity, regardless of edit rate.
    pub idle_force: u32,
    /// Idle duration after which `idle_force` applies.
    #[serde(with = "duration_secs")]
    pub idle_force_after: Duration,
}

impl Default for SnapshotThresholds {
    fn default() -> Self {
        Self {
            very_high: 50,
            high: 100,
            medium: 200,
            low: 500,
            idle_force: 50,
            idle_force_after: Duration::from_secs(30 * 60),
        }
    }
}

/// All tunables this crate exposes, with their documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Edit-rate → minimum-updates-before-snapshot table.
    pub snapshot_thresholds: SnapshotThresholds,

    /// Background pack cadence. Default 5 minutes.
    #[serde(with = "duration_secs")]
    pub pack_interval: Duration,

    /// Updates to leave unpacked per instance even if they're old enough to
    /// pack. Default 50.
    pub pack_keep_recent: usize,

    /// Minimum contiguous updates required to form a pack. Default 10.
    pub pack_min_size: usize,

    /// Freshness window: only pack updates older than this. Default 5 min.
    #[serde(with = "duration_secs")]
    pub pack_freshness_window: Duration,

    /// GC cadence. Default 30 minutes.
    #[serde(with = "duration_secs")]
    pub gc_interval: Duration,

    /// Number of most-recent snapshots (by `totalChanges`) to retain.
    /// Default 3.
    pub gc_snapshot_retention: usize,

    /// Minimum age before a snapshot/pack/update is eligible for deletion.
    /// Default 24h.
    #[serde(with = "duration_secs")]
    pub gc_min_history: Duration,

    /// Activity log compaction threshold (entry count). Default 1000.
    pub activity_log_max_entries: usize,

    /// Fast-path cumulative retry budget before handing off to the polling
    /// group. Default 60000ms.
    #[serde(with = "duration_millis")]
    pub poll_fast_path_max: Duration,

    /// Fast-path retry delay schedule, in order.
    pub poll_fast_path_delays_ms: Vec<u64>,

    /// Tier-2 polling group base rate, polls per minute. Default 120.
    pub poll_rate_per_min: u32,

    /// Tier-2 max burst, polls per second. Default 10.
    pub poll_max_burst_per_sec: u32,

    /// Fraction of Tier-2 capacity reserved for background/low-priority
    /// polling. Default 0.2 (20%).
    pub poll_background_reserve: f64,

    /// Safety-net full-repoll cadence; 0 disables. Default 30 minutes.
    #[serde(with = "duration_secs")]
    pub poll_full_repoll_interval: Duration,

    /// Window since last local edit during which a note stays enqueued
    /// under the `recent-edit` exit criterion. Default 5 minutes.
    #[serde(with = "duration_secs")]
    pub poll_recent_edit_window: Duration,

    /// Delay after system-resume before the wake-discovery disk scan runs,
    /// to let cloud sync catch up. Default 5000ms.
    #[serde(with = "duration_millis")]
    pub wake_discovery_delay: Duration,

    /// Days before terminal `note_moves` rows are purged by the daily
    /// maintenance pass. Default 30.
    pub move_record_retention_days: u32,

    /// Cadence of the daily maintenance pass that purges terminal
    /// `note_moves` rows older than `move_record_retention_days`. Default
    /// 24 hours.
    #[serde(with = "duration_secs")]
    pub move_purge_interval: Duration,

    /// Age past which a non-terminal move with a foreign `initiatedBy` is
    /// surfaced as "stuck". Default 5 minutes.
    #[serde(with = "duration_secs")]
    pub stuck_move_age: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            snapshot_thresholds: SnapshotThresholds::default(),
            pack_interval: Duration::from_secs(5 * 60),
            pack_keep_recent: 50,
            pack_min_size: 10,
            pack_freshness_window: Duration::from_secs(5 * 60),
            gc_interval: Duration::from_secs(30 * 60),
            gc_snapshot_retention: 3,
            gc_min_history: Duration::from_secs(24 * 60 * 60),
            activity_log_max_entries: 1000,
            poll_fast_path_max: Duration::from_millis(60_000),
            poll_fast_path_delays_ms: vec![
                100, 200, 500, 1_000, 2_000, 3_000, 5_000, 7_000, 10_000, 15_000, 30_000,
            ],
            poll_rate_per_min: 120,
            poll_max_burst_per_sec: 10,
            poll_background_reserve: 0.2,
            poll_full_repoll_interval: Duration::from_secs(30 * 60),
            poll_recent_edit_window: Duration::from_secs(5 * 60),
            wake_discovery_delay: Duration::from_millis(5_000),
            move_record_retention_days: 30,
            move_purge_interval: Duration::from_secs(24 * 60 * 60),
            stuck_move_age: Duration::from_secs(5 * 60),
        }
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod duration_millis {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
