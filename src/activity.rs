//! Activity log protocol and the fast-path (Tier 1) side of ActivitySync.
//!
//! Every emitted update gets one line, `<noteId>|<originatingInstance>_<seq>`,
//! appended to the writer's own `activity/{instance}.log`
//! (`UpdateManager::write_update` does the appending; this module owns the
//! line grammar, watermark tracking, compaction, and the fast-path retry
//! schedule that reacts to a newly observed line). Tier 2 (`PollingGroup`)
//! lives in `polling.rs`.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::CoreConfig;
use crate::error::{CoreError, Result};
use crate::fs::FileSystem;
use crate::ids::InstanceId;
use crate::sd::StorageDir;

/// One parsed activity-log line: "some instance wrote seq N for this
/// document".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEntry {
    /// Key of the document that changed ([`crate::sd::DocumentRef::key`]).
    pub doc_key: String,
    /// Instance that wrote the update.
    pub instance: InstanceId,
    /// Sequence number of the update.
    pub seq: u64,
}

/// Format one activity-log line (without trailing `\n` — the append
/// primitive in `atomic.rs` adds that).
pub fn format_line(doc_key: &str, instance: &InstanceId, seq: u64) -> String {
    format!("{doc_key}|{instance}_{seq}")
}

/// Parse one activity-log line: `<noteId>|<originatingInstanceId>_<seq>`.
/// Returns `None` for anything that doesn't match, including a trailing
/// partial line with no `_<seq>` suffix yet.
pub fn parse_line(line: &str) -> Option<ActivityEntry> {
    let (doc_key, rest) = line.split_once('|')?;
    let (instance_str, seq_str) = rest.rsplit_once('_')?;
    let seq: u64 = seq_str.parse().ok()?;
    if doc_key.is_empty() || instance_str.is_empty() {
        return None;
    }
    Some(ActivityEntry {
        doc_key: doc_key.to_string(),
        instance: InstanceId::from_str_override(instance_str),
        seq,
    })
}

/// Read every complete line of `instance`'s activity log on `sd`. A
/// trailing line with no final `\n` is dropped rather than parsed, since it
/// may be a partial in-flight write.
pub fn read_entries(
    fs: &dyn FileSystem,
    sd: &StorageDir,
    instance: &InstanceId,
) -> Result<Vec<ActivityEntry>> {
    let path = sd.activity_log_path(instance);
    if !fs.exists(&path) {
        return Ok(Vec::new());
    }
    let content = fs.read_to_string(&path).map_err(|e| CoreError::FileRead {
        path: path.clone(),
        source: e,
    })?;
    let complete = if content.ends_with('\n') {
        &content[..]
    } else {
        // Drop the trailing partial line: it has no newline yet.
        match content.rfind('\n') {
            Some(idx) => &content[..idx + 1],
            None => "",
        }
    };
    Ok(complete.lines().filter_map(parse_line).collect())
}

/// Per-remote-instance watermark: the last `seq` this reader has already
/// processed from that instance's activity log.
#[derive(Debug, Clone, Default)]
pub struct Watermarks(BTreeMap<InstanceId, u64>);

/// Outcome of scanning one remote instance's activity log against its
/// stored watermark.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Entries with `seq` greater than the previous watermark, in file
    /// order (which is append order).
    pub new_entries: Vec<ActivityEntry>,
    /// `true` if the log's minimum visible seq exceeded `watermark + 1`,
    /// meaning compaction or truncation happened upstream and the
    /// watermark had to jump the gap.
    pub watermark_gap_detected: bool,
}

impl Watermarks {
    /// A fresh watermark set (as if this instance has processed nothing
    /// yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// The last seq processed from `instance`, if any.
    pub fn get(&self, instance: &InstanceId) -> Option<u64> {
        self.0.get(instance).copied()
    }

    /// Scan `source`'s activity log and advance this reader's watermark
    /// for it, returning every not-yet-processed entry.
    pub fn scan(
        &mut self,
        fs: &dyn FileSystem,
        sd: &StorageDir,
        source: &InstanceId,
    ) -> Result<ScanResult> {
        let entries = read_entries(fs, sd, source)?;
        let prior = self.0.get(source).copied();

        let mut result = ScanResult::default();
        let relevant: Vec<&ActivityEntry> = entries
            .iter()
            .filter(|e| prior.is_none_or(|w| e.seq > w))
            .collect();

        if let (Some(w), Some(min_seq)) = (prior, relevant.iter().map(|e| e.seq).min()) {
            if min_seq > w + 1 {
                result.watermark_gap_detected = true;
            }
        }

        if let Some(max_seq) = entries.iter().map(|e| e.seq).max() {
            let slot = self.0.entry(source.clone()).or_insert(max_seq);
            if max_seq > *slot {
                *slot = max_seq;
            }
        }

        result.new_entries = relevant.into_iter().cloned().collect();
        Ok(result)
    }
}

/// Compact `instance`'s own activity log to its most recent
/// `max_entries` lines if it has grown past that bound.
///
/// Returns `true` if compaction ran. Compacting drops the log's oldest
/// lines in place, which is why readers must tolerate (and
/// [`Watermarks::scan`] detects) a watermark gap afterward.
pub fn compact_if_needed(
    fs: &dyn FileSystem,
    sd: &StorageDir,
    instance: &InstanceId,
    max_entries: usize,
) -> Result<bool> {
    let path = sd.activity_log_path(instance);
    let entries = read_entries(fs, sd, instance)?;
    if entries.len() <= max_entries {
        return Ok(false);
    }
    let kept = &entries[entries.len() - max_entries..];
    let mut content = String::new();
    for e in kept {
        content.push_str(&format_line(&e.doc_key, &e.instance, e.seq));
        content.push('\n');
    }
    fs.write_binary(&path, content.as_bytes())
        .map_err(|e| CoreError::FileWrite { path, source: e })?;
    Ok(true)
}

/// One Tier-1 ("fast path") retry attempt waiting for a specific remote
/// update to become visible.
#[derive(Debug, Clone)]
pub struct FastPathAttempt {
    attempt: usize,
    cumulative_delay_ms: i64,
}

/// What the caller should do after one fast-path check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastPathOutcome {
    /// The expected file is now visible: reload and notify subscribers.
    Visible,
    /// Not yet visible; wait this long before the next attempt.
    RetryAfter(Duration),
    /// Cumulative delay exceeded the configured budget: hand the
    /// (noteId, expected sequences) off to the Tier-2 polling group and
    /// stop retrying here.
    HandOff,
}

impl FastPathAttempt {
    /// A fresh attempt, about to make its first check.
    pub fn new() -> Self {
        Self {
            attempt: 0,
            cumulative_delay_ms: 0,
        }
    }

    /// Advance the attempt given whether the expected file is visible yet.
    pub fn step(&mut self, config: &CoreConfig, file_visible: bool) -> FastPathOutcome {
        if file_visible {
            return FastPathOutcome::Visible;
        }
        let delays = &config.poll_fast_path_delays_ms;
        if self.attempt >= delays.len() {
            return FastPathOutcome::HandOff;
        }
        let delay_ms = delays[self.attempt];
        self.attempt += 1;
        self.cumulative_delay_ms += delay_ms as i64;
        if self.cumulative_delay_ms >= config.poll_fast_path_max.as_millis() as i64 {
            return FastPathOutcome::HandOff;
        }
        FastPathOutcome::RetryAfter(Duration::from_millis(delay_ms))
    }
}

impl Default for FastPathAttempt {
    fn default() -> Self {
        Self::new()
    }
}
