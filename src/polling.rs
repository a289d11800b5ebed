//! Tier-2 polling group: a bounded-rate scheduler that keeps checking for
//! remote changes a fast-path retry gave up on.
//!
//! This module holds policy and state only — no timers, no threads. An
//! embedding scheduler ticks
//! it with the current time and the result of actually checking disk.

use std::collections::BTreeMap;

use crate::clock::VectorClock;
use crate::config::CoreConfig;
use crate::ids::{InstanceId, NoteId};

/// Priority class of a polling-group entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Handed off from the fast path, or otherwise urgent.
    High,
    /// Background sweep entries (periodic full repoll, idle tracking).
    Normal,
}

/// Why an entry exited the polling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// All of the entry's expected sequences are now visible.
    FastPathHandoff,
    /// A full-repoll entry always exits after its single poll.
    FullRepoll,
    /// The note is no longer open in the UI.
    OpenNoteClosed,
    /// The folder containing the note is no longer visible in the UI.
    NotesListClosed,
    /// The 5-minute window since the last local edit has expired.
    RecentEditExpired,
}

/// Why this entry is being tracked, and therefore which criterion retires
/// it.
#[derive(Debug, Clone)]
pub enum EntryKind {
    /// Waiting for specific per-instance sequences to become visible
    /// (handed off by the fast path after its budget ran out).
    FastPathHandoff {
        /// Sequences that must all be visible for this entry to exit.
        expected: BTreeMap<InstanceId, u64>,
    },
    /// A one-shot safety-net sweep entry. Exits after its single poll regardless of outcome.
    FullRepoll,
    /// Tracked only while the note is open in the editor.
    OpenNote,
    /// Tracked only while the note's containing folder is visible in a
    /// notes list.
    NotesList,
    /// Tracked for a fixed window after a local edit, to catch a quick
    /// remote echo.
    RecentEdit {
        /// Unix ms of the local edit that started this window.
        last_edit_ms: i64,
    },
}

/// One entry in the Tier-2 polling group.
#[derive(Debug, Clone)]
pub struct PollEntry {
    /// Note this entry is polling for.
    pub note: NoteId,
    /// Scheduling priority.
    pub priority: Priority,
    /// What retires this entry.
    pub kind: EntryKind,
    /// Whether the note is still open in the UI (maintained by the
    /// caller; consulted by [`EntryKind::OpenNote`]).
    pub is_open_in_ui: bool,
    /// Whether the note's folder is still visible in a notes list
    /// (maintained by the caller; consulted by [`EntryKind::NotesList`]).
    pub is_in_visible_notes_list: bool,
}

impl PollEntry {
    /// Does `visible` (the currently-observed per-instance clock for this
    /// note) satisfy every sequence this entry is waiting on?
    fn fast_path_satisfied(&self, visible: &VectorClock) -> bool {
        match &self.kind {
            EntryKind::FastPathHandoff { expected } => expected
                .iter()
                .all(|(inst, seq)| visible.get(inst).unwrap_or(0) >= *seq),
            _ => false,
        }
    }

    /// Evaluate this entry's exit criterion given the current time and the
    /// latest observed state. `polled_once` is set by the caller after it
    /// has actually issued this entry's one poll (needed for
    /// [`EntryKind::FullRepoll`], which exits unconditionally after that).
    pub fn exit_reason(
        &self,
        now_ms: i64,
        visible: &VectorClock,
        config: &CoreConfig,
        polled_once: bool,
    ) -> Option<ExitReason> {
        if matches!(self.kind, EntryKind::FastPathHandoff { .. }) && self.fast_path_satisfied(visible) {
            return Some(ExitReason::FastPathHandoff);
        }
        match &self.kind {
            EntryKind::FastPathHandoff { .. } => None,
            EntryKind::FullRepoll => polled_once.then_some(ExitReason::FullRepoll),
            EntryKind::OpenNote => (!self.is_open_in_ui).then_some(ExitReason::OpenNoteClosed),
            EntryKind::NotesList => {
                (!self.is_in_visible_notes_list).then_some(ExitReason::NotesListClosed)
            }
            EntryKind::RecentEdit { last_edit_ms } => {
                let window_ms = config.poll_recent_edit_window.as_millis() as i64;
                (now_ms - last_edit_ms >= window_ms).then_some(ExitReason::RecentEditExpired)
            }
        }
    }
}

/// Cost, in polls, of one attempt against an entry: a "hit" (the file
/// became visible) is cheaper than a miss, so actively-syncing notes get
/// polled more often within the same budget.
pub fn poll_cost(was_hit: bool) -> f64 {
    if was_hit { 0.25 } else { 1.0 }
}

/// A token-bucket rate limiter implementing a bounded-rate scheduler
/// (default 120 polls/min, max burst 10/s, ≥ 20% capacity reserved for
/// background work).
///
/// `High` priority may only draw on `(1 - background_reserve)` of the
/// bucket, guaranteeing `Normal`-priority (background sweep) polls always
/// have at least `background_reserve` of capacity available to them.
#[derive(Debug)]
pub struct PollBudget {
    per_sec: f64,
    max_burst: f64,
    background_reserve: f64,
    tokens: f64,
    last_refill_ms: i64,
}

impl PollBudget {
    /// A freshly-filled budget (starts at max burst capacity).
    pub fn new(config: &CoreConfig, now_ms: i64) -> Self {
        let max_burst = config.poll_max_burst_per_sec as f64;
        Self {
            per_sec: config.poll_rate_per_min as f64 / 60.0,
            max_burst,
            background_reserve: config.poll_background_reserve,
            tokens: max_burst,
            last_refill_ms: now_ms,
        }
    }

    fn refill(&mut self, now_ms: i64) {
        let elapsed_s = (now_ms - self.last_refill_ms).max(0) as f64 / 1000.0;
        self.tokens = (self.tokens + self.per_sec * elapsed_s).min(self.max_burst);
        self.last_refill_ms = now_ms;
    }

    /// Try to spend `cost` tokens for a poll of the given `priority`,
    /// refilling first. Returns `true` (and deducts the cost) if there was
    /// enough budget.
    pub fn try_consume(&mut self, now_ms: i64, priority: Priority, cost: f64) -> bool {
        self.refill(now_ms);
        let available = match priority {
            Priority::High => self.tokens * (1.0 - self.background_reserve),
            Priority::Normal => self.tokens,
        };
        if available >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// The Tier-2 polling group: a bounded-rate pool of [`PollEntry`]s plus
/// the [`PollBudget`] that throttles how often they're actually checked.
#[derive(Debug)]
pub struct PollingGroup {
    budget: PollBudget,
    entries: Vec<PollEntry>,
}

impl PollingGroup {
    /// A polling group whose budget starts fully charged.
    pub fn new(config: &CoreConfig, now_ms: i64) -> Self {
        Self {
            budget: PollBudget::new(config, now_ms),
            entries: Vec::new(),
        }
    }

    /// Add an entry (e.g. a fast-path handoff, or a full-repoll sweep
    /// entry).
    pub fn enqueue(&mut self, entry: PollEntry) {
        self.entries.push(entry);
    }

    /// Number of entries currently tracked.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` if no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Try to spend this tick's budget on `entry_index`, returning whether
    /// the caller may actually issue the poll. Callers should only call
    /// this for entries they intend to poll right now.
    pub fn try_spend(&mut self, now_ms: i64, entry_index: usize, was_hit: bool) -> bool {
        let priority = self.entries[entry_index].priority;
        self.budget.try_consume(now_ms, priority, poll_cost(was_hit))
    }

    /// Remove every entry whose exit criterion now holds, given the
    /// caller-observed visibility clock per note and whether each entry
    /// was just polled this round. Returns the removed entries paired with
    /// their exit reason.
    pub fn retire_exited(
        &mut self,
        now_ms: i64,
        visible_by_note: &BTreeMap<NoteId, VectorClock>,
        config: &CoreConfig,
        polled_this_round: &[bool],
    ) -> Vec<(PollEntry, ExitReason)> {
        let empty_clock = VectorClock::new();
        let mut retired = Vec::new();
        let mut keep = Vec::with_capacity(self.entries.len());
        for (i, entry) in self.entries.drain(..).enumerate() {
            let visible = visible_by_note.get(&entry.note).unwrap_or(&empty_clock);
            let polled = polled_this_round.get(i).copied().unwrap_or(false);
            match entry.exit_reason(now_ms, visible, config, polled) {
                Some(reason) => retired.push((entry, reason)),
                None => keep.push(entry),
            }
        }
        self.entries = keep;
        retired
    }
}

/// Enqueue every known note at `Normal` priority as a one-shot safety net
///. A `poll_full_repoll_interval` of zero
/// disables this entirely — the caller should not invoke it.
pub fn full_repoll_entries(notes: impl IntoIterator<Item = NoteId>) -> Vec<PollEntry> {
    notes
        .into_iter()
        .map(|note| PollEntry {
            note,
            priority: Priority::Normal,
            kind: EntryKind::FullRepoll,
            is_open_in_ui: false,
            is_in_visible_notes_list: false,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_path_handoff_exits_once_satisfied() {
        let config = CoreConfig::default();
        let instance = InstanceId::new();
        let note = NoteId::new();
        let mut expected = BTreeMap::new();
        expected.insert(instance.clone(), 5);
        let entry = PollEntry {
            note,
            priority: Priority::High,
            kind: EntryKind::FastPathHandoff { expected },
            is_open_in_ui: true,
            is_in_visible_notes_list: true,
        };

        let mut not_yet = VectorClock::new();
        not_yet.advance(instance.clone(), 4);
        assert!(entry.exit_reason(0, &not_yet, &config, false).is_none());

        let mut satisfied = VectorClock::new();
        satisfied.advance(instance, 5);
        assert_eq!(
            entry.exit_reason(0, &satisfied, &config, false),
            Some(ExitReason::FastPathHandoff)
        );
    }

    #[test]
    fn full_repoll_exits_after_one_poll() {
        let config = CoreConfig::default();
        let entry = PollEntry {
            note: NoteId::new(),
            priority: Priority::Normal,
            kind: EntryKind::FullRepoll,
            is_open_in_ui: false,
            is_in_visible_notes_list: false,
        };
        let clock = VectorClock::new();
        assert!(entry.exit_reason(0, &clock, &config, false).is_none());
        assert_eq!(
            entry.exit_reason(0, &clock, &config, true),
            Some(ExitReason::FullRepoll)
        );
    }

    #[test]
    fn open_note_exits_when_closed() {
        let config = CoreConfig::default();
        let mut entry = PollEntry {
            note: NoteId::new(),
            priority: Priority::High,
            kind: EntryKind::OpenNote,
            is_open_in_ui: true,
            is_in_visible_notes_list: true,
        };
        let clock = VectorClock::new();
        assert!(entry.exit_reason(0, &clock, &config, false).is_none());
        entry.is_open_in_ui = false;
        assert_eq!(
            entry.exit_reason(0, &clock, &config, false),
            Some(ExitReason::OpenNoteClosed)
        );
    }

    #[test]
    fn recent_edit_exits_after_window() {
        let config = CoreConfig::default();
        let entry = PollEntry {
            note: NoteId::new(),
            priority: Priority::Normal,
            kind: EntryKind::RecentEdit { last_edit_ms: 0 },
            is_open_in_ui: true,
            is_in_visible_notes_list: true,
        };
        let clock = VectorClock::new();
        let window_ms = config.poll_recent_edit_window.as_millis() as i64;
        assert!(entry.exit_reason(window_ms - 1, &clock, &config, false).is_none());
        assert_eq!(
            entry.exit_reason(window_ms, &clock, &config, false),
            Some(ExitReason::RecentEditExpired)
        );
    }

    #[test]
    fn budget_reserves_capacity_for_background() {
        let mut config = CoreConfig::default();
        config.poll_rate_per_min = 60; // 1/sec
        config.poll_max_burst_per_sec = 1;
        config.poll_background_reserve = 0.5;
        let mut budget = PollBudget::new(&config, 0);

        // High priority can only use 50% of the single-token burst.
        assert!(!budget.try_consume(0, Priority::High, 0.6));
        assert!(budget.try_consume(0, Priority::High, 0.5));
    }

    #[test]
    fn hit_costs_less_than_miss() {
        assert!(poll_cost(true) < poll_cost(false));
    }

    #[test]
    fn retire_exited_removes_satisfied_entries_only() {
        let config = CoreConfig::default();
        let mut group = PollingGroup::new(&config, 0);
        let note_a = NoteId::new();
        let note_b = NoteId::new();
        group.enqueue(PollEntry {
            note: note_a,
            priority: Priority::Normal,
            kind: EntryKind::FullRepoll,
            is_open_in_ui: false,
            is_in_visible_notes_list: false,
        });
        group.enqueue(PollEntry {
            note: note_b,
            priority: Priority::Normal,
            kind: EntryKind::OpenNote,
            is_open_in_ui: true,
            is_in_visible_notes_list: true,
        });

        let visible = BTreeMap::new();
        let retired = group.retire_exited(0, &visible, &config, &[true, false]);
        assert_eq!(retired.len(), 1);
        assert_eq!(group.len(), 1);
    }
}
