//! The cross-SD move state set and its permitted transitions.
//!
//! ```text
//! initiated → copying → files_copied → db_updated → cleaning → completed
//! any non-terminal → rolled_back
//! any non-terminal → cancelled
//! ```
//!
//! No other transition is valid; attempting one is a core bug, surfaced
//! here as a typed `CoreError::InvalidMoveTransition` rather than a panic,
//! since an embedding caller driving a persisted state machine across
//! process restarts is a more plausible source of a stray transition than
//! an in-process logic error.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::ids::{FolderId, InstanceId, MoveId, NoteId, SdUuid};

/// One state in the cross-SD move protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveState {
    /// The `note_moves` row has been created; execution hasn't started.
    Initiated,
    /// The `.moving-{noteId}` scratch directory has been created and the
    /// source tree is being copied into it.
    Copying,
    /// The copy into the scratch directory has been verified complete.
    FilesCopied,
    /// The local-cache transaction (conflict resolution, insert into
    /// target, remove from source) has committed.
    DbUpdated,
    /// The scratch directory has been renamed into place on the target
    /// and activity-log lines appended; source cleanup is in progress.
    Cleaning,
    /// The move finished successfully.
    Completed,
    /// The move was abandoned by user choice before completion.
    Cancelled,
    /// A failure occurred and rollback itself could not fully complete;
    /// the record remains for operator recovery.
    RolledBack,
}

impl MoveState {
    /// `true` for the three states that end the protocol — no further
    /// automatic execution or recovery applies once terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::RolledBack)
    }

    /// Is `self -> to` one of the permitted transitions?
    pub fn can_transition_to(self, to: Self) -> bool {
        use MoveState::*;
        match (self, to) {
            (Initiated, Copying) => true,
            (Copying, FilesCopied) => true,
            (FilesCopied, DbUpdated) => true,
            (DbUpdated, Cleaning) => true,
            (Cleaning, Completed) => true,
            (from, Cancelled | RolledBack) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// How the user (or an automatic rule) resolves a `MoveConflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Hard-delete the conflicting row on the target and proceed.
    Replace,
    /// Assign the dragged copy a new note id so both rows survive.
    KeepBoth,
    /// Abandon the move (transitions to `Cancelled`).
    Cancel,
}

/// What the target SD currently holds for this note id, as seen at the
/// `files_copied -> db_updated` conflict-detection step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetConflict {
    /// No row for this note id on the target: proceed directly.
    None,
    /// An active (non-soft-deleted) row exists: needs a
    /// [`ConflictStrategy`] decision.
    Active,
    /// Only a soft-deleted row exists: silently hard-delete it and
    /// proceed.
    SoftDeletedOnly,
}

/// A `note_moves` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRecord {
    /// Stable id of this move record.
    pub id: MoveId,
    /// Note being moved.
    pub note: NoteId,
    /// Source SD's stable identity.
    pub source_sd: SdUuid,
    /// Target SD's stable identity.
    pub target_sd: SdUuid,
    /// Folder on the target SD the note should land in.
    pub target_folder: FolderId,
    /// Current protocol state.
    pub state: MoveState,
    /// Instance currently responsible for driving this move forward.
    pub initiated_by: InstanceId,
    /// Unix ms when the move was first initiated.
    pub initiated_at_ms: i64,
    /// Unix ms of the last state transition (used for staleness/"stuck
    /// move" detection).
    pub last_modified_ms: i64,
    /// Source SD's root path, as resolved at initiation time.
    pub source_sd_path: PathBuf,
    /// Target SD's root path, as resolved at initiation time.
    pub target_sd_path: PathBuf,
    /// Populated if a rollback itself failed, for operator recovery.
    pub error: Option<String>,
    /// Set only under [`ConflictStrategy::KeepBoth`]: the fresh id the
    /// dragged copy was assigned on the target, distinct from `note`.
    pub keep_both_note_id: Option<NoteId>,
}

impl MoveRecord {
    /// Start a brand-new move in the `Initiated` state.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        note: NoteId,
        source_sd: SdUuid,
        target_sd: SdUuid,
        target_folder: FolderId,
        initiated_by: InstanceId,
        source_sd_path: PathBuf,
        target_sd_path: PathBuf,
        now_ms: i64,
    ) -> Self {
        Self {
            id: MoveId::new(),
            note,
            source_sd,
            target_sd,
            target_folder,
            state: MoveState::Initiated,
            initiated_by,
            initiated_at_ms: now_ms,
            last_modified_ms: now_ms,
            source_sd_path,
            target_sd_path,
            error: None,
            keep_both_note_id: None,
        }
    }

    /// The id under which this note's CRDT tree and cache row actually
    /// land on the target SD: `note` unless `KeepBoth` assigned a fresh
    /// one.
    pub fn target_note_id(&self) -> NoteId {
        self.keep_both_note_id.unwrap_or(self.note)
    }

    /// Attempt a transition, validating it against
    /// [`MoveState::can_transition_to`].
    pub fn transition(&mut self, to: MoveState, now_ms: i64) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(CoreError::InvalidMoveTransition {
                from: format!("{:?}", self.state),
                to: format!("{:?}", to),
            });
        }
        self.state = to;
        self.last_modified_ms = now_ms;
        Ok(())
    }

    /// Is this move "stuck" — non-terminal, owned by a foreign instance,
    /// and untouched for at least `stuck_age_ms`?
    pub fn is_stuck(&self, now_ms: i64, self_instance: &InstanceId, stuck_age_ms: i64) -> bool {
        !self.state.is_terminal()
            && &self.initiated_by != self_instance
            && now_ms - self.last_modified_ms >= stuck_age_ms
    }

    /// Take ownership of a stuck move: set `initiatedBy=self`,
    /// `lastModified=now`.
    pub fn take_over(&mut self, self_instance: InstanceId, now_ms: i64) {
        self.initiated_by = self_instance;
        self.last_modified_ms = now_ms;
    }

    /// Resume action for a move found in-flight at startup, owned by
    /// `self`. Returns the state execution should resume from.
    pub fn resume_from(&self) -> MoveState {
        match self.state {
            MoveState::Initiated => MoveState::Initiated,
            MoveState::Copying => MoveState::Initiated, // restart copying from scratch
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MoveRecord {
        MoveRecord::new(
            NoteId::new(),
            SdUuid::new(),
            SdUuid::new(),
            FolderId::new(),
            InstanceId::new(),
            PathBuf::from("/src"),
            PathBuf::from("/tgt"),
            0,
        )
    }

    #[test]
    fn happy_path_transitions_are_allowed() {
        let mut r = record();
        for state in [
            MoveState::Copying,
            MoveState::FilesCopied,
            MoveState::DbUpdated,
            MoveState::Cleaning,
            MoveState::Completed,
        ] {
            r.transition(state, 1).unwrap();
        }
        assert_eq!(r.state, MoveState::Completed);
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut r = record();
        assert!(r.transition(MoveState::DbUpdated, 1).is_err());
    }

    #[test]
    fn cancel_allowed_from_any_nonterminal_state() {
        for state in [
            MoveState::Initiated,
            MoveState::Copying,
            MoveState::FilesCopied,
            MoveState::DbUpdated,
            MoveState::Cleaning,
        ] {
            let mut r = record();
            r.state = state;
            assert!(r.transition(MoveState::Cancelled, 1).is_ok());
        }
    }

    #[test]
    fn no_transitions_out_of_terminal_states() {
        for terminal in [MoveState::Completed, MoveState::Cancelled, MoveState::RolledBack] {
            let mut r = record();
            r.state = terminal;
            assert!(r.transition(MoveState::Copying, 1).is_err());
            assert!(r.transition(MoveState::Cancelled, 1).is_err());
        }
    }

    #[test]
    fn stuck_move_detection_requires_foreign_owner_and_age() {
        let mut r = record();
        r.state = MoveState::Copying;
        r.last_modified_ms = 0;
        let other = InstanceId::new();
        assert!(r.is_stuck(10_000, &other, 5_000));
        assert!(!r.is_stuck(1_000, &other, 5_000));
        assert!(!r.is_stuck(10_000, &r.initiated_by.clone(), 5_000));
    }

    #[test]
    fn take_over_rewrites_owner_and_timestamp() {
        let mut r = record();
        let new_owner = InstanceId::new();
        r.take_over(new_owner.clone(), 999);
        assert_eq!(r.initiated_by, new_owner);
        assert_eq!(r.last_modified_ms, 999);
    }

    #[test]
    fn resume_from_restarts_copying_from_initiated() {
        let mut r = record();
        r.state = MoveState::Copying;
        assert_eq!(r.resume_from(), MoveState::Initiated);

        r.state = MoveState::FilesCopied;
        assert_eq!(r.resume_from(), MoveState::FilesCopied);
    }
}
