//! Project events and the transition log.
//!
//! Every committed mutation appends one or more events. The pipeline's
//! reducer drains the unprocessed tail once per commit, so each event is
//! reduced exactly once regardless of how many observers look at the log.

use crate::autopilot::AutopilotStatus;
use crate::exceptions::ExceptionStatus;
use crate::launch::{LaunchOutcome, LaunchStep};
use crate::project::{ActionStatus, ChatRole, ProjectField};
use crate::stage::{StageId, StageStatus};
use chrono::{DateTime, Utc};
use genie_ids::{ActionRecordId, ExceptionId, RunId};
use std::collections::VecDeque;

/// Default number of already-reduced events kept for inspection.
pub const DEFAULT_EVENT_HISTORY: usize = 512;

/// State changes of one project.
#[derive(Debug, Clone, PartialEq)]
pub enum ProjectEvent {
    // ========================================================================
    // Project data
    // ========================================================================
    /// Top-level fields replaced by an update
    ProjectUpdated { fields: Vec<ProjectField> },

    /// Organizational data was (re)loaded
    OrgDataLoaded,

    // ========================================================================
    // Stage lifecycle
    // ========================================================================
    /// The cursor moved to a stage
    StageEntered { stage: StageId },

    StageStatusChanged { stage: StageId, status: StageStatus },

    StageApproved { stage: StageId, approver: String },

    ApprovalRevoked { stage: StageId },

    // ========================================================================
    // Actions
    // ========================================================================
    ActionStarted {
        stage: StageId,
        action: String,
        record: ActionRecordId,
    },

    ActionFinished {
        stage: StageId,
        action: String,
        record: ActionRecordId,
        status: ActionStatus,
    },

    // ========================================================================
    // Copilot
    // ========================================================================
    SuggestionAdded { stage: StageId, key: String },

    ChatMessageAdded { role: ChatRole },

    // ========================================================================
    // Exception queue
    // ========================================================================
    ExceptionRaised { stage: StageId, reason_code: String },

    ExceptionResolved { id: ExceptionId, status: ExceptionStatus },

    // ========================================================================
    // Autopilot and launch runs
    // ========================================================================
    AutopilotChanged { status: AutopilotStatus },

    LaunchStarted { run_id: RunId, attempt: u32 },

    LaunchStepCompleted { step: LaunchStep },

    LaunchFinished { outcome: LaunchOutcome },
}

impl ProjectEvent {
    /// Events that change the persisted project document.
    pub fn touches_document(&self) -> bool {
        !matches!(
            self,
            ProjectEvent::OrgDataLoaded | ProjectEvent::AutopilotChanged { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoggedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub event: ProjectEvent,
}

/// Append-only event log with a reducer cursor.
#[derive(Debug)]
pub struct EventLog {
    entries: VecDeque<LoggedEvent>,
    next_seq: u64,
    /// First sequence number not yet handed to the reducer
    reduced_up_to: u64,
    history: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_history(DEFAULT_EVENT_HISTORY)
    }
}

impl EventLog {
    pub fn with_history(history: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_seq: 0,
            reduced_up_to: 0,
            history,
        }
    }

    pub fn push(&mut self, event: ProjectEvent) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push_back(LoggedEvent {
            seq,
            at: Utc::now(),
            event,
        });
        seq
    }

    pub fn has_pending(&self) -> bool {
        self.reduced_up_to < self.next_seq
    }

    /// Hand every unreduced event to the caller and advance the cursor.
    pub fn take_pending(&mut self) -> Vec<ProjectEvent> {
        let pending: Vec<ProjectEvent> = self
            .entries
            .iter()
            .filter(|e| e.seq >= self.reduced_up_to)
            .map(|e| e.event.clone())
            .collect();
        self.reduced_up_to = self.next_seq;
        self.trim();
        pending
    }

    /// Drop reduced entries beyond the history limit.
    fn trim(&mut self) {
        while self.entries.len() > self.history {
            match self.entries.front() {
                Some(front) if front.seq < self.reduced_up_to => {
                    self.entries.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Retained events, oldest first.
    pub fn entries(&self) -> impl Iterator<Item = &LoggedEvent> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
