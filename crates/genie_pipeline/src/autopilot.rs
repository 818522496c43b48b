//! Autopilot controller.
//!
//! The controller only decides; the pipeline executes its decisions. Each
//! evaluation looks at the current stage and yields exactly one
//! [`AutopilotDecision`].
//!
//! Invariant: an `Invoke` decision is only produced for an approved stage.
//!
//! Every invocation carries an [`AutopilotTicket`] stamped with the pause
//! epoch. [`AutopilotController::pause`] bumps the epoch, so an invocation
//! that settles after a pause cannot overwrite the paused state, and one that
//! has not started yet is dropped (see [`AutopilotController::is_current`]).

use crate::graph;
use crate::org::{self, OrgSnapshot};
use crate::project::Project;
use crate::stage::StageId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AutopilotStatus {
    #[default]
    Idle,
    Running,
    Blocked,
}

impl AutopilotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutopilotStatus::Idle => "idle",
            AutopilotStatus::Running => "running",
            AutopilotStatus::Blocked => "blocked",
        }
    }
}

impl fmt::Display for AutopilotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fractional progress reported by an in-flight action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutopilotProgress {
    pub current: usize,
    pub total: usize,
}

impl AutopilotProgress {
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        ((self.current.min(self.total) * 100) / self.total) as u8
    }
}

/// Proof that an invocation was started in a given pause epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutopilotTicket {
    epoch: u64,
    pub stage: StageId,
}

/// Why the controller settled to idle without acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    /// The readiness predicate for the stage does not hold.
    NotReady,
    /// The primary action already ran for this stage; a human must re-trigger.
    AlreadyAttempted,
    /// The stage is complete and there is nowhere to advance.
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutopilotDecision {
    /// Autopilot is off; nothing was changed.
    Disabled,
    /// An invocation is already in flight.
    Busy,
    /// The stage is not approved.
    Blocked { stage: StageId },
    Idle { stage: StageId, reason: IdleReason },
    /// The stage is complete; move the cursor on.
    Advance { from: StageId, to: StageId },
    /// Invoke the stage's primary action.
    Invoke {
        stage: StageId,
        action: &'static str,
        ticket: AutopilotTicket,
    },
}

#[derive(Debug, Default)]
pub struct AutopilotController {
    enabled: bool,
    status: AutopilotStatus,
    progress: Option<AutopilotProgress>,
    epoch: u64,
    /// Invocation still running, possibly from before a pause
    in_flight: Option<StageId>,
    /// Stages whose primary action already ran since the last arm/approval
    attempted: BTreeSet<StageId>,
}

impl AutopilotController {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Default::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn status(&self) -> AutopilotStatus {
        self.status
    }

    pub fn progress(&self) -> Option<AutopilotProgress> {
        self.progress
    }

    /// Arm the autopilot. Every stage becomes eligible again.
    pub fn enable(&mut self) {
        self.enabled = true;
        self.attempted.clear();
        info!("Autopilot enabled");
    }

    /// Human stop: disable and force `idle`.
    ///
    /// An invocation started before the pause keeps running to completion
    /// but can no longer change the status.
    pub fn pause(&mut self) {
        self.enabled = false;
        self.epoch += 1;
        self.status = AutopilotStatus::Idle;
        self.progress = None;
        info!("Autopilot paused");
    }

    /// Allow the primary action of `stage` to run again.
    pub fn rearm_stage(&mut self, stage: StageId) {
        self.attempted.remove(&stage);
    }

    /// Record that the primary action of `stage` ran, whoever started it.
    pub fn mark_attempted(&mut self, stage: StageId) {
        self.attempted.insert(stage);
    }

    /// Evaluate the current stage and settle the status.
    pub fn decide(&mut self, project: &Project, org: &OrgSnapshot, stage: StageId) -> AutopilotDecision {
        if !self.enabled {
            return AutopilotDecision::Disabled;
        }
        if self.in_flight.is_some() {
            return AutopilotDecision::Busy;
        }

        if !project.is_approved(stage) {
            if self.status != AutopilotStatus::Blocked {
                debug!("Autopilot blocked on unapproved stage {}", stage);
            }
            self.status = AutopilotStatus::Blocked;
            return AutopilotDecision::Blocked { stage };
        }

        self.status = AutopilotStatus::Idle;

        if project.status(stage).is_completed() {
            return match stage.next() {
                Some(next) if graph::is_stage_accessible(project, next) => {
                    AutopilotDecision::Advance { from: stage, to: next }
                }
                _ => AutopilotDecision::Idle {
                    stage,
                    reason: IdleReason::Finished,
                },
            };
        }

        if !org::is_stage_ready(project, org, stage) {
            return AutopilotDecision::Idle {
                stage,
                reason: IdleReason::NotReady,
            };
        }

        if self.attempted.contains(&stage) {
            return AutopilotDecision::Idle {
                stage,
                reason: IdleReason::AlreadyAttempted,
            };
        }

        self.attempted.insert(stage);
        self.in_flight = Some(stage);
        self.status = AutopilotStatus::Running;
        self.progress = None;
        AutopilotDecision::Invoke {
            stage,
            action: stage.primary_action(),
            ticket: AutopilotTicket {
                epoch: self.epoch,
                stage,
            },
        }
    }

    /// Whether an invocation started with `ticket` may still go ahead: the
    /// autopilot is on and has not been paused since.
    pub fn is_current(&self, ticket: &AutopilotTicket) -> bool {
        self.enabled && ticket.epoch == self.epoch
    }

    /// Report progress for the in-flight invocation. Ignored when not running.
    pub fn set_progress(&mut self, current: usize, total: usize) -> bool {
        if self.status != AutopilotStatus::Running {
            return false;
        }
        self.progress = Some(AutopilotProgress { current, total });
        true
    }

    /// Settle an invocation. Returns false if a pause happened in between,
    /// in which case the paused status is left alone.
    pub fn finish(&mut self, ticket: AutopilotTicket) -> bool {
        self.in_flight = None;
        if ticket.epoch != self.epoch {
            debug!("Ignoring autopilot settle for {} from before a pause", ticket.stage);
            return false;
        }
        self.status = AutopilotStatus::Idle;
        self.progress = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{AnalysisData, ProjectPatch};

    fn org_with_people() -> OrgSnapshot {
        OrgSnapshot {
            org_id: "org".to_string(),
            members: Some(vec![]),
            departments: Some(vec![]),
            teams: Some(vec![]),
            ..Default::default()
        }
    }

    fn analyze_ready() -> Project {
        let mut project = Project::new("p", "");
        project.apply_patch(ProjectPatch::new().sources(["doc"]));
        project.mark_stage_in_progress(StageId::Ingest);
        project.mark_stage_complete(StageId::Ingest).unwrap();
        project.mark_stage_in_progress(StageId::Analyze);
        project
    }

    #[test]
    fn test_disabled_changes_nothing() {
        let mut controller = AutopilotController::new(false);
        let project = analyze_ready();
        assert_eq!(
            controller.decide(&project, &org_with_people(), StageId::Analyze),
            AutopilotDecision::Disabled
        );
        assert_eq!(controller.status(), AutopilotStatus::Idle);
    }

    #[test]
    fn test_unapproved_stage_blocks() {
        let mut controller = AutopilotController::new(true);
        let project = analyze_ready();
        let decision = controller.decide(&project, &org_with_people(), StageId::Analyze);
        assert_eq!(decision, AutopilotDecision::Blocked { stage: StageId::Analyze });
        assert_eq!(controller.status(), AutopilotStatus::Blocked);
    }

    #[test]
    fn test_approved_and_ready_invokes_once() {
        let mut controller = AutopilotController::new(true);
        let mut project = analyze_ready();
        project.approve_stage(StageId::Analyze, "ana").unwrap();
        let org = org_with_people();

        let ticket = match controller.decide(&project, &org, StageId::Analyze) {
            AutopilotDecision::Invoke { action, ticket, .. } => {
                assert_eq!(action, "run_analysis");
                ticket
            }
            other => panic!("expected invoke, got {:?}", other),
        };
        assert_eq!(controller.status(), AutopilotStatus::Running);
        assert_eq!(controller.decide(&project, &org, StageId::Analyze), AutopilotDecision::Busy);

        assert!(controller.set_progress(1, 4));
        assert_eq!(controller.progress().unwrap().percent(), 25);
        assert!(controller.finish(ticket));
        assert_eq!(controller.status(), AutopilotStatus::Idle);
        assert!(controller.progress().is_none());

        assert_eq!(
            controller.decide(&project, &org, StageId::Analyze),
            AutopilotDecision::Idle {
                stage: StageId::Analyze,
                reason: IdleReason::AlreadyAttempted
            }
        );
        controller.rearm_stage(StageId::Analyze);
        assert!(matches!(
            controller.decide(&project, &org, StageId::Analyze),
            AutopilotDecision::Invoke { .. }
        ));
    }

    #[test]
    fn test_not_ready_settles_idle() {
        let mut controller = AutopilotController::new(true);
        let mut project = analyze_ready();
        project.approve_stage(StageId::Analyze, "ana").unwrap();

        let decision = controller.decide(&project, &OrgSnapshot::new("org"), StageId::Analyze);
        assert_eq!(
            decision,
            AutopilotDecision::Idle {
                stage: StageId::Analyze,
                reason: IdleReason::NotReady
            }
        );
    }

    #[test]
    fn test_completed_stage_advances() {
        let mut controller = AutopilotController::new(true);
        let mut project = analyze_ready();
        project.approve_stage(StageId::Analyze, "ana").unwrap();
        project.apply_patch(ProjectPatch::new().analysis(AnalysisData {
            target_audience: "Agents".to_string(),
            learning_needs: vec!["Triage".to_string()],
            ..Default::default()
        }));
        project.mark_stage_complete(StageId::Analyze).unwrap();

        assert_eq!(
            controller.decide(&project, &org_with_people(), StageId::Analyze),
            AutopilotDecision::Advance {
                from: StageId::Analyze,
                to: StageId::Design
            }
        );
    }

    #[test]
    fn test_pause_wins_over_late_finish() {
        let mut controller = AutopilotController::new(true);
        let mut project = analyze_ready();
        project.approve_stage(StageId::Analyze, "ana").unwrap();

        let ticket = match controller.decide(&project, &org_with_people(), StageId::Analyze) {
            AutopilotDecision::Invoke { ticket, .. } => ticket,
            other => panic!("expected invoke, got {:?}", other),
        };
        assert!(controller.is_current(&ticket));
        controller.pause();
        assert!(!controller.is_current(&ticket));
        assert!(!controller.set_progress(2, 3));
        assert!(!controller.finish(ticket));
        assert_eq!(controller.status(), AutopilotStatus::Idle);
        assert!(!controller.is_enabled());
    }

    #[test]
    fn test_rearm_during_stale_invocation_stays_busy() {
        let mut controller = AutopilotController::new(true);
        let mut project = analyze_ready();
        project.approve_stage(StageId::Analyze, "ana").unwrap();
        let org = org_with_people();

        let ticket = match controller.decide(&project, &org, StageId::Analyze) {
            AutopilotDecision::Invoke { ticket, .. } => ticket,
            other => panic!("expected invoke, got {:?}", other),
        };
        controller.pause();
        controller.enable();
        // re-arming does not revive a ticket from before the pause
        assert!(!controller.is_current(&ticket));
        assert_eq!(controller.decide(&project, &org, StageId::Analyze), AutopilotDecision::Busy);
        assert_eq!(controller.status(), AutopilotStatus::Idle);

        assert!(!controller.finish(ticket));
        assert!(matches!(
            controller.decide(&project, &org, StageId::Analyze),
            AutopilotDecision::Invoke { .. }
        ));
    }
}
