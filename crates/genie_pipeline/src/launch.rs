//! Composite "build & launch" run.
//!
//! One run walks the whole course from selected sources to notified learners:
//!
//! ```text
//! ingest -> outline -> lessons -> assessments -> enrollments -> notifications
//! ```
//!
//! Every step after the first waits at the checkpoint gate. Answering a
//! checkpoint with "stop" ends the run with [`LaunchOutcome::Canceled`];
//! everything earlier steps produced stays on the project.
//!
//! The run record lives on the project document, so the attempt counter and
//! the last error survive a reload. A run still marked running when a
//! session is rebuilt from a snapshot is closed as interrupted.

use crate::autopilot::AutopilotProgress;
use crate::error::{PipelineError, Result};
use crate::events::ProjectEvent;
use crate::exceptions::{self, ExceptionPriority};
use crate::metrics;
use crate::pipeline::Pipeline;
use crate::project::ActionStatus;
use crate::stage::StageId;
use crate::stages;
use chrono::serde::{ts_milliseconds, ts_milliseconds_option};
use chrono::{DateTime, Utc};
use genie_ids::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStep {
    Ingest,
    Outline,
    Lessons,
    Assessments,
    Enrollments,
    Notifications,
}

impl LaunchStep {
    pub const ALL: [LaunchStep; 6] = [
        LaunchStep::Ingest,
        LaunchStep::Outline,
        LaunchStep::Lessons,
        LaunchStep::Assessments,
        LaunchStep::Enrollments,
        LaunchStep::Notifications,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchStep::Ingest => "ingest",
            LaunchStep::Outline => "outline",
            LaunchStep::Lessons => "lessons",
            LaunchStep::Assessments => "assessments",
            LaunchStep::Enrollments => "enrollments",
            LaunchStep::Notifications => "notifications",
        }
    }

    /// The pipeline stage whose data this step produces.
    pub fn stage(&self) -> StageId {
        match self {
            LaunchStep::Ingest => StageId::Ingest,
            LaunchStep::Outline => StageId::Design,
            LaunchStep::Lessons => StageId::Develop,
            LaunchStep::Assessments | LaunchStep::Enrollments | LaunchStep::Notifications => {
                StageId::Implement
            }
        }
    }
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchStatus {
    Running,
    Completed,
    Canceled,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    Completed,
    Canceled { step: LaunchStep },
    Failed { step: LaunchStep, error: String },
}

impl LaunchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, LaunchOutcome::Completed)
    }

    /// Banner text for a run that did not complete.
    pub fn error_message(&self) -> Option<String> {
        match self {
            LaunchOutcome::Completed => None,
            LaunchOutcome::Canceled { step } => {
                Some(PipelineError::Canceled { step: *step }.to_string())
            }
            LaunchOutcome::Failed { step, error } => Some(format!("{} failed: {}", step, error)),
        }
    }

    fn status(&self) -> LaunchStatus {
        match self {
            LaunchOutcome::Completed => LaunchStatus::Completed,
            LaunchOutcome::Canceled { .. } => LaunchStatus::Canceled,
            LaunchOutcome::Failed { .. } => LaunchStatus::Failed,
        }
    }
}

/// Record of the latest launch run on a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRun {
    pub run_id: RunId,
    /// 1 for the first run, incremented on every new run
    pub attempt: u32,
    pub status: LaunchStatus,
    pub current_step: Option<LaunchStep>,
    pub completed_steps: Vec<LaunchStep>,
    pub progress: Option<AutopilotProgress>,
    #[serde(with = "ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(default, with = "ts_milliseconds_option")]
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl LaunchRun {
    fn start(attempt: u32) -> Self {
        Self {
            run_id: RunId::new(),
            attempt,
            status: LaunchStatus::Running,
            current_step: None,
            completed_steps: Vec::new(),
            progress: None,
            started_at: Utc::now(),
            finished_at: None,
            last_error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == LaunchStatus::Running
    }

    fn finish(&mut self, outcome: &LaunchOutcome) {
        self.status = outcome.status();
        self.finished_at = Some(Utc::now());
        self.progress = None;
        self.last_error = outcome.error_message();
    }

    /// Close a run that was still marked running when its session ended.
    pub(crate) fn interrupt(&mut self) {
        self.status = LaunchStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.progress = None;
        self.last_error = Some(match self.current_step {
            Some(step) => format!("{} interrupted", step),
            None => "launch run interrupted".to_string(),
        });
    }
}

/// Drives one launch run over a pipeline.
pub struct LaunchRunner {
    pipeline: Pipeline,
}

impl LaunchRunner {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }

    /// Run every step in order. Fails only when another run is still going;
    /// step failures and cancellations come back as the outcome.
    pub async fn run(&self) -> Result<LaunchOutcome> {
        let run_id = self
            .pipeline
            .mutate(|state| -> Result<RunId> {
                let project = &mut state.project;
                if project.launch.as_ref().is_some_and(|r| r.is_running()) {
                    return Err(PipelineError::prerequisite(
                        "a launch run is already in progress",
                    ));
                }
                let attempt = project.launch.as_ref().map_or(1, |r| r.attempt + 1);
                let run = LaunchRun::start(attempt);
                let run_id = run.run_id.clone();
                project.launch = Some(run);
                project.last_error = None;
                state.events.push(ProjectEvent::LaunchStarted {
                    run_id: run_id.clone(),
                    attempt,
                });
                Ok(run_id)
            })
            .await?;
        info!("Launch run {} started", run_id.short());

        for (idx, step) in LaunchStep::ALL.into_iter().enumerate() {
            if idx > 0 {
                match self.pipeline.wait_for_checkpoint(step).await {
                    Ok(true) => {}
                    Ok(false) => return Ok(self.finish(LaunchOutcome::Canceled { step }, None).await),
                    Err(e) => {
                        let error = PipelineError::from(e).to_string();
                        return Ok(self.finish(LaunchOutcome::Failed { step, error }, None).await);
                    }
                }
            }

            let started_at = Utc::now();
            self.pipeline
                .with_state(|state| {
                    if let Some(run) = state.project.launch.as_mut() {
                        run.current_step = Some(step);
                        run.progress = None;
                    }
                })
                .await;
            info!("Launch step {} ({})", step, run_id.short());

            if let Err(e) = self.run_step(step).await {
                let error = e.to_string();
                return Ok(self
                    .finish(LaunchOutcome::Failed { step, error }, Some(started_at))
                    .await);
            }

            let step_run = run_id.clone();
            self.pipeline
                .mutate(|state| {
                    let project = &mut state.project;
                    if let Some(run) = project.launch.as_mut() {
                        run.completed_steps.push(step);
                    }
                    metrics::record(
                        project,
                        Some(step_run),
                        step.stage(),
                        step.as_str(),
                        ActionStatus::Success,
                        started_at,
                    );
                    state.events.push(ProjectEvent::LaunchStepCompleted { step });
                })
                .await;
        }

        Ok(self.finish(LaunchOutcome::Completed, None).await)
    }

    async fn run_step(&self, step: LaunchStep) -> Result<()> {
        let pipeline = &self.pipeline;
        match step {
            LaunchStep::Ingest => {
                stages::ingest::ingest_sources(pipeline).await?;
            }
            LaunchStep::Outline => {
                stages::design::ensure_design(pipeline).await?;
                stages::develop::ensure_draft(pipeline).await?;
            }
            LaunchStep::Lessons => {
                let report = stages::develop::generate_lessons(pipeline).await?;
                if report.failed > 0 {
                    return Err(PipelineError::service(format!(
                        "{} of {} lessons failed to generate",
                        report.failed, report.total
                    )));
                }
            }
            LaunchStep::Assessments => {
                stages::implement::create_course_and_assessments(pipeline).await?;
            }
            LaunchStep::Enrollments => {
                stages::implement::enroll_members(pipeline).await?;
            }
            LaunchStep::Notifications => {
                stages::implement::notify_members(pipeline).await?;
                pipeline.complete_stage_if_ready(StageId::Implement).await;
            }
        }
        Ok(())
    }

    /// Close the run record. `step_started` is set when the failing step
    /// actually ran, so its duration lands in the metrics.
    async fn finish(&self, outcome: LaunchOutcome, step_started: Option<DateTime<Utc>>) -> LaunchOutcome {
        match &outcome {
            LaunchOutcome::Completed => info!("Launch run completed"),
            LaunchOutcome::Canceled { step } => info!("Launch run canceled at {}", step),
            LaunchOutcome::Failed { step, error } => warn!("Launch run failed at {}: {}", step, error),
        }
        self.pipeline
            .mutate(|state| {
                let project = &mut state.project;
                let run_id = project.launch.as_ref().map(|r| r.run_id.clone());
                if let Some(run) = project.launch.as_mut() {
                    run.finish(&outcome);
                }
                let message = outcome.error_message();
                if let Some(message) = &message {
                    project.last_error = Some(message.clone());
                }
                if let (LaunchOutcome::Failed { step, .. }, Some(message)) = (&outcome, message) {
                    if let Some(started_at) = step_started {
                        metrics::record(
                            project,
                            run_id,
                            step.stage(),
                            step.as_str(),
                            ActionStatus::Error,
                            started_at,
                        );
                    }
                    state.raise_exception(
                        step.stage(),
                        exceptions::LAUNCH_FAILED,
                        &message,
                        ExceptionPriority::High,
                    );
                }
                state.events.push(ProjectEvent::LaunchFinished {
                    outcome: outcome.clone(),
                });
            })
            .await;
        outcome
    }
}
