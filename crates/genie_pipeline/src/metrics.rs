//! Per-phase run metrics.
//!
//! Every finished stage action and every launch step that actually ran leaves
//! one [`RunMetric`] on the project. Launch steps carry the run id; actions
//! started outside a launch do not.

use crate::project::{ActionStatus, Project};
use crate::stage::StageId;
use chrono::serde::ts_milliseconds;
use chrono::{DateTime, Utc};
use genie_ids::RunId;
use serde::{Deserialize, Serialize};

/// Metrics kept on the project; the oldest are dropped first.
pub const MAX_RUN_METRICS: usize = 250;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetric {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub stage: StageId,
    /// Action name, or launch step name for launch runs
    pub phase: String,
    pub status: ActionStatus,
    pub duration_ms: i64,
    /// Failed attempts of the same phase directly before this one
    #[serde(default)]
    pub retry_count: u32,
    #[serde(with = "ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

/// Consecutive failures of `(stage, phase)` at the end of the log.
pub fn retry_count(project: &Project, stage: StageId, phase: &str) -> u32 {
    project
        .run_metrics
        .iter()
        .rev()
        .filter(|m| m.stage == stage && m.phase == phase)
        .take_while(|m| m.status == ActionStatus::Error)
        .count() as u32
}

/// Append a metric for a phase that started at `started_at` and just ended.
pub fn record(
    project: &mut Project,
    run_id: Option<RunId>,
    stage: StageId,
    phase: &str,
    status: ActionStatus,
    started_at: DateTime<Utc>,
) {
    let now = Utc::now();
    let metric = RunMetric {
        run_id,
        stage,
        phase: phase.to_string(),
        status,
        duration_ms: (now - started_at).num_milliseconds().max(0),
        retry_count: retry_count(project, stage, phase),
        created_at: now,
    };
    project.run_metrics.push(metric);
    let overflow = project.run_metrics.len().saturating_sub(MAX_RUN_METRICS);
    if overflow > 0 {
        project.run_metrics.drain(..overflow);
    }
}

/// Newest first, optionally limited to one launch run.
pub fn query(project: &Project, run_id: Option<&RunId>) -> Vec<RunMetric> {
    project
        .run_metrics
        .iter()
        .rev()
        .filter(|m| run_id.map_or(true, |id| m.run_id.as_ref() == Some(id)))
        .cloned()
        .collect()
}
