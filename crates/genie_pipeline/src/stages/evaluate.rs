//! Evaluate: tracking metrics and review schedule.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::org::{self, OrgSnapshot};
use crate::project::{EvaluationData, Project, ProjectPatch};
use crate::stage::StageId;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use tracing::info;

pub const DEFAULT_METRICS: [&str; 3] = ["completion_rate", "assessment_score", "time_spent"];

const DEFAULT_REVIEW_IN_DAYS: i64 = 30;

/// Optional payload of `configure_tracking`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrackingOptions {
    pub metrics: Option<Vec<String>>,
    pub survey_enabled: Option<bool>,
    pub review_in_days: Option<i64>,
}

pub struct ConfigureTracking;

#[async_trait]
impl StageAction for ConfigureTracking {
    fn check(&self, project: &Project, _org: &OrgSnapshot) -> Result<()> {
        if !org::can_evaluate(project) {
            return Err(PipelineError::prerequisite("deploy the course first"));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        let options: TrackingOptions = match ctx.payload {
            Some(payload) => serde_json::from_value(payload)
                .map_err(|e| PipelineError::validation(format!("bad tracking options: {}", e)))?,
            None => TrackingOptions::default(),
        };
        let pipeline = &ctx.pipeline;
        let current = pipeline
            .with_state(|state| state.project.evaluation.clone())
            .await
            .unwrap_or_default();

        let evaluation = configure(current, options);
        info!(
            "Tracking {} metric(s), survey {}",
            evaluation.metrics.len(),
            if evaluation.survey_enabled { "on" } else { "off" }
        );
        pipeline
            .update_project(ProjectPatch::new().evaluation(evaluation))
            .await;
        pipeline.complete_stage_if_ready(StageId::Evaluate).await;
        Ok(())
    }
}

/// Merge options over the current evaluation. Existing metrics are kept
/// unless the options name new ones; an empty set falls back to defaults.
fn configure(current: EvaluationData, options: TrackingOptions) -> EvaluationData {
    let mut metrics = options
        .metrics
        .unwrap_or(current.metrics)
        .into_iter()
        .filter(|m| !m.trim().is_empty())
        .collect::<Vec<_>>();
    if metrics.is_empty() {
        metrics = DEFAULT_METRICS.iter().map(|m| m.to_string()).collect();
    }
    let review_in = options.review_in_days.unwrap_or(DEFAULT_REVIEW_IN_DAYS).max(1);
    EvaluationData {
        metrics,
        survey_enabled: options.survey_enabled.unwrap_or(true),
        review_date: current
            .review_date
            .or_else(|| Some(Utc::now() + Duration::days(review_in))),
    }
}
