//! Implement: publish the course, enroll and notify learners.
//!
//! These are the only handlers that write organizational data, always through
//! the [`LearningPlatform`](crate::services::LearningPlatform) trait.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::events::ProjectEvent;
use crate::exceptions::{self, ExceptionPriority};
use crate::org::{self, OrgSnapshot};
use crate::pipeline::Pipeline;
use crate::project::{EnrollmentRule, Project, ProjectField};
use crate::stage::StageId;
use crate::stages::edit_implementation;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Assessments with fewer questions get a quality warning.
pub const MIN_ASSESSMENT_QUESTIONS: usize = 3;

const DEFAULT_DUE_IN_DAYS: i64 = 30;

pub struct Deploy;

#[async_trait]
impl StageAction for Deploy {
    fn check(&self, project: &Project, org: &OrgSnapshot) -> Result<()> {
        if !org::can_implement(project, org) {
            return Err(PipelineError::prerequisite(
                "deploying needs finished lessons, loaded members and at least one enrollment rule",
            ));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        let pipeline = &ctx.pipeline;
        create_course_and_assessments(pipeline).await?;
        enroll_members(pipeline).await?;
        notify_members(pipeline).await?;
        pipeline.complete_stage_if_ready(StageId::Implement).await;
        Ok(())
    }
}

/// Optional payload of `schedule_enrollment`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ScheduleOptions {
    pub start_in_days: i64,
    pub due_in_days: Option<i64>,
}

pub struct ScheduleEnrollment;

#[async_trait]
impl StageAction for ScheduleEnrollment {
    fn check(&self, project: &Project, _org: &OrgSnapshot) -> Result<()> {
        let has_rules = project
            .implementation
            .as_ref()
            .is_some_and(|i| !i.enrollment_rules.is_empty());
        if !has_rules {
            return Err(PipelineError::prerequisite("add an enrollment rule first"));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        let options: ScheduleOptions = match ctx.payload {
            Some(payload) => serde_json::from_value(payload)
                .map_err(|e| PipelineError::validation(format!("bad schedule options: {}", e)))?,
            None => ScheduleOptions::default(),
        };
        let start = Utc::now() + Duration::days(options.start_in_days.max(0));
        let due = start + Duration::days(options.due_in_days.unwrap_or(DEFAULT_DUE_IN_DAYS).max(1));
        info!("Scheduling enrollment: start {}, due {}", start, due);
        edit_implementation(&ctx.pipeline, move |implementation| {
            implementation.start_date = Some(start);
            implementation.due_date = Some(due);
        })
        .await;
        Ok(())
    }
}

/// Create the course (once) and its assessments. Returns the course id.
pub async fn create_course_and_assessments(pipeline: &Pipeline) -> Result<String> {
    let (org_id, draft, course_id) = pipeline
        .with_state(|state| {
            (
                state.org.org_id.clone(),
                state.project.draft.clone(),
                state
                    .project
                    .implementation
                    .as_ref()
                    .and_then(|i| i.course_id.clone()),
            )
        })
        .await;
    let draft = draft.ok_or_else(|| PipelineError::prerequisite("there is no draft to publish"))?;
    let platform = pipeline.platform();

    let course_id = match course_id {
        Some(id) => id,
        None => {
            let id = platform
                .create_course(&org_id, &draft)
                .await
                .map_err(|e| PipelineError::service(format!("course creation failed: {:#}", e)))?;
            info!("Created course {} for \"{}\"", id, draft.course_title);
            let stored = id.clone();
            edit_implementation(pipeline, move |implementation| {
                implementation.course_id = Some(stored);
            })
            .await;
            id
        }
    };

    let created = platform
        .create_assessments(&course_id, &draft)
        .await
        .map_err(|e| PipelineError::service(format!("assessment creation failed: {:#}", e)))?;

    let mut warnings = Vec::new();
    let mut assessment_ids = Vec::new();
    for assessment in created {
        if assessment.question_count == 0 {
            warnings.push(format!(
                "Assessment \"{}\" has no questions and was left out",
                assessment.title
            ));
            continue;
        }
        if assessment.question_count < MIN_ASSESSMENT_QUESTIONS {
            warnings.push(format!(
                "Assessment \"{}\" only has {} question(s)",
                assessment.title, assessment.question_count
            ));
        }
        assessment_ids.push(assessment.id);
    }
    for warning in &warnings {
        warn!("{}", warning);
    }
    info!("Attached {} assessment(s) to course {}", assessment_ids.len(), course_id);

    edit_implementation(pipeline, move |implementation| {
        implementation.assessment_ids = assessment_ids;
    })
    .await;
    if !warnings.is_empty() {
        pipeline
            .mutate(move |state| {
                for warning in &warnings {
                    state.raise_exception(
                        StageId::Implement,
                        exceptions::QUALITY_WARNING,
                        warning,
                        ExceptionPriority::Normal,
                    );
                }
                if let Some(draft) = state.project.draft.as_mut() {
                    draft.warnings.extend(warnings);
                    state.events.push(ProjectEvent::ProjectUpdated {
                        fields: vec![ProjectField::Draft],
                    });
                }
            })
            .await;
    }
    Ok(course_id)
}

/// Member ids matched by the rules, required enrollments first. A member
/// matched by both a required and an optional rule is enrolled as required.
fn enrollment_targets(org: &OrgSnapshot, rules: &[EnrollmentRule]) -> (Vec<String>, Vec<String>) {
    let required_rules: Vec<EnrollmentRule> = rules.iter().filter(|r| r.required).cloned().collect();
    let optional_rules: Vec<EnrollmentRule> = rules.iter().filter(|r| !r.required).cloned().collect();

    let required: Vec<String> = org
        .members_matching(&required_rules)
        .into_iter()
        .map(|m| m.id.clone())
        .collect();
    let taken: BTreeSet<&str> = required.iter().map(String::as_str).collect();
    let optional: Vec<String> = org
        .members_matching(&optional_rules)
        .into_iter()
        .filter(|m| !taken.contains(m.id.as_str()))
        .map(|m| m.id.clone())
        .collect();
    (required, optional)
}

/// Context shared by the enrollment and notification steps.
async fn rollout_context(pipeline: &Pipeline) -> Result<(String, Vec<String>, Vec<String>)> {
    pipeline
        .with_state(|state| -> Result<(String, Vec<String>, Vec<String>)> {
            let implementation = state
                .project
                .implementation
                .as_ref()
                .ok_or_else(|| PipelineError::prerequisite("add an enrollment rule first"))?;
            if implementation.enrollment_rules.is_empty() {
                return Err(PipelineError::prerequisite("add an enrollment rule first"));
            }
            let course_id = implementation
                .course_id
                .clone()
                .ok_or_else(|| PipelineError::prerequisite("the course has not been created yet"))?;
            if state.org.members.is_none() {
                return Err(PipelineError::prerequisite("the member directory is not loaded"));
            }
            let (required, optional) =
                enrollment_targets(&state.org, &implementation.enrollment_rules);
            Ok((course_id, required, optional))
        })
        .await
}

/// Enroll every member matched by the enrollment rules. Returns how many
/// enrollments the platform created.
pub async fn enroll_members(pipeline: &Pipeline) -> Result<usize> {
    let (course_id, required, optional) = rollout_context(pipeline).await?;
    let platform = pipeline.platform();

    let mut enrolled = 0;
    for (members, is_required) in [(required, true), (optional, false)] {
        if members.is_empty() {
            continue;
        }
        enrolled += platform
            .enroll(&course_id, &members, is_required)
            .await
            .map_err(|e| PipelineError::service(format!("enrollment failed: {:#}", e)))?;
    }
    info!("Enrolled {} member(s) in course {}", enrolled, course_id);

    edit_implementation(pipeline, move |implementation| {
        implementation.enrolled_count = enrolled;
    })
    .await;
    Ok(enrolled)
}

/// Tell enrolled members about the course and stamp the deployment.
pub async fn notify_members(pipeline: &Pipeline) -> Result<usize> {
    let (course_id, mut members, optional) = rollout_context(pipeline).await?;
    members.extend(optional);

    let notified = if members.is_empty() {
        0
    } else {
        pipeline
            .platform()
            .notify(&course_id, &members)
            .await
            .map_err(|e| PipelineError::service(format!("notification failed: {:#}", e)))?
    };
    info!("Notified {} member(s) about course {}", notified, course_id);

    edit_implementation(pipeline, move |implementation| {
        implementation.notified_count = notified;
        implementation.deployed_at = Some(Utc::now());
    })
    .await;
    Ok(notified)
}
