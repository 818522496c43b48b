//! Develop: lesson content generation and the draft quality gate.
//!
//! Lessons are generated one at a time, in module order, with a progress
//! report after each. A failing lesson records its own error and does not
//! stop the others. Lessons that already have content are left alone, so
//! running the action again only fills the gaps. Every quality-gate finding
//! also opens a `quality_warning` exception.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::events::ProjectEvent;
use crate::exceptions::{self, ExceptionPriority};
use crate::org::{self, OrgSnapshot, SourceDocument};
use crate::pipeline::Pipeline;
use crate::project::{DraftData, Project, ProjectField, ProjectPatch};
use crate::services::LessonRequest;
use crate::stage::StageId;
use crate::stages::edit_draft;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Descriptions shorter than this get a quality-gate warning.
pub const MIN_DESCRIPTION_LEN: usize = 24;

pub struct GenerateLessons;

#[async_trait]
impl StageAction for GenerateLessons {
    fn check(&self, project: &Project, _org: &OrgSnapshot) -> Result<()> {
        if !org::can_develop(project) {
            return Err(PipelineError::prerequisite(
                "complete a design with at least one lesson first",
            ));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        let report = generate_lessons(&ctx.pipeline).await?;
        if report.failed > 0 {
            return Err(PipelineError::service(format!(
                "{} of {} lessons failed to generate",
                report.failed, report.total
            )));
        }
        Ok(())
    }
}

/// Outcome of one generation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LessonReport {
    pub total: usize,
    pub generated: usize,
    pub failed: usize,
    /// Already had content before this pass
    pub skipped: usize,
}

/// Keep a draft that matches the design's shape, else lay out a fresh one.
pub async fn ensure_draft(pipeline: &Pipeline) -> Result<DraftData> {
    let (design, existing) = pipeline
        .with_state(|state| (state.project.design.clone(), state.project.draft.clone()))
        .await;
    let design =
        design.ok_or_else(|| PipelineError::prerequisite("there is no design to build a draft from"))?;

    if let Some(draft) = existing.filter(|d| matches_design(d, &design)) {
        return Ok(draft);
    }

    let draft = DraftData::from_design(&design);
    debug!("Laid out draft with {} lesson slot(s)", draft.total_lessons());
    pipeline
        .update_project(ProjectPatch::new().draft(draft.clone()))
        .await;
    Ok(draft)
}

fn matches_design(draft: &DraftData, design: &crate::project::DesignData) -> bool {
    draft.modules.len() == design.modules.len()
        && draft
            .modules
            .iter()
            .zip(&design.modules)
            .all(|(d, m)| d.title == m.title && d.lessons.len() == m.lessons.len())
}

pub async fn generate_lessons(pipeline: &Pipeline) -> Result<LessonReport> {
    let draft = ensure_draft(pipeline).await?;
    let (sources, prompt, description) = pipeline
        .with_state(|state| {
            let sources: Vec<SourceDocument> = state
                .org
                .selected_sources(&state.project)
                .into_iter()
                .cloned()
                .collect();
            (
                sources,
                state.project.latest_prompt(StageId::Develop).map(String::from),
                state.project.description.clone(),
            )
        })
        .await;

    let generation = pipeline.generation();
    let mut report = LessonReport {
        total: draft.total_lessons(),
        ..Default::default()
    };
    let mut done = 0;
    pipeline.report_progress(0, report.total).await;

    for (module_idx, module) in draft.modules.iter().enumerate() {
        for (lesson_idx, lesson) in module.lessons.iter().enumerate() {
            done += 1;
            if lesson.is_generated() {
                report.skipped += 1;
                pipeline.report_progress(done, report.total).await;
                continue;
            }

            let request = LessonRequest {
                course_title: draft.course_title.clone(),
                module_title: module.title.clone(),
                lesson_title: lesson.title.clone(),
                lesson_type: lesson.lesson_type,
                sources: sources.clone(),
                prompt: prompt.clone(),
            };
            let result = generation.generate_lesson_content(&request).await;

            match &result {
                Ok(_) => report.generated += 1,
                Err(e) => {
                    warn!("Lesson \"{}\" failed: {}", lesson.title, e);
                    report.failed += 1;
                }
            }
            edit_draft(pipeline, move |draft| {
                let Some(slot) = draft
                    .modules
                    .get_mut(module_idx)
                    .and_then(|m| m.lessons.get_mut(lesson_idx))
                else {
                    return;
                };
                match result {
                    Ok(content) => {
                        slot.content = Some(content.content);
                        slot.duration_minutes = content.duration.or(slot.duration_minutes);
                        slot.is_required = content.is_required.or(slot.is_required);
                        slot.error = None;
                    }
                    Err(e) => slot.error = Some(e.to_string()),
                }
            })
            .await;
            pipeline.report_progress(done, report.total).await;
        }
    }

    pipeline
        .mutate(move |state| {
            let Some(draft) = state.project.draft.as_mut() else {
                return;
            };
            draft.warnings = quality_warnings(draft, &description);
            let warnings = draft.warnings.clone();
            state.events.push(ProjectEvent::ProjectUpdated {
                fields: vec![ProjectField::Draft],
            });
            for warning in &warnings {
                state.raise_exception(
                    StageId::Develop,
                    exceptions::QUALITY_WARNING,
                    warning,
                    ExceptionPriority::Normal,
                );
            }
        })
        .await;

    info!(
        "Lesson generation: {} generated, {} failed, {} already done of {}",
        report.generated, report.failed, report.skipped, report.total
    );
    pipeline.complete_stage_if_ready(StageId::Develop).await;
    Ok(report)
}

/// Findings that keep a draft from being launch-quality.
pub fn quality_warnings(draft: &DraftData, description: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    if description.trim().len() < MIN_DESCRIPTION_LEN {
        warnings.push(format!(
            "The course description is shorter than {} characters",
            MIN_DESCRIPTION_LEN
        ));
    }
    for module in &draft.modules {
        if module.lessons.is_empty() {
            warnings.push(format!("Module \"{}\" has no lessons", module.title));
        }
        for lesson in &module.lessons {
            if let Some(error) = &lesson.error {
                warnings.push(format!("Lesson \"{}\" failed to generate: {}", lesson.title, error));
            }
        }
    }
    warnings
}
