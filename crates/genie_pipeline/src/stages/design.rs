//! Design: objectives, module plan and instructional tactics.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::org::{self, OrgSnapshot, SourceDocument};
use crate::pipeline::Pipeline;
use crate::project::{DesignData, DesignModule, LessonPlan, LessonType, Project, ProjectPatch};
use crate::services::{fallback_objectives, validate_outline, OutlineModule};
use crate::stage::StageId;
use async_trait::async_trait;
use tracing::{info, warn};

const DEFAULT_ASSESSMENT_STRATEGY: &str = "Knowledge check at the end of every module";

pub struct GenerateDesign;

#[async_trait]
impl StageAction for GenerateDesign {
    fn check(&self, project: &Project, _org: &OrgSnapshot) -> Result<()> {
        if !org::can_design(project) {
            return Err(PipelineError::prerequisite("complete the analysis first"));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        generate_design(&ctx.pipeline).await.map(|_| ())
    }
}

/// Reuse the current design when it already plans lessons, else generate one.
pub async fn ensure_design(pipeline: &Pipeline) -> Result<DesignData> {
    let existing = pipeline
        .with_state(|state| state.project.design.clone())
        .await
        .filter(|d| d.total_lessons() > 0);
    match existing {
        Some(design) => Ok(design),
        None => generate_design(pipeline).await,
    }
}

pub async fn generate_design(pipeline: &Pipeline) -> Result<DesignData> {
    let (title, context, sources, prompt) = pipeline
        .with_state(|state| {
            let project = &state.project;
            let context = match &project.analysis {
                Some(analysis) => format!(
                    "Audience: {}. Needs: {}",
                    analysis.target_audience,
                    analysis.learning_needs.join("; ")
                ),
                None => project.description.clone(),
            };
            let sources: Vec<SourceDocument> = state
                .org
                .selected_sources(project)
                .into_iter()
                .cloned()
                .collect();
            (
                project.name.clone(),
                context,
                sources,
                project.latest_prompt(StageId::Design).map(String::from),
            )
        })
        .await;

    let generation = pipeline.generation();
    let count = pipeline.config().objective_count;

    let objectives = match generation.generate_objectives(&sources, &context, count).await {
        Ok(objectives) if !objectives.is_empty() => objectives,
        Ok(_) => {
            warn!("Objective generation returned nothing; using placeholders");
            fallback_objectives(&title, count)
        }
        Err(e) => {
            warn!("Objective generation failed, using placeholders: {}", e);
            fallback_objectives(&title, count)
        }
    };

    let outline = generation
        .generate_outline(&title, &sources, prompt.as_deref())
        .await?;
    if let Err(e) = validate_outline(&outline) {
        warn!("Rejected generated outline: {}", e);
        return Err(e.into());
    }
    let modules = design_modules(outline);

    let design = DesignData {
        course_title: title,
        objectives,
        modules,
        assessment_strategy: Some(DEFAULT_ASSESSMENT_STRATEGY.to_string()),
    };
    info!(
        "Designed \"{}\": {} module(s), {} lesson(s)",
        design.course_title,
        design.modules.len(),
        design.total_lessons()
    );

    pipeline
        .update_project(ProjectPatch::new().design(design.clone()))
        .await;
    pipeline.complete_stage_if_ready(StageId::Design).await;
    Ok(design)
}

/// Turn a validated outline into design modules with starting tactics.
fn design_modules(outline: Vec<OutlineModule>) -> Vec<DesignModule> {
    outline
        .into_iter()
        .map(|m| {
            let lessons: Vec<LessonPlan> = m
                .lessons
                .into_iter()
                .map(|l| LessonPlan {
                    title: l.title,
                    lesson_type: l.lesson_type,
                    duration_minutes: l.duration,
                    is_required: l.is_required,
                })
                .collect();
            let (active_learning, multimedia) = default_tactics(&lessons);
            DesignModule {
                title: m.title,
                lessons,
                active_learning,
                multimedia,
            }
        })
        .collect()
}

/// Starting tactics picked from the lesson mix.
pub fn default_tactics(lessons: &[LessonPlan]) -> (Vec<String>, Vec<String>) {
    let has = |kinds: &[LessonType]| lessons.iter().any(|l| kinds.contains(&l.lesson_type));

    let active = if has(&[LessonType::Quiz, LessonType::Interactive]) {
        "Knowledge check with feedback"
    } else {
        "Scenario discussion"
    };
    let media = if has(&[LessonType::Video, LessonType::Audio]) {
        "Narrated walkthrough"
    } else {
        "Illustrated slides"
    };
    (vec![active.to_string()], vec![media.to_string()])
}
