//! Analyze: audience and learning needs.

use crate::actions::{ActionContext, StageAction};
use crate::error::{PipelineError, Result};
use crate::org::{self, OrgSnapshot, SourceDocument};
use crate::pipeline::Pipeline;
use crate::project::{AnalysisData, Project, ProjectPatch};
use crate::services::fallback_objectives;
use crate::stage::StageId;
use async_trait::async_trait;
use tracing::{info, warn};

const ANALYSIS_SYSTEM_PROMPT: &str = "You are an instructional designer. \
Describe the training context for this audience in three sentences.";

pub struct RunAnalysis;

#[async_trait]
impl StageAction for RunAnalysis {
    fn check(&self, project: &Project, org: &OrgSnapshot) -> Result<()> {
        if !org::can_analyze(project, org) {
            return Err(PipelineError::prerequisite(
                "analysis needs selected sources and loaded members, departments and teams",
            ));
        }
        Ok(())
    }

    async fn run(&self, ctx: ActionContext) -> Result<()> {
        run_analysis(&ctx.pipeline).await.map(|_| ())
    }
}

/// "42 members across Sales, Support" or "42 members".
pub fn describe_audience(org: &OrgSnapshot) -> String {
    let members = org.members().len();
    let departments: Vec<&str> = org
        .departments
        .iter()
        .flatten()
        .map(|d| d.name.as_str())
        .collect();
    if departments.is_empty() {
        format!("{} members", members)
    } else {
        format!("{} members across {}", members, departments.join(", "))
    }
}

pub async fn run_analysis(pipeline: &Pipeline) -> Result<AnalysisData> {
    let (name, description, audience, sources, prompt) = pipeline
        .with_state(|state| {
            let sources: Vec<SourceDocument> = state
                .org
                .selected_sources(&state.project)
                .into_iter()
                .cloned()
                .collect();
            (
                state.project.name.clone(),
                state.project.description.clone(),
                describe_audience(&state.org),
                sources,
                state.project.latest_prompt(StageId::Analyze).map(String::from),
            )
        })
        .await;

    let generation = pipeline.generation();
    let count = pipeline.config().objective_count;
    let context = format!("Training needs of {} for \"{}\"", audience, name);

    let learning_needs = match generation.generate_objectives(&sources, &context, count).await {
        Ok(needs) if !needs.is_empty() => needs,
        Ok(_) => {
            warn!("Needs analysis returned nothing; using placeholders");
            fallback_objectives(&name, count)
        }
        Err(e) => {
            warn!("Needs analysis failed, using placeholders: {}", e);
            fallback_objectives(&name, count)
        }
    };

    let mut user_prompt = format!("Course: {}\nAudience: {}\n{}", name, audience, description);
    if let Some(prompt) = prompt {
        user_prompt.push_str("\nNotes: ");
        user_prompt.push_str(&prompt);
    }
    let summary = match generation
        .chat_completion(ANALYSIS_SYSTEM_PROMPT, &user_prompt)
        .await
    {
        Ok(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Ok(_) => None,
        Err(e) => {
            warn!("Analysis summary unavailable: {}", e);
            None
        }
    };

    let analysis = AnalysisData {
        target_audience: audience,
        learning_needs,
        skill_gaps: Vec::new(),
        summary,
    };
    info!(
        "Analysis found {} learning need(s) for {}",
        analysis.learning_needs.len(),
        analysis.target_audience
    );

    pipeline
        .update_project(ProjectPatch::new().analysis(analysis.clone()))
        .await;
    pipeline.complete_stage_if_ready(StageId::Analyze).await;
    Ok(analysis)
}
